//! Transport sessions (key-pairs)
//!
//! A `Session` is one derived key-pair: the send/receive AEAD keys, the
//! atomically assigned send counter, the replay window, and the session
//! indices. It is evicted by age, by counter exhaustion, or by slot
//! rotation; destruction zeroizes the key bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::crypto::aead;
use crate::device::replay::ReplayWindow;
use crate::error::{CryptoError, ProtocolError};
use crate::noise::handshake::SessionKeys;
use crate::noise::{REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME};

pub struct Session {
    local_index: u32,
    remote_index: u32,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
    created: Instant,
    is_initiator: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session({} <-> {}, initiator={})",
            self.local_index, self.remote_index, self.is_initiator
        )
    }
}

impl Session {
    pub fn new(keys: SessionKeys, now: Instant) -> Self {
        Self {
            local_index: keys.local_index,
            remote_index: keys.remote_index,
            send_key: keys.send_key,
            recv_key: keys.recv_key,
            send_counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
            created: now,
            is_initiator: keys.is_initiator,
        }
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created)
    }

    /// Counter of the next packet to be sent (without assigning it)
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// Atomically assign the next nonce, or None once the key-pair may no
    /// longer send (counter exhausted or aged out)
    pub fn try_next_counter(&self, now: Instant) -> Option<u64> {
        if self.age(now) >= REJECT_AFTER_TIME {
            return None;
        }
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        (counter < REJECT_AFTER_MESSAGES).then_some(counter)
    }

    /// Whether this key-pair could currently assign a nonce
    pub fn sendable(&self, now: Instant) -> bool {
        self.age(now) < REJECT_AFTER_TIME
            && self.send_counter.load(Ordering::Relaxed) < REJECT_AFTER_MESSAGES
    }

    /// Whether packets under this key-pair are still accepted
    pub fn receivable(&self, now: Instant) -> bool {
        self.age(now) < REJECT_AFTER_TIME
    }

    /// Cheap pre-decryption replay check
    pub fn counter_quick_check(&self, counter: u64) -> Result<(), ProtocolError> {
        if self.replay.lock().would_accept(counter) {
            Ok(())
        } else {
            Err(ProtocolError::ReplayDetected { counter })
        }
    }

    /// Authoritative post-decryption replay commit
    pub fn counter_commit(&self, counter: u64) -> Result<(), ProtocolError> {
        if self.replay.lock().check_and_update(counter) {
            Ok(())
        } else {
            Err(ProtocolError::ReplayDetected { counter })
        }
    }

    /// Seal `buf[..msg_len]` in place under the send key
    pub fn seal_in_place(
        &self,
        counter: u64,
        buf: &mut [u8],
        msg_len: usize,
    ) -> Result<usize, CryptoError> {
        aead::seal_in_place(&self.send_key, counter, buf, msg_len)
    }

    /// Open `buf` (ciphertext || tag) in place under the receive key
    pub fn open_in_place(&self, counter: u64, buf: &mut [u8]) -> Result<usize, CryptoError> {
        aead::open_in_place(&self.recv_key, counter, buf)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.send_key = [0u8; 32];
        self.recv_key = [0u8; 32];
    }
}
