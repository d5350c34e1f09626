//! Per-peer state
//!
//! A peer owns its handshake block, its three key-pair slots, its cookie
//! state, and its timers, each behind its own lock. Locks are always taken
//! in device → peer → handshake/sessions order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tai64::Tai64N;
use tokio::sync::Notify;

use crate::device::session::Session;
use crate::device::timers::Timers;
use crate::noise::cookie::{mac1_key, CookieStore};
use crate::noise::handshake::Handshake;
use crate::udp::Endpoint;

/// The three key-pair slots of a peer
#[derive(Default)]
struct SessionSlots {
    previous: Option<Arc<Session>>,
    current: Option<Arc<Session>>,
    next: Option<Arc<Session>>,
}

pub struct Peer {
    public_key: [u8; 32],
    /// DH(device static, peer static), recomputed when either key changes
    precomputed_ss: Mutex<[u8; 32]>,
    psk: Mutex<[u8; 32]>,
    /// MAC1 key for frames sent to this peer
    mac1_key: [u8; 32],

    endpoint: RwLock<Option<Endpoint>>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,
    /// Greatest TAI64N accepted in an initiation; replays must exceed it
    greatest_timestamp: Mutex<Option<Tai64N>>,

    pub(crate) handshake: Mutex<Handshake>,
    sessions: Mutex<SessionSlots>,
    pub(crate) cookies: Mutex<CookieStore>,
    pub(crate) timers: Mutex<Timers>,

    /// Wakes nonce workers parked on "no usable key-pair"
    key_ready: Notify,

    /// Work queues, attached while the peer's pipeline tasks run
    pub(crate) pipeline: Mutex<Option<crate::device::pipeline::PeerQueues>>,
}

impl Peer {
    pub fn new(
        public_key: [u8; 32],
        precomputed_ss: [u8; 32],
        psk: Option<[u8; 32]>,
        endpoint: Option<SocketAddr>,
        persistent_keepalive: Option<u16>,
    ) -> Self {
        Self {
            public_key,
            precomputed_ss: Mutex::new(precomputed_ss),
            psk: Mutex::new(psk.unwrap_or([0u8; 32])),
            mac1_key: mac1_key(&public_key),
            endpoint: RwLock::new(endpoint.map(Endpoint::new)),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
            greatest_timestamp: Mutex::new(None),
            handshake: Mutex::new(Handshake::new()),
            sessions: Mutex::new(SessionSlots::default()),
            cookies: Mutex::new(CookieStore::new()),
            timers: Mutex::new(Timers::new(persistent_keepalive, Instant::now())),
            key_ready: Notify::new(),
            pipeline: Mutex::new(None),
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn precomputed_ss(&self) -> [u8; 32] {
        *self.precomputed_ss.lock()
    }

    pub fn set_precomputed_ss(&self, ss: [u8; 32]) {
        *self.precomputed_ss.lock() = ss;
    }

    pub fn psk(&self) -> [u8; 32] {
        *self.psk.lock()
    }

    pub fn set_psk(&self, psk: Option<[u8; 32]>) {
        *self.psk.lock() = psk.unwrap_or([0u8; 32]);
    }

    /// MAC1 key for frames we send to this peer
    pub fn mac1_key(&self) -> &[u8; 32] {
        &self.mac1_key
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    pub fn set_endpoint_addr(&self, addr: SocketAddr) {
        let mut endpoint = self.endpoint.write();
        match endpoint.as_mut() {
            Some(ep) if ep.addr == addr => {}
            _ => *endpoint = Some(Endpoint::new(addr)),
        }
    }

    /// Forget the cached local source; called when the UDP bind changes
    pub fn clear_endpoint_src(&self) {
        if let Some(ep) = self.endpoint.write().as_mut() {
            ep.clear_src();
        }
    }

    pub fn add_tx_bytes(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx_bytes(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn mark_handshake_complete(&self) {
        *self.last_handshake.lock() = Some(SystemTime::now());
    }

    pub fn last_handshake(&self) -> Option<SystemTime> {
        *self.last_handshake.lock()
    }

    /// Accept `timestamp` only if strictly newer than the stored one
    pub fn check_and_store_timestamp(&self, timestamp: Tai64N) -> bool {
        let mut stored = self.greatest_timestamp.lock();
        match *stored {
            Some(prev) if timestamp <= prev => false,
            _ => {
                *stored = Some(timestamp);
                true
            }
        }
    }

    /// Install a key-pair derived as initiator into the `next` slot
    ///
    /// Returns the displaced key-pair, whose index must be unregistered.
    pub fn install_initiator_session(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let displaced = self.sessions.lock().next.replace(session);
        self.key_ready.notify_waiters();
        displaced
    }

    /// Install a key-pair derived as responder into `current`, shifting the
    /// old current to `previous`
    ///
    /// Returns the key-pairs that fell off the rotation.
    pub fn install_responder_session(&self, session: Arc<Session>) -> Vec<Arc<Session>> {
        let mut displaced = Vec::new();
        {
            let mut slots = self.sessions.lock();
            let old_current = slots.current.take();
            if let Some(old_previous) = std::mem::replace(&mut slots.previous, old_current) {
                displaced.push(old_previous);
            }
            slots.current = Some(session);
        }
        self.key_ready.notify_waiters();
        displaced
    }

    /// The key-pair to send under right now, if any
    pub fn sendable_session(&self, now: Instant) -> Option<Arc<Session>> {
        let slots = self.sessions.lock();
        if let Some(current) = &slots.current {
            if current.sendable(now) {
                return Some(Arc::clone(current));
            }
        }
        slots.next.as_ref().filter(|s| s.sendable(now)).cloned()
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.sessions.lock().current.clone()
    }

    /// Rotate slots when a packet authenticated under `next` arrives:
    /// next becomes current, current becomes previous, and the displaced
    /// previous is returned for destruction.
    pub fn promote_next_on_receive(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let mut slots = self.sessions.lock();
        let is_next = slots
            .next
            .as_ref()
            .is_some_and(|next| Arc::ptr_eq(next, session));
        if !is_next {
            return None;
        }

        let displaced = slots.previous.take();
        slots.previous = slots.current.take();
        slots.current = slots.next.take();
        displaced
    }

    /// Drain every key-pair slot (key erasure, peer removal)
    pub fn clear_sessions(&self) -> Vec<Arc<Session>> {
        let mut slots = self.sessions.lock();
        [slots.previous.take(), slots.current.take(), slots.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Wake nonce workers waiting for a usable key-pair
    pub fn notify_key_ready(&self) {
        self.key_ready.notify_waiters();
    }

    pub async fn wait_key_ready(&self) {
        self.key_ready.notified().await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({})", hex::encode(&self.public_key[..8]))
    }
}
