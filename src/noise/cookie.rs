//! MAC1/MAC2 and cookie machinery
//!
//! Every handshake frame ends in two 16-byte MACs. MAC1 proves knowledge of
//! the receiver's public key and is verified unconditionally. MAC2 is keyed
//! by a cookie the receiver hands out while under load; it proves the sender
//! owns the source address it is flooding from.

use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{aead, blake2s};
use crate::error::ProtocolError;
use crate::message::CookieReply;
use crate::noise::{COOKIE_EXPIRATION_TIME, LABEL_COOKIE, LABEL_MAC1};

/// Cookie length
pub const COOKIE_LEN: usize = 16;

/// MAC1 key for frames sent *to* the holder of `public_key`
pub fn mac1_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, public_key)
}

/// Cookie-sealing key for replies issued *by* the holder of `public_key`
pub fn cookie_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, public_key)
}

/// Verify the MAC1 field of a handshake frame
///
/// `mac1_offset` is where the MAC starts; everything before it is input.
pub fn verify_mac1(
    frame: &[u8],
    mac1_offset: usize,
    key: &[u8; 32],
) -> Result<(), ProtocolError> {
    if frame.len() < mac1_offset + 16 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: mac1_offset + 16,
            got: frame.len(),
        });
    }

    let expected = blake2s::mac16(key, &frame[..mac1_offset]);
    if frame[mac1_offset..mac1_offset + 16] != expected {
        return Err(ProtocolError::MacVerificationFailed);
    }
    Ok(())
}

fn addr_bytes(addr: SocketAddr) -> ([u8; 18], usize) {
    let mut buf = [0u8; 18];
    let len = match addr.ip() {
        std::net::IpAddr::V4(ip) => {
            buf[..4].copy_from_slice(&ip.octets());
            buf[4..6].copy_from_slice(&addr.port().to_le_bytes());
            6
        }
        std::net::IpAddr::V6(ip) => {
            buf[..16].copy_from_slice(&ip.octets());
            buf[16..18].copy_from_slice(&addr.port().to_le_bytes());
            18
        }
    };
    (buf, len)
}

/// Responder-side cookie issuer
///
/// Holds a random secret rotated every two minutes. The cookie for a source
/// address is a keyed MAC of its ip and port under the current secret, so no
/// per-client state is kept.
pub struct CookieIssuer {
    secret: [u8; 16],
    secret_birth: Instant,
    cookie_seal_key: [u8; 32],
}

impl CookieIssuer {
    /// `public_key` is this device's static public key
    pub fn new(public_key: &[u8; 32]) -> Self {
        let mut secret = [0u8; 16];
        OsRng.fill_bytes(&mut secret);
        Self {
            secret,
            secret_birth: Instant::now(),
            cookie_seal_key: cookie_key(public_key),
        }
    }

    fn current_cookie(&mut self, src: SocketAddr, now: Instant) -> [u8; COOKIE_LEN] {
        if now.duration_since(self.secret_birth) >= COOKIE_EXPIRATION_TIME {
            OsRng.fill_bytes(&mut self.secret);
            self.secret_birth = now;
        }

        let (buf, len) = addr_bytes(src);
        blake2s::mac16_keyed16(&self.secret, &buf[..len])
    }

    /// Build a cookie reply for a frame whose MAC2 was missing or invalid
    ///
    /// `receiver_index` is the sender index of the offending frame, `mac1`
    /// its MAC1 field (used as associated data).
    pub fn make_reply(
        &mut self,
        receiver_index: u32,
        src: SocketAddr,
        mac1: &[u8; 16],
        now: Instant,
    ) -> Result<CookieReply, ProtocolError> {
        let cookie = self.current_cookie(src, now);

        let mut nonce = [0u8; aead::XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = aead::xencrypt(&self.cookie_seal_key, &nonce, &cookie, mac1)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let sealed_cookie: [u8; 32] = sealed.try_into().expect("cookie seals to 32 bytes");

        Ok(CookieReply {
            receiver_index,
            nonce,
            sealed_cookie,
        })
    }

    /// Verify the MAC2 field of a handshake frame against the current cookie
    pub fn verify_mac2(&mut self, frame: &[u8], mac2_offset: usize, src: SocketAddr, now: Instant) -> bool {
        if frame.len() < mac2_offset + 16 {
            return false;
        }

        let cookie = self.current_cookie(src, now);
        let expected = blake2s::mac16_keyed16(&cookie, &frame[..mac2_offset]);
        frame[mac2_offset..mac2_offset + 16] == expected
    }
}

/// Initiator-side cookie state, one per peer
///
/// Remembers the last MAC1 we sent (a cookie reply is bound to it) and the
/// decrypted cookie with its freshness timestamp.
pub struct CookieStore {
    cookie: Option<[u8; COOKIE_LEN]>,
    received_at: Option<Instant>,
    last_mac1_sent: [u8; 16],
}

impl Default for CookieStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieStore {
    pub fn new() -> Self {
        Self {
            cookie: None,
            received_at: None,
            last_mac1_sent: [0u8; 16],
        }
    }

    fn fresh_cookie(&self, now: Instant) -> Option<&[u8; COOKIE_LEN]> {
        match (&self.cookie, self.received_at) {
            (Some(cookie), Some(at)) if now.duration_since(at) < COOKIE_EXPIRATION_TIME => {
                Some(cookie)
            }
            _ => None,
        }
    }

    /// Fill in MAC1 (and MAC2 when a fresh cookie is held) on an outgoing
    /// handshake frame; remembers the MAC1 for matching a cookie reply
    pub fn apply_macs(
        &mut self,
        mac1_key: &[u8; 32],
        frame: &mut [u8],
        mac1_offset: usize,
        now: Instant,
    ) {
        let mac1 = blake2s::mac16(mac1_key, &frame[..mac1_offset]);
        frame[mac1_offset..mac1_offset + 16].copy_from_slice(&mac1);
        self.last_mac1_sent = mac1;

        let mac2_offset = mac1_offset + 16;
        if let Some(cookie) = self.fresh_cookie(now) {
            let mac2 = blake2s::mac16_keyed16(cookie, &frame[..mac2_offset]);
            frame[mac2_offset..mac2_offset + 16].copy_from_slice(&mac2);
        } else {
            frame[mac2_offset..mac2_offset + 16].fill(0);
        }
    }

    /// Decrypt a cookie reply and store the cookie
    ///
    /// `issuer_public` is the static public key of the peer that sent the
    /// reply; the reply is bound to the last MAC1 we sent it.
    pub fn consume_reply(
        &mut self,
        reply: &CookieReply,
        issuer_public: &[u8; 32],
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let key = cookie_key(issuer_public);

        let cookie = aead::xdecrypt(&key, &reply.nonce, &reply.sealed_cookie, &self.last_mac1_sent)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let cookie: [u8; COOKIE_LEN] = cookie
            .try_into()
            .map_err(|_| ProtocolError::MacVerificationFailed)?;

        self.cookie = Some(cookie);
        self.received_at = Some(now);

        tracing::debug!("stored cookie from peer");
        Ok(())
    }

    /// Whether a fresh cookie is currently held
    pub fn has_fresh_cookie(&self, now: Instant) -> bool {
        self.fresh_cookie(now).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn src() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 51820)
    }

    fn frame_with_macs(store: &mut CookieStore, key: &[u8; 32], now: Instant) -> Vec<u8> {
        // A 148-byte initiation-shaped frame: MAC1 at 116, MAC2 at 132
        let mut frame = vec![0xabu8; 148];
        store.apply_macs(key, &mut frame, 116, now);
        frame
    }

    #[test]
    fn mac1_roundtrip() {
        let key = mac1_key(&[7u8; 32]);
        let mut store = CookieStore::new();
        let frame = frame_with_macs(&mut store, &key, Instant::now());

        verify_mac1(&frame, 116, &key).unwrap();

        let mut tampered = frame.clone();
        tampered[0] ^= 1;
        assert!(verify_mac1(&tampered, 116, &key).is_err());
    }

    #[test]
    fn mac2_zero_without_cookie() {
        let key = mac1_key(&[7u8; 32]);
        let mut store = CookieStore::new();
        let frame = frame_with_macs(&mut store, &key, Instant::now());
        assert!(frame[132..148].iter().all(|&b| b == 0));
    }

    #[test]
    fn cookie_dance() {
        let now = Instant::now();
        let responder_public = [9u8; 32];
        let mut issuer = CookieIssuer::new(&responder_public);

        let mac1_key = mac1_key(&responder_public);
        let mut store = CookieStore::new();

        // First frame carries no MAC2; the responder hands out a cookie
        let frame = frame_with_macs(&mut store, &mac1_key, now);
        assert!(!issuer.verify_mac2(&frame, 132, src(), now));

        let mac1: [u8; 16] = frame[116..132].try_into().unwrap();
        let reply = issuer.make_reply(55, src(), &mac1, now).unwrap();

        store.consume_reply(&reply, &responder_public, now).unwrap();
        assert!(store.has_fresh_cookie(now));

        // The next frame carries a MAC2 the issuer accepts
        let frame = frame_with_macs(&mut store, &mac1_key, now);
        assert!(issuer.verify_mac2(&frame, 132, src(), now));

        // A different source address does not validate
        let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 51820);
        assert!(!issuer.verify_mac2(&frame, 132, other, now));
    }

    #[test]
    fn cookie_expires() {
        let now = Instant::now();
        let responder_public = [9u8; 32];
        let mut issuer = CookieIssuer::new(&responder_public);
        let key = mac1_key(&responder_public);
        let mut store = CookieStore::new();

        let frame = frame_with_macs(&mut store, &key, now);
        let mac1: [u8; 16] = frame[116..132].try_into().unwrap();
        let reply = issuer.make_reply(55, src(), &mac1, now).unwrap();
        store.consume_reply(&reply, &responder_public, now).unwrap();

        let later = now + COOKIE_EXPIRATION_TIME + Duration::from_secs(1);
        assert!(!store.has_fresh_cookie(later));

        let frame = frame_with_macs(&mut store, &key, later);
        assert!(frame[132..148].iter().all(|&b| b == 0));
    }

    #[test]
    fn reply_bound_to_wrong_mac1_rejected() {
        let now = Instant::now();
        let responder_public = [9u8; 32];
        let mut issuer = CookieIssuer::new(&responder_public);
        let key = mac1_key(&responder_public);
        let mut store = CookieStore::new();

        let frame = frame_with_macs(&mut store, &key, now);
        let _mac1: [u8; 16] = frame[116..132].try_into().unwrap();

        // Reply sealed against a different MAC1
        let reply = issuer.make_reply(55, src(), &[0u8; 16], now).unwrap();
        assert!(store.consume_reply(&reply, &responder_public, now).is_err());
        assert!(!store.has_fresh_cookie(now));
    }
}
