//! Noise IKpsk2 handshake state machine
//!
//! One `Handshake` lives in each peer, mutated only under the peer's
//! handshake lock. The same object drives both roles: the initiator path is
//! create-initiation / consume-response, the responder path is
//! consume-initiation / create-response. Completing either path yields the
//! transport keys and zeroizes the chaining state.

use tai64::Tai64N;

use crate::crypto::{aead, blake2s, x25519};
use crate::error::ProtocolError;
use crate::message::{HandshakeInitiation, HandshakeResponse};
use crate::noise::{CONSTRUCTION, IDENTIFIER};

/// Handshake progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

/// The device's static identity, shared by every peer's handshake
#[derive(Clone)]
pub struct LocalIdentity {
    pub private: [u8; 32],
    pub public: [u8; 32],
}

impl LocalIdentity {
    pub fn new(private: [u8; 32]) -> Self {
        let public = x25519::public_key(&private);
        Self { private, public }
    }
}

/// Transport keys and indices produced by a completed handshake
#[derive(Debug)]
pub struct SessionKeys {
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
    pub local_index: u32,
    pub remote_index: u32,
    pub is_initiator: bool,
}

/// Chaining state consumed out of a valid initiation, pending peer lookup
///
/// The decrypted static key identifies the peer; the timestamp must be
/// checked against the peer's stored one before this is committed into the
/// peer's handshake with [`Handshake::commit_initiation`].
pub struct ConsumedInitiation {
    pub peer_static: [u8; 32],
    pub timestamp: Tai64N,
    chaining_key: [u8; 32],
    hash: [u8; 32],
    remote_ephemeral: [u8; 32],
    remote_index: u32,
}

/// Per-peer handshake block
pub struct Handshake {
    state: State,
    chaining_key: [u8; 32],
    hash: [u8; 32],
    ephemeral_private: [u8; 32],
    local_index: u32,
    remote_index: u32,
    remote_ephemeral: [u8; 32],
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// ck = HASH(CONSTRUCTION); h = HASH(HASH(ck || IDENTIFIER) || responder_static)
fn initial_state(responder_static: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let ck = blake2s::hash(CONSTRUCTION);
    let h = blake2s::hash_two(&blake2s::hash_two(&ck, IDENTIFIER), responder_static);
    (ck, h)
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: State::Zeroed,
            chaining_key: [0u8; 32],
            hash: [0u8; 32],
            ephemeral_private: [0u8; 32],
            local_index: 0,
            remote_index: 0,
            remote_ephemeral: [0u8; 32],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The index the in-flight handshake is registered under, if any
    pub fn local_index(&self) -> Option<u32> {
        (self.local_index != 0).then_some(self.local_index)
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// (ck, k) = KDF2(ck, input); returns k
    fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// ck = KDF1(ck, input); no key output
    fn mix_chain(&mut self, input: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, input);
    }

    /// (ck, tau, k) = KDF3(ck, psk); mixes tau into the hash, returns k
    fn mix_psk(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (ck, tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&tau);
        key
    }

    /// Erase all chaining material and return to `Zeroed`
    pub fn zeroize(&mut self) {
        self.state = State::Zeroed;
        self.erase_secrets();
        self.local_index = 0;
        self.remote_index = 0;
        self.remote_ephemeral = [0u8; 32];
    }

    fn erase_secrets(&mut self) {
        self.chaining_key = [0u8; 32];
        self.hash = [0u8; 32];
        self.ephemeral_private = [0u8; 32];
    }

    /// Build a handshake initiation (initiator role)
    ///
    /// `local_index` must already be registered in the index table as a
    /// reference to this handshake. MAC1/MAC2 are applied by the caller.
    pub fn create_initiation(
        &mut self,
        local: &LocalIdentity,
        peer_static: &[u8; 32],
        precomputed_ss: &[u8; 32],
        local_index: u32,
    ) -> Result<HandshakeInitiation, ProtocolError> {
        let (ck, h) = initial_state(peer_static);
        self.chaining_key = ck;
        self.hash = h;

        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
        self.ephemeral_private = ephemeral_private;

        // e
        self.mix_hash(&ephemeral_public);
        self.mix_chain(&ephemeral_public);

        // es
        let key = self.mix_key(&x25519::dh(&ephemeral_private, peer_static));

        // s
        let sealed_static = aead::encrypt(&key, 0, &local.public, &self.hash)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let sealed_static: [u8; 48] = sealed_static
            .try_into()
            .expect("static key seals to 48 bytes");
        self.mix_hash(&sealed_static);

        // ss
        let key = self.mix_key(precomputed_ss);

        let timestamp = Tai64N::now();
        let sealed_timestamp = aead::encrypt(&key, 0, &timestamp.to_bytes(), &self.hash)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let sealed_timestamp: [u8; 28] = sealed_timestamp
            .try_into()
            .expect("timestamp seals to 28 bytes");
        self.mix_hash(&sealed_timestamp);

        self.local_index = local_index;
        self.state = State::InitiationCreated;

        Ok(HandshakeInitiation {
            sender_index: local_index,
            ephemeral_public,
            sealed_static,
            sealed_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Decrypt and validate an initiation (responder role, pre-lookup)
    ///
    /// This is a free computation from the device's static identity; it
    /// touches no peer state.
    pub fn consume_initiation(
        local: &LocalIdentity,
        msg: &HandshakeInitiation,
    ) -> Result<ConsumedInitiation, ProtocolError> {
        let (mut chaining_key, mut hash) = initial_state(&local.public);

        // e
        hash = blake2s::hash_two(&hash, &msg.ephemeral_public);
        chaining_key = blake2s::kdf1(&chaining_key, &msg.ephemeral_public);

        // es
        let es = x25519::dh(&local.private, &msg.ephemeral_public);
        let (ck, key) = blake2s::kdf2(&chaining_key, &es);
        chaining_key = ck;

        // s
        let static_bytes = aead::decrypt(&key, 0, &msg.sealed_static, &hash)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let peer_static: [u8; 32] = static_bytes
            .try_into()
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        hash = blake2s::hash_two(&hash, &msg.sealed_static);

        // ss
        let ss = x25519::dh(&local.private, &peer_static);
        let (ck, key) = blake2s::kdf2(&chaining_key, &ss);
        chaining_key = ck;

        let ts_bytes = aead::decrypt(&key, 0, &msg.sealed_timestamp, &hash)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        hash = blake2s::hash_two(&hash, &msg.sealed_timestamp);

        let ts_bytes: [u8; 12] = ts_bytes
            .try_into()
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let timestamp =
            Tai64N::from_slice(&ts_bytes).map_err(|_| ProtocolError::StaleTimestamp)?;

        Ok(ConsumedInitiation {
            peer_static,
            timestamp,
            chaining_key,
            hash,
            remote_ephemeral: msg.ephemeral_public,
            remote_index: msg.sender_index,
        })
    }

    /// Commit a consumed initiation into this peer's handshake block
    ///
    /// Caller holds the handshake lock and has already verified that the
    /// timestamp is strictly newer than the last accepted one.
    pub fn commit_initiation(&mut self, consumed: ConsumedInitiation) {
        self.chaining_key = consumed.chaining_key;
        self.hash = consumed.hash;
        self.remote_ephemeral = consumed.remote_ephemeral;
        self.remote_index = consumed.remote_index;
        self.ephemeral_private = [0u8; 32];
        self.local_index = 0;
        self.state = State::InitiationConsumed;
    }

    /// Build a handshake response and derive transport keys (responder role)
    ///
    /// Requires `InitiationConsumed`. `peer_static` is the initiator's
    /// static public key, `local_index` the freshly assigned responder
    /// index. On success the chaining state is erased and the returned keys
    /// carry `is_initiator = false`.
    pub fn create_response(
        &mut self,
        peer_static: &[u8; 32],
        psk: &[u8; 32],
        local_index: u32,
    ) -> Result<(HandshakeResponse, SessionKeys), ProtocolError> {
        if self.state != State::InitiationConsumed {
            return Err(ProtocolError::InvalidHandshakeState);
        }

        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();

        // e
        self.mix_hash(&ephemeral_public);
        self.mix_chain(&ephemeral_public);

        // ee, se
        self.mix_chain(&x25519::dh(&ephemeral_private, &self.remote_ephemeral));
        self.mix_chain(&x25519::dh(&ephemeral_private, peer_static));

        // psk
        let key = self.mix_psk(psk);

        let sealed_empty = aead::encrypt(&key, 0, &[], &self.hash)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let sealed_empty: [u8; 16] = sealed_empty
            .try_into()
            .expect("empty string seals to 16 bytes");
        self.mix_hash(&sealed_empty);

        // Responder keys are swapped: the first KDF output is our receive key
        let (recv_key, send_key) = blake2s::kdf2(&self.chaining_key, &[]);

        let msg = HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.remote_index,
            ephemeral_public,
            sealed_empty,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        let keys = SessionKeys {
            send_key,
            recv_key,
            local_index,
            remote_index: self.remote_index,
            is_initiator: false,
        };

        self.local_index = local_index;
        self.state = State::ResponseCreated;
        self.erase_secrets();

        Ok((msg, keys))
    }

    /// Consume a handshake response and derive transport keys (initiator role)
    ///
    /// Requires `InitiationCreated` and a receiver index matching our own.
    pub fn consume_response(
        &mut self,
        local: &LocalIdentity,
        psk: &[u8; 32],
        msg: &HandshakeResponse,
    ) -> Result<SessionKeys, ProtocolError> {
        if self.state != State::InitiationCreated {
            return Err(ProtocolError::InvalidHandshakeState);
        }
        if msg.receiver_index != self.local_index {
            return Err(ProtocolError::UnknownIndex {
                index: msg.receiver_index,
            });
        }

        // The checks below must not destroy state on failure: a forged
        // response leaves the handshake retryable.
        let mut ck = self.chaining_key;
        let mut hash = self.hash;

        // e
        hash = blake2s::hash_two(&hash, &msg.ephemeral_public);
        ck = blake2s::kdf1(&ck, &msg.ephemeral_public);

        // ee, se
        ck = blake2s::kdf1(&ck, &x25519::dh(&self.ephemeral_private, &msg.ephemeral_public));
        ck = blake2s::kdf1(&ck, &x25519::dh(&local.private, &msg.ephemeral_public));

        // psk
        let (new_ck, tau, key) = blake2s::kdf3(&ck, psk);
        ck = new_ck;
        hash = blake2s::hash_two(&hash, &tau);

        aead::decrypt(&key, 0, &msg.sealed_empty, &hash)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;

        let (send_key, recv_key) = blake2s::kdf2(&ck, &[]);

        let keys = SessionKeys {
            send_key,
            recv_key,
            local_index: self.local_index,
            remote_index: msg.sender_index,
            is_initiator: true,
        };

        self.remote_index = msg.sender_index;
        self.state = State::ResponseConsumed;
        self.erase_secrets();

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identities() -> (LocalIdentity, LocalIdentity) {
        let (a_priv, _) = x25519::generate_keypair();
        let (b_priv, _) = x25519::generate_keypair();
        (LocalIdentity::new(a_priv), LocalIdentity::new(b_priv))
    }

    fn run_handshake(psk: [u8; 32]) -> (SessionKeys, SessionKeys) {
        let (alice, bob) = identities();
        let ss = x25519::dh(&alice.private, &bob.public);

        let mut initiator = Handshake::new();
        let init = initiator
            .create_initiation(&alice, &bob.public, &ss, 1001)
            .unwrap();
        assert_eq!(initiator.state(), State::InitiationCreated);

        let consumed = Handshake::consume_initiation(&bob, &init).unwrap();
        assert_eq!(consumed.peer_static, alice.public);

        let mut responder = Handshake::new();
        responder.commit_initiation(consumed);
        assert_eq!(responder.state(), State::InitiationConsumed);

        let (response, responder_keys) = responder
            .create_response(&alice.public, &psk, 2002)
            .unwrap();
        assert_eq!(responder.state(), State::ResponseCreated);

        let initiator_keys = initiator.consume_response(&alice, &psk, &response).unwrap();
        assert_eq!(initiator.state(), State::ResponseConsumed);

        (initiator_keys, responder_keys)
    }

    #[test]
    fn derives_matching_keys() {
        let (initiator_keys, responder_keys) = run_handshake([0u8; 32]);

        assert_eq!(initiator_keys.send_key, responder_keys.recv_key);
        assert_eq!(initiator_keys.recv_key, responder_keys.send_key);
        assert_ne!(initiator_keys.send_key, initiator_keys.recv_key);

        assert_eq!(initiator_keys.local_index, 1001);
        assert_eq!(initiator_keys.remote_index, 2002);
        assert_eq!(responder_keys.local_index, 2002);
        assert_eq!(responder_keys.remote_index, 1001);
        assert!(initiator_keys.is_initiator);
        assert!(!responder_keys.is_initiator);
    }

    #[test]
    fn derives_matching_keys_with_psk() {
        let (initiator_keys, responder_keys) = run_handshake([42u8; 32]);
        assert_eq!(initiator_keys.send_key, responder_keys.recv_key);
        assert_eq!(initiator_keys.recv_key, responder_keys.send_key);
    }

    #[test]
    fn psk_mismatch_fails_authentication() {
        let (alice, bob) = identities();
        let ss = x25519::dh(&alice.private, &bob.public);

        let mut initiator = Handshake::new();
        let init = initiator
            .create_initiation(&alice, &bob.public, &ss, 1)
            .unwrap();

        let consumed = Handshake::consume_initiation(&bob, &init).unwrap();
        let mut responder = Handshake::new();
        responder.commit_initiation(consumed);
        let (response, _) = responder
            .create_response(&alice.public, &[1u8; 32], 2)
            .unwrap();

        let err = initiator.consume_response(&alice, &[2u8; 32], &response);
        assert!(err.is_err());
        // A failed response leaves the initiation retryable
        assert_eq!(initiator.state(), State::InitiationCreated);
    }

    #[test]
    fn consume_initiation_rejects_wrong_responder() {
        let (alice, bob) = identities();
        let (mallory_priv, _) = x25519::generate_keypair();
        let mallory = LocalIdentity::new(mallory_priv);

        let ss = x25519::dh(&alice.private, &bob.public);
        let mut initiator = Handshake::new();
        let init = initiator
            .create_initiation(&alice, &bob.public, &ss, 1)
            .unwrap();

        assert!(Handshake::consume_initiation(&mallory, &init).is_err());
    }

    #[test]
    fn response_requires_initiation_created() {
        let (alice, _) = identities();
        let mut hs = Handshake::new();

        let msg = HandshakeResponse {
            sender_index: 5,
            receiver_index: 0,
            ephemeral_public: [1u8; 32],
            sealed_empty: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        assert!(matches!(
            hs.consume_response(&alice, &[0u8; 32], &msg),
            Err(ProtocolError::InvalidHandshakeState)
        ));
    }

    #[test]
    fn wrong_receiver_index_is_rejected() {
        let (alice, bob) = identities();
        let ss = x25519::dh(&alice.private, &bob.public);

        let mut initiator = Handshake::new();
        let init = initiator
            .create_initiation(&alice, &bob.public, &ss, 77)
            .unwrap();

        let consumed = Handshake::consume_initiation(&bob, &init).unwrap();
        let mut responder = Handshake::new();
        responder.commit_initiation(consumed);
        let (mut response, _) = responder
            .create_response(&alice.public, &[0u8; 32], 88)
            .unwrap();

        response.receiver_index = 78;
        assert!(matches!(
            initiator.consume_response(&alice, &[0u8; 32], &response),
            Err(ProtocolError::UnknownIndex { index: 78 })
        ));
    }

    #[test]
    fn zeroize_clears_state() {
        let (alice, bob) = identities();
        let ss = x25519::dh(&alice.private, &bob.public);

        let mut hs = Handshake::new();
        hs.create_initiation(&alice, &bob.public, &ss, 9).unwrap();
        assert_eq!(hs.local_index(), Some(9));

        hs.zeroize();
        assert_eq!(hs.state(), State::Zeroed);
        assert_eq!(hs.local_index(), None);
    }
}
