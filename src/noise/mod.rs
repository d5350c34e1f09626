//! Noise IKpsk2 handshake and protocol constants

pub mod cookie;
pub mod handshake;

use std::time::Duration;

/// Noise construction string; the initial chaining key is its BLAKE2s hash
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// Application label mixed into the initial hash
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Initiate a rekey once the current key-pair is this old (send path)
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// A key-pair is unusable once it is this old
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Retransmit an unanswered handshake initiation after this long
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Stop retrying a handshake after this long
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Send a keep-alive if we received but did not send for this long
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the retransmit jitter
pub const MAX_JITTER: Duration = Duration::from_millis(333);

/// Cookies (and the responder cookie secret) are fresh for this long
pub const COOKIE_EXPIRATION_TIME: Duration = Duration::from_secs(120);

/// Zeroize all key material this long after the last completed handshake
pub const ZERO_KEY_MATERIAL_AFTER: Duration = Duration::from_secs(180 * 3);

/// Initiate a rekey once this many messages were sent on a key-pair
pub const REKEY_AFTER_MESSAGES: u64 = u64::MAX - (1 << 16);

/// A key-pair may not send once its counter passes this value
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 4);
