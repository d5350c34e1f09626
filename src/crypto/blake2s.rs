//! BLAKE2s primitives for the tunnel protocol
//!
//! Hash, keyed 16-byte MACs, and the HMAC-BLAKE2s key derivation ladder
//! (KDF1/2/3) used by the handshake.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// RFC 2104 HMAC over BLAKE2s-256 (not keyed BLAKE2s)
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 output (hash, chaining key, HKDF outputs)
pub const HASH_LEN: usize = 32;

/// Length of the truncated keyed-MAC output (MAC1, MAC2, cookies)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 of two concatenated inputs: HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s with 16-byte output and a 32-byte key (MAC1)
pub fn mac16(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("32-byte MAC key");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// Keyed BLAKE2s with 16-byte output and a 16-byte key (MAC2, keyed by a cookie)
pub fn mac16_keyed16(key: &[u8; MAC_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("16-byte MAC key");
    MacTrait::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// Keyed BLAKE2s with 16-byte output over two chained inputs
///
/// Used for cookie derivation, MAC(secret, ip || port).
pub fn mac16_keyed16_two(key: &[u8; MAC_LEN], a: &[u8], b: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("16-byte MAC key");
    MacTrait::update(&mut mac, a);
    MacTrait::update(&mut mac, b);
    mac.finalize_fixed().into()
}

fn hkdf_extract(key: &[u8], input: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, input);
    mac.finalize_fixed().into()
}

fn hkdf_expand(prk: &[u8; HASH_LEN], prev: &[u8], counter: u8) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(prk).expect("HMAC accepts any key length");
    Update::update(&mut mac, prev);
    Update::update(&mut mac, &[counter]);
    mac.finalize_fixed().into()
}

/// KDF1: one 32-byte output
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let prk = hkdf_extract(key, input);
    hkdf_expand(&prk, &[], 0x01)
}

/// KDF2: two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hkdf_extract(key, input);
    let t1 = hkdf_expand(&prk, &[], 0x01);
    let t2 = hkdf_expand(&prk, &t1, 0x02);
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let prk = hkdf_extract(key, input);
    let t1 = hkdf_expand(&prk, &[], 0x01);
    let t2 = hkdf_expand(&prk, &t1, 0x02);
    let t3 = hkdf_expand(&prk, &t2, 0x03);
    (t1, t2, t3)
}
