//! X25519 key agreement
//!
//! Thin wrapper over x25519-dalek working on raw 32-byte arrays, which is
//! what the wire format and the device state carry.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 key length (private and public)
pub const KEY_LEN: usize = 32;

/// Generate a fresh keypair, returning (private, public)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key for a private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Diffie-Hellman: shared secret from our private and their public key
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    secret.diffie_hellman(&public).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_commutes() {
        let (a_priv, a_pub) = generate_keypair();
        let (b_priv, b_pub) = generate_keypair();

        assert_eq!(dh(&a_priv, &b_pub), dh(&b_priv, &a_pub));
    }

    #[test]
    fn public_key_matches_generated() {
        let (private, public) = generate_keypair();
        assert_eq!(public_key(&private), public);
    }

    #[test]
    fn rfc7748_vector() {
        let private = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let expected_public = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        assert_eq!(public_key(&private), expected_public);
    }
}
