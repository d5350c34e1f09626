//! AEAD operations for the tunnel protocol
//!
//! ChaCha20-Poly1305 with the 64-bit-counter nonce for handshake and
//! transport sealing, XChaCha20-Poly1305 for cookie replies. The transport
//! path seals and opens in place inside pooled buffers.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, Tag, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// Build the 12-byte nonce: 4 zero bytes then the counter, little-endian
fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt, returning ciphertext || tag
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt ciphertext || tag, authenticating the tag
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Seal `buf[..msg_len]` in place; the tag lands at `buf[msg_len..msg_len + TAG_LEN]`
///
/// Returns the sealed length (`msg_len + TAG_LEN`). The buffer must have
/// room for the tag.
pub fn seal_in_place(
    key: &[u8; KEY_LEN],
    counter: u64,
    buf: &mut [u8],
    msg_len: usize,
) -> Result<usize, CryptoError> {
    if buf.len() < msg_len + TAG_LEN {
        return Err(CryptoError::Encryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], &mut buf[..msg_len])
        .map_err(|_| CryptoError::Encryption)?;
    buf[msg_len..msg_len + TAG_LEN].copy_from_slice(&tag);

    Ok(msg_len + TAG_LEN)
}

/// Open `buf` (ciphertext || tag) in place; returns the plaintext length
pub fn open_in_place(
    key: &[u8; KEY_LEN],
    counter: u64,
    buf: &mut [u8],
) -> Result<usize, CryptoError> {
    if buf.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = counter_nonce(counter);
    let msg_len = buf.len() - TAG_LEN;

    let tag = Tag::clone_from_slice(&buf[msg_len..]);
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(&nonce), &[], &mut buf[..msg_len], &tag)
        .map_err(|_| CryptoError::Decryption)?;

    Ok(msg_len)
}

/// XChaCha20-Poly1305 encryption (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// XChaCha20-Poly1305 decryption (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}
