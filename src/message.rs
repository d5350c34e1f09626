//! Wire formats
//!
//! The four datagram types, little-endian throughout:
//! - type 1: handshake initiation, 148 bytes
//! - type 2: handshake response, 92 bytes
//! - type 3: cookie reply, 64 bytes
//! - type 4: transport data, 16-byte header plus sealed payload

use crate::error::ProtocolError;

/// Datagram type, the first little-endian u32 of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Classify a datagram by its leading u32, checking the fixed sizes
pub fn classify(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    let msg_type = MessageType::try_from(u32::from_le_bytes(data[..4].try_into().unwrap()))?;

    let ok = match msg_type {
        MessageType::HandshakeInitiation => data.len() == HandshakeInitiation::SIZE,
        MessageType::HandshakeResponse => data.len() == HandshakeResponse::SIZE,
        MessageType::CookieReply => data.len() == CookieReply::SIZE,
        MessageType::TransportData => data.len() >= Transport::MIN_SIZE,
    };
    if !ok {
        return Err(ProtocolError::InvalidMessageLength {
            expected: Transport::MIN_SIZE,
            got: data.len(),
        });
    }

    Ok(msg_type)
}

/// Handshake initiation (148 bytes)
///
/// ```text
/// u32 type=1 | u32 sender | ephemeral(32) | sealed_static(48) |
/// sealed_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub sealed_static: [u8; 48],
    pub sealed_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;
    /// Offset where MAC1 starts; everything before it is MAC1 input
    pub const MAC1_OFFSET: usize = 116;
    /// Offset where MAC2 starts; everything before it is MAC2 input
    pub const MAC2_OFFSET: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&(MessageType::HandshakeInitiation as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.sealed_static);
        buf[88..116].copy_from_slice(&self.sealed_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        Ok(Self {
            sender_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            ephemeral_public: data[8..40].try_into().unwrap(),
            sealed_static: data[40..88].try_into().unwrap(),
            sealed_timestamp: data[88..116].try_into().unwrap(),
            mac1: data[116..132].try_into().unwrap(),
            mac2: data[132..148].try_into().unwrap(),
        })
    }
}

/// Handshake response (92 bytes)
///
/// ```text
/// u32 type=2 | u32 sender | u32 receiver | ephemeral(32) |
/// sealed_empty(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub sealed_empty: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&(MessageType::HandshakeResponse as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.sealed_empty);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        Ok(Self {
            sender_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            receiver_index: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            ephemeral_public: data[12..44].try_into().unwrap(),
            sealed_empty: data[44..60].try_into().unwrap(),
            mac1: data[60..76].try_into().unwrap(),
            mac2: data[76..92].try_into().unwrap(),
        })
    }
}

/// Cookie reply (64 bytes)
///
/// ```text
/// u32 type=3 | u32 receiver | nonce(24) | sealed_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub sealed_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&(MessageType::CookieReply as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.sealed_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }

        Ok(Self {
            receiver_index: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            nonce: data[8..32].try_into().unwrap(),
            sealed_cookie: data[32..64].try_into().unwrap(),
        })
    }
}

/// Transport data header and layout helpers
///
/// ```text
/// u32 type=4 | u32 receiver | u64 counter | ciphertext-with-tag
/// ```
pub struct Transport;

impl Transport {
    /// Header length: type, receiver index, counter
    pub const HEADER_LEN: usize = 16;
    /// Smallest valid transport datagram: header plus a bare tag (keep-alive)
    pub const MIN_SIZE: usize = Self::HEADER_LEN + 16;

    /// Write the header into the first 16 bytes of `buf`
    pub fn write_header(buf: &mut [u8], receiver_index: u32, counter: u64) {
        buf[..4].copy_from_slice(&(MessageType::TransportData as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&receiver_index.to_le_bytes());
        buf[8..16].copy_from_slice(&counter.to_le_bytes());
    }

    /// Receiver index of a transport datagram
    pub fn receiver_index(data: &[u8]) -> u32 {
        u32::from_le_bytes(data[4..8].try_into().unwrap())
    }

    /// Nonce counter of a transport datagram
    pub fn counter(data: &[u8]) -> u64 {
        u64::from_le_bytes(data[8..16].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_roundtrip() {
        let msg = HandshakeInitiation {
            sender_index: 0x12345678,
            ephemeral_public: [1u8; 32],
            sealed_static: [2u8; 48],
            sealed_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };

        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), HandshakeInitiation::SIZE);
        assert_eq!(classify(&bytes).unwrap(), MessageType::HandshakeInitiation);

        let parsed = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, msg.sender_index);
        assert_eq!(parsed.ephemeral_public, msg.ephemeral_public);
        assert_eq!(parsed.sealed_timestamp, msg.sealed_timestamp);
        assert_eq!(parsed.mac2, msg.mac2);
    }

    #[test]
    fn response_roundtrip() {
        let msg = HandshakeResponse {
            sender_index: 0x11223344,
            receiver_index: 0x55667788,
            ephemeral_public: [7u8; 32],
            sealed_empty: [8u8; 16],
            mac1: [9u8; 16],
            mac2: [0u8; 16],
        };

        let bytes = msg.to_bytes();
        assert_eq!(classify(&bytes).unwrap(), MessageType::HandshakeResponse);

        let parsed = HandshakeResponse::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, 0x11223344);
        assert_eq!(parsed.receiver_index, 0x55667788);
        assert_eq!(parsed.ephemeral_public, msg.ephemeral_public);
    }

    #[test]
    fn cookie_reply_roundtrip() {
        let msg = CookieReply {
            receiver_index: 42,
            nonce: [6u8; 24],
            sealed_cookie: [7u8; 32],
        };

        let bytes = msg.to_bytes();
        assert_eq!(classify(&bytes).unwrap(), MessageType::CookieReply);

        let parsed = CookieReply::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.receiver_index, 42);
        assert_eq!(parsed.nonce, msg.nonce);
    }

    #[test]
    fn transport_header_layout() {
        let mut buf = [0u8; Transport::MIN_SIZE];
        Transport::write_header(&mut buf, 99, 0x0102030405060708);

        assert_eq!(classify(&buf).unwrap(), MessageType::TransportData);
        assert_eq!(Transport::receiver_index(&buf), 99);
        assert_eq!(Transport::counter(&buf), 0x0102030405060708);
    }

    #[test]
    fn classify_rejects_runts_and_bad_sizes() {
        assert!(classify(&[]).is_err());
        assert!(classify(&[1, 0, 0]).is_err());

        // An initiation-typed datagram with the wrong length is invalid
        let mut short = vec![0u8; 100];
        short[..4].copy_from_slice(&1u32.to_le_bytes());
        assert!(classify(&short).is_err());

        // A transport datagram shorter than header+tag is invalid
        let mut runt = vec![0u8; Transport::MIN_SIZE - 1];
        runt[..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(classify(&runt).is_err());
    }

    #[test]
    fn classify_rejects_unknown_type() {
        let mut buf = [0u8; 64];
        buf[..4].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            classify(&buf),
            Err(ProtocolError::InvalidMessageType { msg_type: 9 })
        ));
    }
}
