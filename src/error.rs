//! Error types for the ferrotun device core
//!
//! Every cross-subsystem call returns an explicit `Result`; no panic-style
//! control flow crosses module boundaries.

use thiserror::Error;

/// Top-level error type for the device core
#[derive(Error, Debug)]
pub enum FerrotunError {
    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Device / transport errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Handshake is in the wrong state for this message")]
    InvalidHandshakeState,

    #[error("Replayed handshake initiation timestamp")]
    StaleTimestamp,

    #[error("Replayed or stale transport counter {counter}")]
    ReplayDetected { counter: u64 },

    #[error("Unknown session index {index}")]
    UnknownIndex { index: u32 },

    #[error("Unknown peer")]
    UnknownPeer,

    #[error("Session expired")]
    SessionExpired,

    #[error("No usable session key-pair")]
    NoSession,

    #[error("Handshake rate limited")]
    RateLimited,

    #[error("Cookie required while under load")]
    CookieRequired,

    #[error("Handshake gave up after the retry deadline")]
    HandshakeExpired,
}

/// Configuration errors (UAPI set and .conf parsing)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid key for {field}")]
    InvalidKey { field: String },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Unknown key: {key}")]
    UnknownKey { key: String },

    #[error("Peer key=value before a public_key line")]
    NoPeerSelected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device and transport errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Peer has no endpoint")]
    NoEndpoint,

    #[error("Failed to create TUN device: {reason}")]
    TunCreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    TunReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    TunWriteFailed { reason: String },

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("Device is shutting down")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for device-core operations
pub type Result<T> = std::result::Result<T, FerrotunError>;
