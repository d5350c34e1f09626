//! Configuration file loading
//!
//! Parses wg-quick style `.conf` files and converts them into the same
//! transactional [`DeviceUpdate`](crate::device::DeviceUpdate) the UAPI
//! control surface applies.

mod parser;

pub use parser::{InterfaceSection, PeerSection, TunnelConfig};
