//! ferrotun - userspace WireGuard-protocol tunnel device
//!
//! A point-to-point, authenticated, encrypted layer-3 tunnel: plaintext IP
//! packets from a local TUN interface are routed to peers by longest-prefix
//! match, protected by a Noise IKpsk2 handshake, and carried as encrypted
//! UDP datagrams.
//!
//! # Architecture
//!
//! - Noise handshake state machine with cookie-based DoS protection
//! - Session lifecycle with {previous, current, next} key-pair rotation,
//!   rekey/keepalive timers, and key erasure
//! - Parallel AEAD pipeline that preserves per-peer packet order
//! - Binary radix tries mapping inner addresses to peers
//!
//! The TUN device and the UDP socket are abstract collaborators
//! ([`tun::TunInterface`], [`udp::UdpTransport`]); configuration arrives
//! through the UAPI text protocol or a wg-quick style `.conf` file.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrotun::{Device, TunnelConfig};
//! use ferrotun::tun::NativeTun;
//! use ferrotun::udp::NativeUdp;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = TunnelConfig::from_file("tunnel.conf")?;
//! let tun = Arc::new(NativeTun::create("10.0.0.2".parse()?, 24, 1420)?);
//! let device = Device::new(tun, Arc::new(NativeUdp::new()));
//! device.apply_update(config.to_update()).await?;
//! device.start();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod message;
pub mod noise;
pub mod tun;
pub mod udp;

pub use config::TunnelConfig;
pub use device::{Device, DeviceUpdate, PeerUpdate};
pub use error::FerrotunError;
