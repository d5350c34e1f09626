//! TUN collaborator
//!
//! The device core reads and writes whole IP datagrams through this trait;
//! each read yields exactly one packet, with no framing header. The native
//! adapter wraps tun-rs; tests use an in-memory channel pair.

use async_trait::async_trait;

use crate::error::DeviceError;

/// Interface state changes surfaced to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    Up,
    Down,
    MtuChanged(u16),
}

#[async_trait]
pub trait TunInterface: Send + Sync {
    /// Read one IP packet; blocks until one is available
    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Write one IP packet
    async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError>;

    /// Current interface MTU
    fn mtu(&self) -> u16;

    /// Interface name, for logging and the control socket path
    fn name(&self) -> &str;

    /// Await the next interface event
    async fn next_event(&self) -> TunEvent;
}

/// Native TUN device backed by tun-rs
pub struct NativeTun {
    device: tun_rs::AsyncDevice,
    name: String,
    mtu: std::sync::atomic::AtomicU16,
    events: flume::Receiver<TunEvent>,
    // Held so the event receiver pends instead of erroring once drained
    _event_tx: flume::Sender<TunEvent>,
}

impl NativeTun {
    /// Create and bring up a TUN interface
    pub fn create(
        address: std::net::Ipv4Addr,
        prefix_len: u8,
        mtu: u16,
    ) -> Result<Self, DeviceError> {
        check_privileges()?;

        let device = tun_rs::DeviceBuilder::new()
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| DeviceError::TunCreateFailed {
                reason: e.to_string(),
            })?;

        let name = {
            use std::ops::Deref;
            device.deref().name().map_err(|e| DeviceError::TunCreateFailed {
                reason: format!("failed to get device name: {}", e),
            })?
        };

        let (event_tx, events) = flume::unbounded();
        let _ = event_tx.send(TunEvent::Up);

        tracing::info!(%name, %address, prefix_len, mtu, "created TUN device");

        Ok(Self {
            device,
            name,
            mtu: std::sync::atomic::AtomicU16::new(mtu),
            events,
            _event_tx: event_tx,
        })
    }
}

#[async_trait]
impl TunInterface for NativeTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.device
            .recv(buf)
            .await
            .map_err(|e| DeviceError::TunReadFailed {
                reason: e.to_string(),
            })
    }

    async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError> {
        self.device
            .send(packet)
            .await
            .map_err(|e| DeviceError::TunWriteFailed {
                reason: e.to_string(),
            })
    }

    fn mtu(&self) -> u16 {
        self.mtu.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&self) -> TunEvent {
        match self.events.recv_async().await {
            Ok(event) => event,
            Err(_) => std::future::pending().await,
        }
    }
}

fn check_privileges() -> Result<(), DeviceError> {
    #[cfg(unix)]
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("running without root; TUN creation may fail (CAP_NET_ADMIN required)");
    }
    Ok(())
}

/// In-memory TUN double: reads pop from an inbound queue, writes land on an
/// outbound queue. Used by the device tests.
pub mod testing {
    use super::*;

    pub struct ChannelTun {
        pub inbound_tx: flume::Sender<Vec<u8>>,
        inbound: flume::Receiver<Vec<u8>>,
        outbound_tx: flume::Sender<Vec<u8>>,
        pub outbound: flume::Receiver<Vec<u8>>,
        events_tx: flume::Sender<TunEvent>,
        events: flume::Receiver<TunEvent>,
        mtu: u16,
    }

    impl Default for ChannelTun {
        fn default() -> Self {
            Self::new(1420)
        }
    }

    impl ChannelTun {
        pub fn new(mtu: u16) -> Self {
            let (inbound_tx, inbound) = flume::unbounded();
            let (outbound_tx, outbound) = flume::unbounded();
            let (events_tx, events) = flume::unbounded();
            Self {
                inbound_tx,
                inbound,
                outbound_tx,
                outbound,
                events_tx,
                events,
                mtu,
            }
        }

        /// Inject an IP packet as if the OS wrote it to the interface
        pub fn inject(&self, packet: Vec<u8>) {
            let _ = self.inbound_tx.send(packet);
        }

        pub fn send_event(&self, event: TunEvent) {
            let _ = self.events_tx.send(event);
        }
    }

    #[async_trait]
    impl TunInterface for ChannelTun {
        async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
            let packet = self
                .inbound
                .recv_async()
                .await
                .map_err(|_| DeviceError::Closed)?;
            let len = packet.len().min(buf.len());
            buf[..len].copy_from_slice(&packet[..len]);
            Ok(len)
        }

        async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError> {
            self.outbound_tx
                .send(packet.to_vec())
                .map_err(|_| DeviceError::Closed)?;
            Ok(packet.len())
        }

        fn mtu(&self) -> u16 {
            self.mtu
        }

        fn name(&self) -> &str {
            "tun-test"
        }

        async fn next_event(&self) -> TunEvent {
            match self.events.recv_async().await {
                Ok(event) => event,
                Err(_) => std::future::pending().await,
            }
        }
    }
}
