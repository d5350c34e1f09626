//! UDP binder collaborator
//!
//! The device core sends and receives datagrams through this trait, one
//! receive path per address family. The native adapter binds a v4 and a v6
//! tokio socket; tests use an in-memory hub that routes by port.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::error::DeviceError;

/// Where a peer was last heard from, plus the cached local source used to
/// reply. The cache is cleared whenever the UDP bind changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, local: None }
    }

    pub fn clear_src(&mut self) {
        self.local = None;
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[async_trait]
pub trait UdpTransport: Send + Sync {
    /// Bind both address families on `port` (0 picks one); returns the port
    async fn open(&self, port: u16) -> Result<u16, DeviceError>;

    /// Drop the sockets; pending receives fail
    async fn close(&self);

    /// Send one datagram to `dst`
    async fn send(&self, data: &[u8], dst: SocketAddr) -> Result<(), DeviceError>;

    /// Receive one IPv4 datagram
    async fn recv_v4(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DeviceError>;

    /// Receive one IPv6 datagram
    async fn recv_v6(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DeviceError>;

    /// Set the routing mark (SO_MARK) on the sockets
    fn set_mark(&self, mark: u32) -> Result<(), DeviceError>;
}

/// Native binder: one tokio socket per family
#[derive(Default)]
pub struct NativeUdp {
    v4: RwLock<Option<Arc<UdpSocket>>>,
    v6: RwLock<Option<Arc<UdpSocket>>>,
    mark: RwLock<Option<u32>>,
}

impl NativeUdp {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind_std(
        addr: SocketAddr,
        mark: Option<u32>,
    ) -> Result<std::net::UdpSocket, DeviceError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(DeviceError::Io)?;

        if addr.is_ipv6() {
            let _ = socket.set_only_v6(true);
        }
        socket.set_nonblocking(true).map_err(DeviceError::Io)?;

        #[cfg(target_os = "linux")]
        if let Some(mark) = mark {
            socket.set_mark(mark).map_err(DeviceError::Io)?;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = mark;

        socket
            .bind(&addr.into())
            .map_err(|e| DeviceError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(socket.into())
    }
}

#[async_trait]
impl UdpTransport for NativeUdp {
    async fn open(&self, port: u16) -> Result<u16, DeviceError> {
        let mark = *self.mark.read();

        let v4_std = Self::bind_std((Ipv4Addr::UNSPECIFIED, port).into(), mark)?;
        let actual_port = v4_std.local_addr().map_err(DeviceError::Io)?.port();
        let v6_std = Self::bind_std((Ipv6Addr::UNSPECIFIED, actual_port).into(), mark)?;

        let v4 = UdpSocket::from_std(v4_std).map_err(DeviceError::Io)?;
        let v6 = UdpSocket::from_std(v6_std).map_err(DeviceError::Io)?;

        *self.v4.write() = Some(Arc::new(v4));
        *self.v6.write() = Some(Arc::new(v6));

        tracing::debug!(port = actual_port, "UDP bind open");
        Ok(actual_port)
    }

    async fn close(&self) {
        self.v4.write().take();
        self.v6.write().take();
    }

    async fn send(&self, data: &[u8], dst: SocketAddr) -> Result<(), DeviceError> {
        let socket = {
            let slot = if dst.is_ipv4() { &self.v4 } else { &self.v6 };
            slot.read().clone().ok_or(DeviceError::Closed)?
        };

        socket
            .send_to(data, dst)
            .await
            .map_err(|e| DeviceError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv_v4(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DeviceError> {
        let socket = self.v4.read().clone().ok_or(DeviceError::Closed)?;
        socket
            .recv_from(buf)
            .await
            .map_err(|e| DeviceError::ReceiveFailed {
                reason: e.to_string(),
            })
    }

    async fn recv_v6(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DeviceError> {
        let socket = self.v6.read().clone().ok_or(DeviceError::Closed)?;
        socket
            .recv_from(buf)
            .await
            .map_err(|e| DeviceError::ReceiveFailed {
                reason: e.to_string(),
            })
    }

    fn set_mark(&self, mark: u32) -> Result<(), DeviceError> {
        *self.mark.write() = Some(mark);

        #[cfg(target_os = "linux")]
        {
            for slot in [&self.v4, &self.v6] {
                if let Some(socket) = slot.read().as_ref() {
                    socket2::SockRef::from(socket.as_ref())
                        .set_mark(mark)
                        .map_err(DeviceError::Io)?;
                }
            }
        }

        Ok(())
    }
}

/// In-memory UDP doubles routed through a shared hub, keyed by port.
/// Every bound transport appears as 127.0.0.1:port to its peers.
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    type Inbox = flume::Sender<(Vec<u8>, SocketAddr)>;

    #[derive(Default, Clone)]
    pub struct UdpHub {
        inboxes: Arc<Mutex<HashMap<u16, Inbox>>>,
    }

    impl UdpHub {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn transport(&self) -> HubUdp {
            HubUdp {
                hub: self.clone(),
                port: Mutex::new(0),
                inbox: Mutex::new(None),
            }
        }
    }

    pub struct HubUdp {
        hub: UdpHub,
        port: Mutex<u16>,
        inbox: Mutex<Option<flume::Receiver<(Vec<u8>, SocketAddr)>>>,
    }

    #[async_trait]
    impl UdpTransport for HubUdp {
        async fn open(&self, port: u16) -> Result<u16, DeviceError> {
            let mut inboxes = self.hub.inboxes.lock();
            let port = if port != 0 {
                port
            } else {
                // Pick the first free ephemeral port
                (49152..u16::MAX)
                    .find(|p| !inboxes.contains_key(p))
                    .ok_or(DeviceError::Closed)?
            };

            let (tx, rx) = flume::unbounded();
            inboxes.insert(port, tx);
            *self.port.lock() = port;
            *self.inbox.lock() = Some(rx);
            Ok(port)
        }

        async fn close(&self) {
            let port = *self.port.lock();
            self.hub.inboxes.lock().remove(&port);
            self.inbox.lock().take();
        }

        async fn send(&self, data: &[u8], dst: SocketAddr) -> Result<(), DeviceError> {
            let target = self.hub.inboxes.lock().get(&dst.port()).cloned();
            if let Some(target) = target {
                let src = SocketAddr::from(([127, 0, 0, 1], *self.port.lock()));
                let _ = target.send((data.to_vec(), src));
            }
            Ok(())
        }

        async fn recv_v4(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), DeviceError> {
            let rx = self.inbox.lock().clone().ok_or(DeviceError::Closed)?;
            let (data, src) = rx.recv_async().await.map_err(|_| DeviceError::Closed)?;
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok((len, src))
        }

        async fn recv_v6(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr), DeviceError> {
            std::future::pending().await
        }

        fn set_mark(&self, _mark: u32) -> Result<(), DeviceError> {
            Ok(())
        }
    }
}
