//! UAPI control surface
//!
//! Line-oriented text protocol over a Unix socket: a request starts with
//! `get=1` or `set=1`. Set requests are transactional: every line is parsed
//! and validated before anything is applied, and the response is a single
//! `errno=N` line. Keys are hex-encoded.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::device::{Device, DeviceUpdate, PeerUpdate};
use crate::error::{DeviceError, FerrotunError};

const EIO: i32 = libc::EIO;
const EPROTO: i32 = libc::EPROTO;
const EINVAL: i32 = libc::EINVAL;
const EADDRINUSE: i32 = libc::EADDRINUSE;

/// Serve UAPI connections from a Unix socket listener until shutdown
#[cfg(unix)]
pub async fn serve(device: Arc<Device>, listener: tokio::net::UnixListener) {
    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let conn = tokio::select! {
            conn = listener.accept() => conn,
            _ = shutdown.changed() => return,
        };

        match conn {
            Ok((stream, _)) => {
                let device = Arc::clone(&device);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(&device, stream).await {
                        tracing::debug!(error = %e, "UAPI connection error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "UAPI accept failed");
                return;
            }
        }
    }
}

/// Handle one request/response exchange
pub async fn handle_connection<S>(device: &Arc<Device>, stream: S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);

    let mut command = String::new();
    stream.read_line(&mut command).await?;

    match command.trim_end() {
        "get=1" => {
            let state = serialize_get(device);
            stream.get_mut().write_all(state.as_bytes()).await?;
            stream.get_mut().write_all(b"errno=0\n\n").await?;
        }
        "set=1" => {
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                if stream.read_line(&mut line).await? == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                lines.push(line);
            }

            let status = match parse_set_lines(&lines) {
                Ok(update) => match device.apply_update(update).await {
                    Ok(()) => 0,
                    Err(e) => errno_for(&e),
                },
                Err(errno) => errno,
            };

            stream
                .get_mut()
                .write_all(format!("errno={}\n\n", status).as_bytes())
                .await?;
        }
        _ => {
            stream
                .get_mut()
                .write_all(format!("errno={}\n\n", EIO).as_bytes())
                .await?;
        }
    }

    stream.get_mut().flush().await
}

fn errno_for(error: &FerrotunError) -> i32 {
    match error {
        FerrotunError::Config(_) => EINVAL,
        FerrotunError::Device(DeviceError::BindFailed { .. }) => EADDRINUSE,
        _ => EIO,
    }
}

/// Render the full device state as `key=value` lines
pub fn serialize_get(device: &Arc<Device>) -> String {
    use std::fmt::Write;

    let mut out = String::new();

    if let Some(public_key) = device.public_key() {
        let _ = writeln!(out, "own_public_key={}", hex::encode(public_key));
    }
    if let Some(port) = device.listen_port() {
        let _ = writeln!(out, "listen_port={}", port);
    }
    if let Some(fwmark) = device.fwmark() {
        let _ = writeln!(out, "fwmark={}", fwmark);
    }

    for peer in device.peer_list() {
        let _ = writeln!(out, "public_key={}", hex::encode(peer.public_key()));

        let psk = peer.psk();
        if psk != [0u8; 32] {
            let _ = writeln!(out, "preshared_key={}", hex::encode(psk));
        }

        if let Some(interval) = peer.timers.lock().persistent_keepalive() {
            let _ = writeln!(out, "persistent_keepalive_interval={}", interval);
        }

        if let Some(endpoint) = peer.endpoint() {
            let _ = writeln!(out, "endpoint={}", endpoint.addr);
        }

        for (ip, cidr) in device.allowed_ips_of(&peer) {
            let _ = writeln!(out, "allowed_ip={}/{}", ip, cidr);
        }

        if let Some(when) = peer.last_handshake() {
            if let Ok(elapsed) = when.duration_since(std::time::UNIX_EPOCH) {
                let _ = writeln!(out, "last_handshake_time_sec={}", elapsed.as_secs());
                let _ = writeln!(out, "last_handshake_time_nsec={}", elapsed.subsec_nanos());
            }
        }

        let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes());
        let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes());
    }

    out
}

fn parse_key_hex(value: &str) -> Result<[u8; 32], i32> {
    let bytes = hex::decode(value).map_err(|_| EINVAL)?;
    bytes.try_into().map_err(|_| EINVAL)
}

fn parse_allowed_ip(value: &str) -> Result<(std::net::IpAddr, u8), i32> {
    let (ip, cidr) = value.split_once('/').ok_or(EINVAL)?;
    let ip: std::net::IpAddr = ip.parse().map_err(|_| EINVAL)?;
    let cidr: u8 = cidr.parse().map_err(|_| EINVAL)?;

    let valid = match ip {
        std::net::IpAddr::V4(_) => cidr <= 32,
        std::net::IpAddr::V6(_) => cidr <= 128,
    };
    if !valid {
        return Err(EINVAL);
    }
    Ok((ip, cidr))
}

/// Parse a full `set=1` body into one transaction
///
/// Any unknown key or malformed value aborts with the errno to report; the
/// device is untouched until the whole body parsed.
pub fn parse_set_lines(lines: &[String]) -> Result<DeviceUpdate, i32> {
    let mut update = DeviceUpdate::default();
    let mut current_peer: Option<PeerUpdate> = None;

    for line in lines {
        let (key, value) = line.split_once('=').ok_or(EPROTO)?;

        // public_key opens a new peer block wherever it appears
        if key == "public_key" {
            if let Some(done) = current_peer.take() {
                update.peers.push(done);
            }
            current_peer = Some(PeerUpdate {
                public_key: parse_key_hex(value)?,
                ..Default::default()
            });
            continue;
        }

        match current_peer.as_mut() {
            None => match key {
                "private_key" => update.private_key = Some(parse_key_hex(value)?),
                "listen_port" => {
                    update.listen_port = Some(value.parse().map_err(|_| EINVAL)?)
                }
                "fwmark" => {
                    let mark: u32 = value.parse().map_err(|_| EINVAL)?;
                    update.fwmark = Some((mark != 0).then_some(mark));
                }
                "replace_peers" => match value {
                    "true" => update.replace_peers = true,
                    _ => return Err(EINVAL),
                },
                _ => return Err(EINVAL),
            },
            Some(peer) => match key {
                "remove" => match value {
                    "true" => peer.remove = true,
                    "false" => peer.remove = false,
                    _ => return Err(EINVAL),
                },
                "preshared_key" => peer.preshared_key = Some(parse_key_hex(value)?),
                "endpoint" => {
                    let addr: SocketAddr = value.parse().map_err(|_| EINVAL)?;
                    peer.endpoint = Some(addr);
                }
                "persistent_keepalive_interval" => {
                    peer.persistent_keepalive = Some(value.parse().map_err(|_| EINVAL)?)
                }
                "replace_allowed_ips" => match value {
                    "true" => peer.replace_allowed_ips = true,
                    _ => return Err(EINVAL),
                },
                "allowed_ip" => peer.allowed_ips.push(parse_allowed_ip(value)?),
                "protocol_version" => match value {
                    "1" => {}
                    _ => return Err(EINVAL),
                },
                _ => return Err(EINVAL),
            },
        }
    }

    if let Some(done) = current_peer.take() {
        update.peers.push(done);
    }

    Ok(update)
}
