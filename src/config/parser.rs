//! wg-quick `.conf` parser
//!
//! Standard `[Interface]` / `[Peer]` sections with base64 keys. The parsed
//! result converts into a `DeviceUpdate` so file-based and UAPI-based
//! configuration share one application path.

use std::net::SocketAddr;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::device::{DeviceUpdate, PeerUpdate};
use crate::error::ConfigError;

/// A parsed tunnel configuration file
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub interface: InterfaceSection,
    pub peers: Vec<PeerSection>,
}

/// `[Interface]` section
#[derive(Debug, Clone)]
pub struct InterfaceSection {
    pub private_key: [u8; 32],
    /// Inner addresses assigned to the TUN interface
    pub addresses: Vec<IpNet>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    pub fwmark: Option<u32>,
}

/// One `[Peer]` section
#[derive(Debug, Clone)]
pub struct PeerSection {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

impl TunnelConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceSection> = None;
        let mut peers = Vec::new();
        let mut section: Option<Section> = None;
        let mut pending_peer: Option<PeerBuilder> = None;

        for (line_idx, raw) in content.lines().enumerate() {
            let line_num = line_idx + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(builder) = pending_peer.take() {
                    peers.push(builder.build()?);
                }
                section = Some(Section::Interface);
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                if let Some(builder) = pending_peer.take() {
                    peers.push(builder.build()?);
                }
                section = Some(Section::Peer);
                pending_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("expected 'key = value', got: {}", line),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match section {
                Some(Section::Interface) => {
                    let iface = interface.get_or_insert_with(|| InterfaceSection {
                        private_key: [0u8; 32],
                        addresses: Vec::new(),
                        listen_port: None,
                        mtu: None,
                        fwmark: None,
                    });
                    parse_interface_key(iface, &key, value, line_num)?;
                }
                Some(Section::Peer) => {
                    let builder = pending_peer.as_mut().expect("set with the section");
                    parse_peer_key(builder, &key, value, line_num)?;
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "value outside of any section".to_string(),
                    })
                }
            }
        }

        if let Some(builder) = pending_peer.take() {
            peers.push(builder.build()?);
        }

        let interface = interface.ok_or(ConfigError::MissingField {
            field: "[Interface] section".to_string(),
        })?;
        if interface.private_key == [0u8; 32] {
            return Err(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            });
        }

        Ok(Self { interface, peers })
    }

    /// Our public key, derived from the interface private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }

    /// Convert into the transaction the device applies at startup
    pub fn to_update(&self) -> DeviceUpdate {
        DeviceUpdate {
            private_key: Some(self.interface.private_key),
            listen_port: self.interface.listen_port,
            fwmark: self.interface.fwmark.map(Some),
            replace_peers: true,
            peers: self
                .peers
                .iter()
                .map(|peer| PeerUpdate {
                    public_key: peer.public_key,
                    remove: false,
                    replace_allowed_ips: true,
                    preshared_key: peer.preshared_key,
                    endpoint: peer.endpoint,
                    persistent_keepalive: peer.persistent_keepalive,
                    allowed_ips: peer
                        .allowed_ips
                        .iter()
                        .map(|net| (net.addr(), net.prefix_len()))
                        .collect(),
                })
                .collect(),
        }
    }
}

fn parse_interface_key(
    iface: &mut InterfaceSection,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "privatekey" => iface.private_key = parse_key_b64(value, "PrivateKey")?,
        "address" => {
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let net: IpNet = part.parse().map_err(|_| ConfigError::InvalidCidr {
                    value: part.to_string(),
                })?;
                iface.addresses.push(net);
            }
        }
        "listenport" => {
            iface.listen_port = Some(value.parse().map_err(|_| ConfigError::ParseError {
                line,
                message: format!("invalid ListenPort: {}", value),
            })?)
        }
        "mtu" => {
            iface.mtu = Some(value.parse().map_err(|_| ConfigError::ParseError {
                line,
                message: format!("invalid MTU: {}", value),
            })?)
        }
        "fwmark" => {
            iface.fwmark = Some(value.parse().map_err(|_| ConfigError::ParseError {
                line,
                message: format!("invalid FwMark: {}", value),
            })?)
        }
        _ => {
            // wg-quick keys we do not manage (DNS, Table, PostUp, ...)
            tracing::debug!(key, "ignoring interface key");
        }
    }
    Ok(())
}

fn parse_peer_key(
    builder: &mut PeerBuilder,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "publickey" => builder.public_key = Some(parse_key_b64(value, "PublicKey")?),
        "presharedkey" => builder.preshared_key = Some(parse_key_b64(value, "PresharedKey")?),
        "endpoint" => {
            builder.endpoint = Some(value.parse().map_err(|_| ConfigError::InvalidAddress {
                value: value.to_string(),
            })?)
        }
        "allowedips" => {
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let net: IpNet = part.parse().map_err(|_| ConfigError::InvalidCidr {
                    value: part.to_string(),
                })?;
                builder.allowed_ips.push(net);
            }
        }
        "persistentkeepalive" => {
            builder.persistent_keepalive =
                Some(value.parse().map_err(|_| ConfigError::ParseError {
                    line,
                    message: format!("invalid PersistentKeepalive: {}", value),
                })?)
        }
        _ => {
            tracing::debug!(key, "ignoring peer key");
        }
    }
    Ok(())
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerSection, ConfigError> {
        Ok(PeerSection {
            public_key: self.public_key.ok_or(ConfigError::MissingField {
                field: "PublicKey in [Peer]".to_string(),
            })?,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

fn parse_key_b64(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[Interface]
PrivateKey = zJgOcf1GXipeehksXE/zHGo40vOMJIGE9chlrVamnP8=
Address = 10.0.0.2/24, fd00::2/64
ListenPort = 51820
FwMark = 51820
MTU = 1380

[Peer]
PublicKey = RgFlzC13A1rmmXtd0PjuhnhbNVbl2L/7qwkpOlVFPTg=
AllowedIPs = 10.0.0.0/24, 0.0.0.0/0
Endpoint = 203.0.113.5:51820
PersistentKeepalive = 25

[Peer]
PublicKey = YIxMU2AIRLH4Y6II6vNPt2AXXcN6t7t8QyTKpNt78I8=
AllowedIPs = 10.0.1.0/24
"#;

    #[test]
    fn parses_sections() {
        let config = TunnelConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.interface.addresses.len(), 2);
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.fwmark, Some(51820));
        assert_eq!(config.interface.mtu, Some(1380));

        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].persistent_keepalive, Some(25));
        assert_eq!(config.peers[0].allowed_ips.len(), 2);
        assert!(config.peers[1].endpoint.is_none());
    }

    #[test]
    fn converts_to_update() {
        let config = TunnelConfig::parse(SAMPLE).unwrap();
        let update = config.to_update();

        assert!(update.replace_peers);
        assert_eq!(update.listen_port, Some(51820));
        assert_eq!(update.fwmark, Some(Some(51820)));
        assert_eq!(update.peers.len(), 2);
        assert!(update.peers.iter().all(|p| p.replace_allowed_ips));
        assert_eq!(update.peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn missing_interface_fails() {
        let result = TunnelConfig::parse(
            "[Peer]\nPublicKey = RgFlzC13A1rmmXtd0PjuhnhbNVbl2L/7qwkpOlVFPTg=\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_private_key_fails() {
        let result = TunnelConfig::parse("[Interface]\nAddress = 10.0.0.2/24\n");
        assert!(result.is_err());
    }

    #[test]
    fn bad_key_fails() {
        let result =
            TunnelConfig::parse("[Interface]\nPrivateKey = not!base64\nAddress = 10.0.0.2/24\n");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidKey { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = TunnelConfig::parse(
            "[Interface]\nPrivateKey = zJgOcf1GXipeehksXE/zHGo40vOMJIGE9chlrVamnP8=\nDNS = 1.1.1.1\nTable = off\n",
        )
        .unwrap();
        assert!(config.peers.is_empty());
    }
}
