//! Tunnel configuration text
//!
//! Builds the wg-quick style `[Interface]`/`[Peer]` text handed to the OS
//! tunnel host, and reads it back when an existing provider record is
//! reloaded. Field order and defaults are fixed; the tunnel host expects
//! exactly this layout.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

use crate::catalog::Server;
use crate::error::ConfigError;
use crate::keys::{decode_key, TunnelCredentials};
use crate::negotiator::PeerNegotiationResult;

/// DNS resolver pushed into the tunnel
pub const DEFAULT_DNS: &str = "1.1.1.1";

/// Route everything through the tunnel
pub const DEFAULT_ALLOWED_IPS: &str = "0.0.0.0/0";

/// Keepalive interval in seconds
pub const DEFAULT_KEEPALIVE: u16 = 25;

/// Complete tunnel configuration for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Our private key (base64)
    pub private_key: String,
    /// Address assigned by negotiation (host, rendered as /32)
    pub address: String,
    pub dns: String,
    /// Peer public key (base64)
    pub peer_public_key: String,
    /// Server public IP
    pub endpoint_host: String,
    /// Negotiated peer port
    pub endpoint_port: u16,
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
}

impl TunnelConfig {
    /// Combine credentials, the chosen server and the negotiation result
    pub fn from_session(
        credentials: &TunnelCredentials,
        server: &Server,
        peer: &PeerNegotiationResult,
    ) -> Result<Self, ConfigError> {
        let endpoint_host = server.public_ip.clone().ok_or(ConfigError::MissingField {
            field: format!("publicIP of {}", server.name),
        })?;

        Ok(Self::new(
            &credentials.private_key,
            &peer.assigned_address,
            &peer.peer_public_key,
            &endpoint_host,
            peer.peer_port,
        ))
    }

    /// Build a config with the protocol defaults (DNS, allowed IPs, keepalive)
    pub fn new(
        private_key: &str,
        address: &str,
        peer_public_key: &str,
        endpoint_host: &str,
        endpoint_port: u16,
    ) -> Self {
        Self {
            private_key: private_key.to_string(),
            address: address.to_string(),
            dns: DEFAULT_DNS.to_string(),
            peer_public_key: peer_public_key.to_string(),
            endpoint_host: endpoint_host.to_string(),
            endpoint_port,
            allowed_ips: DEFAULT_ALLOWED_IPS.to_string(),
            persistent_keepalive: DEFAULT_KEEPALIVE,
        }
    }

    /// Peer endpoint as `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.endpoint_host, self.endpoint_port)
    }

    /// Render the config text in the fixed field order
    pub fn render(&self) -> String {
        format!(
            "[Interface]\n\
             PrivateKey = {}\n\
             Address = {}/32\n\
             DNS = {}\n\
             \n\
             [Peer]\n\
             PublicKey = {}\n\
             Endpoint = {}\n\
             AllowedIPs = {}\n\
             PersistentKeepalive = {}",
            self.private_key,
            self.address,
            self.dns,
            self.peer_public_key,
            self.endpoint(),
            self.allowed_ips,
            self.persistent_keepalive
        )
    }

    /// Parse config text previously produced by [`TunnelConfig::render`]
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::default();
        let mut current_section: Option<Section> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if builder.seen_peer {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Only one [Peer] section is supported".to_string(),
                    });
                }
                builder.seen_peer = true;
                current_section = Some(Section::Peer);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => match key.as_str() {
                    "privatekey" => {
                        check_key(value, "PrivateKey")?;
                        builder.private_key = Some(value.to_string());
                    }
                    "address" => {
                        let net: IpNet = value.parse().map_err(|_| ConfigError::InvalidCidr {
                            value: value.to_string(),
                        })?;
                        builder.address = Some(net.addr().to_string());
                    }
                    "dns" => {
                        value.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddress {
                            value: value.to_string(),
                        })?;
                        builder.dns = Some(value.to_string());
                    }
                    _ => {
                        // Unknown key, ignore (forward compatibility)
                        tracing::debug!("Unknown interface key: {}", key);
                    }
                },
                Some(Section::Peer) => match key.as_str() {
                    "publickey" => {
                        check_key(value, "PublicKey")?;
                        builder.peer_public_key = Some(value.to_string());
                    }
                    "endpoint" => {
                        let endpoint: SocketAddr =
                            value.parse().map_err(|_| ConfigError::InvalidAddress {
                                value: value.to_string(),
                            })?;
                        builder.endpoint = Some(endpoint);
                    }
                    "allowedips" => {
                        for ip_str in value.split(',') {
                            ip_str.trim().parse::<IpNet>().map_err(|_| {
                                ConfigError::InvalidCidr {
                                    value: ip_str.trim().to_string(),
                                }
                            })?;
                        }
                        builder.allowed_ips = Some(value.to_string());
                    }
                    "persistentkeepalive" => {
                        builder.persistent_keepalive =
                            Some(value.parse().map_err(|_| ConfigError::ParseError {
                                line: line_num,
                                message: format!("Invalid PersistentKeepalive: {}", value),
                            })?);
                    }
                    _ => {
                        tracing::debug!("Unknown peer key: {}", key);
                    }
                },
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        builder.build()
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct ConfigBuilder {
    seen_peer: bool,
    private_key: Option<String>,
    address: Option<String>,
    dns: Option<String>,
    peer_public_key: Option<String>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Option<String>,
    persistent_keepalive: Option<u16>,
}

impl ConfigBuilder {
    fn build(self) -> Result<TunnelConfig, ConfigError> {
        let missing = |field: &str| ConfigError::MissingField {
            field: field.to_string(),
        };

        let endpoint = self.endpoint.ok_or_else(|| missing("Endpoint in [Peer]"))?;

        Ok(TunnelConfig {
            private_key: self.private_key.ok_or_else(|| missing("PrivateKey"))?,
            address: self.address.ok_or_else(|| missing("Address"))?,
            dns: self.dns.unwrap_or_else(|| DEFAULT_DNS.to_string()),
            peer_public_key: self
                .peer_public_key
                .ok_or_else(|| missing("PublicKey in [Peer]"))?,
            endpoint_host: endpoint.ip().to_string(),
            endpoint_port: endpoint.port(),
            allowed_ips: self
                .allowed_ips
                .unwrap_or_else(|| DEFAULT_ALLOWED_IPS.to_string()),
            persistent_keepalive: self.persistent_keepalive.unwrap_or(DEFAULT_KEEPALIVE),
        })
    }
}

/// Check a base64-encoded 32-byte key
fn check_key(value: &str, field_name: &str) -> Result<(), ConfigError> {
    decode_key(value).map(|_| ()).ok_or(ConfigError::InvalidKey {
        field: field_name.to_string(),
    })
}
