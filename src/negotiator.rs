//! Session negotiation with the signaling endpoint
//!
//! One request/response exchange per connect attempt: the server's public IP
//! and port plus our public key go out, the peer endpoint parameters come
//! back. There is no retry here; a failure ends the attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::Server;
use crate::error::NetworkError;

/// Port used when a server entry has none
pub const DEFAULT_SERVER_PORT: u16 = 5000;

/// Negotiation request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRequest {
    #[serde(rename = "serverIP")]
    pub server_ip: String,
    pub server_port: u16,
    pub local_public_key: String,
}

/// Peer parameters returned by the signaling endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNegotiationResult {
    /// Tunnel address assigned to us
    #[serde(alias = "ip")]
    pub assigned_address: String,
    #[serde(alias = "publicKey")]
    pub peer_public_key: String,
    #[serde(alias = "port")]
    pub peer_port: u16,
}

impl NegotiationRequest {
    /// Build the request for a server, failing if it has no public IP
    pub fn for_server(server: &Server, local_public_key: &str) -> Result<Self, NetworkError> {
        let server_ip = server
            .public_ip
            .clone()
            .filter(|ip| !ip.trim().is_empty())
            .ok_or_else(|| NetworkError::NoEndpoint {
                server: server.name.clone(),
            })?;

        Ok(Self {
            server_ip,
            server_port: server.port.unwrap_or(DEFAULT_SERVER_PORT),
            local_public_key: local_public_key.to_string(),
        })
    }
}

/// Obtains a peer configuration for a chosen server
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(
        &self,
        server: &Server,
        local_public_key: &str,
    ) -> Result<PeerNegotiationResult, NetworkError>;
}

/// Negotiates over HTTP with the remote signaling endpoint
pub struct HttpNegotiator {
    http: reqwest::Client,
    url: String,
}

impl HttpNegotiator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        let url = url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Request {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { http, url })
    }

    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Negotiator for HttpNegotiator {
    async fn negotiate(
        &self,
        server: &Server,
        local_public_key: &str,
    ) -> Result<PeerNegotiationResult, NetworkError> {
        let request = NegotiationRequest::for_server(server, local_public_key)?;
        tracing::info!(
            "Negotiating peer for {} ({}:{})",
            server.name,
            request.server_ip,
            request.server_port
        );

        let resp = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| NetworkError::Request {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let result: PeerNegotiationResult =
            resp.json().await.map_err(|e| NetworkError::InvalidResponse {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        if result.assigned_address.parse::<std::net::IpAddr>().is_err() {
            return Err(NetworkError::InvalidResponse {
                url: self.url.clone(),
                reason: format!("assigned address {:?} is not an IP", result.assigned_address),
            });
        }

        tracing::debug!(
            "Negotiated address {} on peer port {}",
            result.assigned_address,
            result.peer_port
        );
        Ok(result)
    }
}
