//! OS tunnel-hosting capability
//!
//! The packet engine lives outside this crate. The OS (or wireguard-tools)
//! hosts a single tunnel provider record that holds the config text; we
//! enable and save it, start or stop it, and poll its status.

mod memory;
mod wg_quick;

pub use memory::MemoryTunnelHost;
pub use wg_quick::WgQuickHost;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TunnelHostError;

/// Name shown in the OS VPN settings
pub const PROVIDER_DESCRIPTION: &str = "SkyLink VPN";

/// OS-reported tunnel status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    /// No provider record exists
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
}

impl TunnelStatus {
    /// Simplified view used by reconciliation
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            TunnelStatus::Connected | TunnelStatus::Connecting | TunnelStatus::Reasserting
        )
    }
}

/// The single OS-level object representing our tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub description: String,
    pub enabled: bool,
    /// Tunnel config text (may be empty for a fresh record)
    pub config: String,
}

impl ProviderRecord {
    /// A new, unsaved record
    pub fn new() -> Self {
        Self {
            description: PROVIDER_DESCRIPTION.to_string(),
            enabled: true,
            config: String::new(),
        }
    }
}

impl Default for ProviderRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Operations consumed from the OS tunnel host
#[async_trait]
pub trait TunnelHost: Send + Sync {
    /// Load the existing provider record or create a fresh unsaved one.
    /// Never creates a second record.
    async fn load_or_create(&self) -> Result<ProviderRecord, TunnelHostError>;

    /// Persist the provider record (replacing any existing one)
    async fn save(&self, record: &ProviderRecord) -> Result<(), TunnelHostError>;

    /// Ask the OS to start the tunnel
    async fn start(&self) -> Result<(), TunnelHostError>;

    /// Ask the OS to stop the tunnel
    async fn stop(&self) -> Result<(), TunnelHostError>;

    /// Current OS-reported status
    async fn status(&self) -> Result<TunnelStatus, TunnelHostError>;
}
