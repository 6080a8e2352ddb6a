//! Client settings
//!
//! Resolved once at startup (CLI flags / environment over these defaults)
//! and handed to [`crate::VpnService`].

use std::path::PathBuf;
use std::time::Duration;

use crate::store::default_state_file;

/// Remote directory document
pub const DEFAULT_DIRECTORY_URL: &str = "https://directory.skylinkvpn.app/servers.json";

/// Signaling endpoint for peer negotiation
pub const DEFAULT_SIGNALING_URL: &str = "https://signal.skylinkvpn.app/v1/negotiate";

/// Name of the tunnel interface / provider record
pub const DEFAULT_TUNNEL_NAME: &str = "skylink";

/// Reconciliation period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Applied by the HTTP clients; the core itself sets no timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default daemon REST port
pub const DEFAULT_HTTP_PORT: u16 = 51830;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub directory_url: String,
    pub signaling_url: String,
    /// Key/value state file
    pub state_file: PathBuf,
    pub tunnel_name: String,
    /// Where the tunnel host keeps its provider record
    pub config_dir: PathBuf,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    /// Use the in-process tunnel host instead of wg-quick
    pub dry_run: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            state_file: default_state_file(),
            tunnel_name: DEFAULT_TUNNEL_NAME.to_string(),
            config_dir: default_config_dir(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            dry_run: false,
        }
    }
}

/// Platform default for tunnel config files
pub fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        PathBuf::from(r"C:\ProgramData\SkyLink\tunnels")
    }

    #[cfg(not(target_os = "windows"))]
    {
        PathBuf::from("/etc/wireguard")
    }
}
