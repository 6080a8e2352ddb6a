//! wireguard-tools backed tunnel host
//!
//! The provider record is `<config_dir>/<name>.conf` plus a small JSON
//! sidecar with the description and enabled flag. Starting and stopping go
//! through `wg-quick` (the WireGuard tunnel service on Windows), status comes
//! from `wg show`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{ProviderRecord, TunnelHost, TunnelStatus, PROVIDER_DESCRIPTION};
use crate::config::TunnelConfig;
use crate::error::TunnelHostError;

#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    description: String,
    enabled: bool,
}

/// Tunnel host driving wg-quick
pub struct WgQuickHost {
    config_dir: PathBuf,
    name: String,
}

impl WgQuickHost {
    pub fn new(config_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            name: name.into(),
        }
    }

    /// Path of the config file wg-quick is pointed at
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.name))
    }

    fn meta_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.json", self.name))
    }

    fn read_meta(&self) -> RecordMeta {
        std::fs::read_to_string(self.meta_path())
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_else(|| RecordMeta {
                description: PROVIDER_DESCRIPTION.to_string(),
                enabled: true,
            })
    }

    fn is_enabled(&self) -> bool {
        self.config_path().exists() && self.read_meta().enabled
    }
}

#[async_trait]
impl TunnelHost for WgQuickHost {
    async fn load_or_create(&self) -> Result<ProviderRecord, TunnelHostError> {
        let path = self.config_path();
        let config = match std::fs::read_to_string(&path) {
            Ok(config) => config,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No provider record at {:?}, creating a new one", path);
                return Ok(ProviderRecord::new());
            }
            Err(e) => {
                return Err(TunnelHostError::LoadFailed {
                    reason: format!("{}: {}", path.display(), e),
                })
            }
        };

        // A stale or hand-edited record is still reused; it gets overwritten on save
        if let Err(e) = TunnelConfig::parse(&config) {
            tracing::warn!("Existing provider record is not a valid config: {}", e);
        }

        let meta = self.read_meta();
        tracing::debug!("Reusing existing provider record at {:?}", path);
        Ok(ProviderRecord {
            description: meta.description,
            enabled: meta.enabled,
            config,
        })
    }

    async fn save(&self, record: &ProviderRecord) -> Result<(), TunnelHostError> {
        let save_err = |e: std::io::Error| TunnelHostError::SaveFailed {
            reason: e.to_string(),
        };

        std::fs::create_dir_all(&self.config_dir).map_err(save_err)?;
        write_private(&self.config_path(), record.config.as_bytes()).map_err(save_err)?;

        let meta = RecordMeta {
            description: record.description.clone(),
            enabled: record.enabled,
        };
        let json = serde_json::to_string_pretty(&meta).map_err(|e| TunnelHostError::SaveFailed {
            reason: e.to_string(),
        })?;
        std::fs::write(self.meta_path(), json).map_err(save_err)?;

        tracing::debug!("Saved provider record to {:?}", self.config_path());
        Ok(())
    }

    async fn start(&self) -> Result<(), TunnelHostError> {
        if !self.config_path().exists() {
            return Err(TunnelHostError::NoProvider);
        }
        if !self.is_enabled() {
            return Err(TunnelHostError::StartFailed {
                reason: "provider is disabled".to_string(),
            });
        }

        let path = self.config_path().to_string_lossy().into_owned();

        #[cfg(not(target_os = "windows"))]
        let output = Command::new("wg-quick").args(["up", path.as_str()]).output().await;

        #[cfg(target_os = "windows")]
        let output = Command::new("wireguard")
            .args(["/installtunnelservice", path.as_str()])
            .output()
            .await;

        let output = output.map_err(|e| TunnelHostError::StartFailed {
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(TunnelHostError::StartFailed {
                reason: command_failure(&output),
            });
        }

        tracing::info!("Requested tunnel start for {}", self.name);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelHostError> {
        #[cfg(not(target_os = "windows"))]
        let output = {
            let path = self.config_path().to_string_lossy().into_owned();
            Command::new("wg-quick")
                .args(["down", path.as_str()])
                .output()
                .await
        };

        #[cfg(target_os = "windows")]
        let output = Command::new("wireguard")
            .args(["/uninstalltunnelservice", self.name.as_str()])
            .output()
            .await;

        let output = output.map_err(|e| TunnelHostError::StopFailed {
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(TunnelHostError::StopFailed {
                reason: command_failure(&output),
            });
        }

        tracing::info!("Requested tunnel stop for {}", self.name);
        Ok(())
    }

    async fn status(&self) -> Result<TunnelStatus, TunnelHostError> {
        if !self.config_path().exists() {
            return Ok(TunnelStatus::Invalid);
        }

        let output = Command::new("wg")
            .args(["show", self.name.as_str(), "latest-handshakes"])
            .output()
            .await
            .map_err(|e| TunnelHostError::StatusFailed {
                reason: e.to_string(),
            })?;

        // Interface absent
        if !output.status.success() {
            return Ok(TunnelStatus::Disconnected);
        }

        Ok(status_from_handshakes(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Map `wg show <iface> latest-handshakes` output to a status.
///
/// The interface is up; it counts as connected once any peer has completed
/// a handshake (non-zero timestamp).
fn status_from_handshakes(output: &str) -> TunnelStatus {
    let handshaken = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|ts| ts.parse::<u64>().map(|ts| ts > 0).unwrap_or(false));

    if handshaken {
        TunnelStatus::Connected
    } else {
        TunnelStatus::Connecting
    }
}

fn command_failure(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

/// Write a file readable only by its owner (it contains the private key)
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
