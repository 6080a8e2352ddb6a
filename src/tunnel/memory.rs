//! In-process tunnel host
//!
//! Keeps the provider record in memory and lets the caller script the
//! status the "OS" reports. Used by tests and `--dry-run`.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ProviderRecord, TunnelHost, TunnelStatus};
use crate::error::TunnelHostError;

#[derive(Default)]
struct HostState {
    record: Option<ProviderRecord>,
    records_created: usize,
    status: Option<TunnelStatus>,
    start_calls: usize,
    stop_calls: usize,
    fail_start: bool,
    fail_save: bool,
    fail_status: bool,
    connect_on_start: bool,
}

/// Scriptable in-memory tunnel host
#[derive(Default)]
pub struct MemoryTunnelHost {
    state: Mutex<HostState>,
}

impl MemoryTunnelHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose tunnel reports connected as soon as it is started
    pub fn connecting_immediately() -> Self {
        let host = Self::new();
        host.state().connect_on_start = true;
        host
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Script the status the OS reports next
    pub fn set_status(&self, status: TunnelStatus) {
        self.state().status = Some(status);
    }

    /// Make the next start requests fail
    pub fn fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    /// Make the next save requests fail
    pub fn fail_save(&self, fail: bool) {
        self.state().fail_save = fail;
    }

    /// Make status queries fail
    pub fn fail_status(&self, fail: bool) {
        self.state().fail_status = fail;
    }

    /// The saved provider record
    pub fn record(&self) -> Option<ProviderRecord> {
        self.state().record.clone()
    }

    /// How many distinct provider records were ever saved
    pub fn records_created(&self) -> usize {
        self.state().records_created
    }

    pub fn start_calls(&self) -> usize {
        self.state().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state().stop_calls
    }
}

#[async_trait]
impl TunnelHost for MemoryTunnelHost {
    async fn load_or_create(&self) -> Result<ProviderRecord, TunnelHostError> {
        Ok(self.state().record.clone().unwrap_or_default())
    }

    async fn save(&self, record: &ProviderRecord) -> Result<(), TunnelHostError> {
        let mut state = self.state();
        if state.fail_save {
            return Err(TunnelHostError::SaveFailed {
                reason: "save rejected by host".to_string(),
            });
        }
        if state.record.is_none() {
            state.records_created += 1;
            state.status.get_or_insert(TunnelStatus::Disconnected);
        }
        state.record = Some(record.clone());
        Ok(())
    }

    async fn start(&self) -> Result<(), TunnelHostError> {
        let mut state = self.state();
        state.start_calls += 1;
        if state.fail_start {
            return Err(TunnelHostError::StartFailed {
                reason: "start rejected by host".to_string(),
            });
        }
        match &state.record {
            Some(record) if record.enabled => {}
            Some(_) => {
                return Err(TunnelHostError::StartFailed {
                    reason: "provider is disabled".to_string(),
                })
            }
            None => return Err(TunnelHostError::NoProvider),
        }
        state.status = Some(if state.connect_on_start {
            TunnelStatus::Connected
        } else {
            TunnelStatus::Connecting
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelHostError> {
        let mut state = self.state();
        state.stop_calls += 1;
        if state.record.is_none() {
            return Err(TunnelHostError::NoProvider);
        }
        state.status = Some(TunnelStatus::Disconnected);
        Ok(())
    }

    async fn status(&self) -> Result<TunnelStatus, TunnelHostError> {
        let state = self.state();
        if state.fail_status {
            return Err(TunnelHostError::StatusFailed {
                reason: "status query rejected by host".to_string(),
            });
        }
        Ok(state.status.unwrap_or(TunnelStatus::Invalid))
    }
}
