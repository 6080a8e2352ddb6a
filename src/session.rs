//! Tunnel session manager
//!
//! Owns the connection state machine:
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
//!
//! `connect()` and `disconnect()` only *request* work from the OS tunnel
//! host. The authoritative state is whatever the OS reports, picked up by
//! the reconciliation loop once per poll interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::TunnelConfig;
use crate::error::{Result, SkyLinkError, TunnelHostError};
use crate::events::{EventBus, SessionEvent};
use crate::keys::KeyStore;
use crate::negotiator::Negotiator;
use crate::selection::{Entitlement, ServerSelector};
use crate::store::{keys, KeyValueStore};
use crate::tunnel::TunnelHost;

/// Connection state as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a connect/disconnect request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Work was handed to the OS tunnel host
    Requested,
    /// Nothing to do in the current state
    NoOp,
}

struct SessionState {
    state: ConnectionState,
    /// Last OS-reported connected flag
    last_known: bool,
    /// Bumped on every connect; a result for an older attempt is discarded
    attempt: u64,
}

/// The tunnel session manager
pub struct TunnelSession {
    inner: Mutex<SessionState>,
    selector: Arc<ServerSelector>,
    keys: KeyStore,
    negotiator: Arc<dyn Negotiator>,
    host: Arc<dyn TunnelHost>,
    entitlement: Arc<dyn Entitlement>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
}

impl TunnelSession {
    pub fn new(
        selector: Arc<ServerSelector>,
        negotiator: Arc<dyn Negotiator>,
        host: Arc<dyn TunnelHost>,
        entitlement: Arc<dyn Entitlement>,
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
    ) -> Self {
        let last_known: bool = store.load(keys::LAST_CONNECTION_STATE).unwrap_or(false);
        let state = if last_known {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };

        Self {
            inner: Mutex::new(SessionState {
                state,
                last_known,
                attempt: 0,
            }),
            selector,
            keys: KeyStore::new(Arc::clone(&store)),
            negotiator,
            host,
            entitlement,
            store,
            events,
        }
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Start a connect attempt.
    ///
    /// The OS status is polled first, so a stale persisted state never blocks
    /// a connect. After that it is a no-op unless the session is
    /// `Disconnected`. On failure the session reverts to `Disconnected`, a
    /// `ConnectFailed` event is published and the error is returned. On
    /// success the tunnel has been asked to start and the session stays
    /// `Connecting` until reconciliation sees the OS come up.
    pub async fn connect(&self) -> Result<RequestOutcome> {
        if let Err(e) = self.reconcile_once().await {
            tracing::warn!("Status poll before connect failed: {}", e);
        }

        let attempt = {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnected {
                tracing::info!("Connect ignored, session is {}", inner.state);
                return Ok(RequestOutcome::NoOp);
            }
            inner.state = ConnectionState::Connecting;
            inner.attempt += 1;
            inner.attempt
        };

        tracing::info!("Connecting (attempt {})", attempt);
        self.events.emit(SessionEvent::Connecting);

        match self.establish(attempt).await {
            Ok(true) => Ok(RequestOutcome::Requested),
            Ok(false) => Ok(RequestOutcome::NoOp),
            Err(e) => {
                if self.fail_attempt(attempt, &e).await {
                    Err(e)
                } else {
                    Ok(RequestOutcome::NoOp)
                }
            }
        }
    }

    /// Resolve server and keys, negotiate, then hand the config to the OS.
    /// Returns `false` if the attempt was superseded before the tunnel started.
    async fn establish(&self, attempt: u64) -> Result<bool> {
        let server = self
            .selector
            .get_or_select_server(self.entitlement.is_subscribed())
            .await?;
        let credentials = self.keys.ensure_keys()?;

        let peer = self
            .negotiator
            .negotiate(&server, &credentials.public_key)
            .await?;
        tracing::info!(
            "Negotiated peer for {}: address {}, port {}",
            server.name,
            peer.assigned_address,
            peer.peer_port
        );

        if !self.is_current(attempt).await {
            tracing::info!("Discarding negotiation result for cancelled attempt {}", attempt);
            return Ok(false);
        }

        let config = TunnelConfig::from_session(&credentials, &server, &peer)?;

        let mut record = self.host.load_or_create().await.map_err(log_host_error)?;
        record.config = config.render();
        record.enabled = true;
        self.host.save(&record).await.map_err(log_host_error)?;

        if !self.is_current(attempt).await {
            tracing::info!("Attempt {} cancelled before tunnel start", attempt);
            return Ok(false);
        }

        self.host.start().await.map_err(log_host_error)?;
        tracing::info!("Tunnel start requested for {}", server.name);
        Ok(true)
    }

    async fn is_current(&self, attempt: u64) -> bool {
        let inner = self.inner.lock().await;
        inner.attempt == attempt && inner.state == ConnectionState::Connecting
    }

    /// Revert a failed attempt. Returns `false` when the attempt had already
    /// been cancelled, in which case the session is left alone.
    async fn fail_attempt(&self, attempt: u64, error: &SkyLinkError) -> bool {
        let reverted = {
            let mut inner = self.inner.lock().await;
            let current = inner.attempt == attempt && inner.state == ConnectionState::Connecting;
            if current {
                inner.state = ConnectionState::Disconnected;
            }
            current
        };

        if !reverted {
            tracing::info!("Ignoring failure of cancelled attempt {}: {}", attempt, error);
            return false;
        }

        tracing::warn!("Connect attempt {} failed: {}", attempt, error);
        self.events.emit(SessionEvent::ConnectFailed {
            reason: error.to_string(),
        });
        self.events.emit(SessionEvent::Disconnected);
        true
    }

    /// Request the tunnel to stop.
    ///
    /// A no-op if already `Disconnecting` or `Disconnected`. The OS is only
    /// asked to stop when it reports the tunnel up; the final transition to
    /// `Disconnected` comes from reconciliation.
    pub async fn disconnect(&self) -> Result<RequestOutcome> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                    tracing::info!("Disconnect ignored, session is {}", inner.state);
                    return Ok(RequestOutcome::NoOp);
                }
                _ => inner.state = ConnectionState::Disconnecting,
            }
        }

        tracing::info!("Disconnecting");
        self.events.emit(SessionEvent::Disconnecting);

        let status = match self.host.status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("Tunnel host error: {}", e);
                self.restore_after_failed_stop().await;
                return Err(e.into());
            }
        };
        if !status.is_connected() {
            tracing::debug!("Tunnel is {:?}, nothing to stop", status);
            return Ok(RequestOutcome::Requested);
        }

        if let Err(e) = self.host.stop().await {
            tracing::error!("Tunnel host error: {}", e);
            self.restore_after_failed_stop().await;
            return Err(e.into());
        }

        tracing::info!("Tunnel stop requested");
        Ok(RequestOutcome::Requested)
    }

    /// Fall back to whatever the OS last reported
    async fn restore_after_failed_stop(&self) {
        let event = {
            let mut inner = self.inner.lock().await;
            if inner.state != ConnectionState::Disconnecting {
                return;
            }
            if inner.last_known {
                inner.state = ConnectionState::Connected;
                SessionEvent::Connected
            } else {
                inner.state = ConnectionState::Disconnected;
                SessionEvent::Disconnected
            }
        };
        self.events.emit(event);
    }

    /// One reconciliation tick: compare the OS-reported status with the last
    /// known one and publish a change only when the connected flag flips.
    pub async fn reconcile_once(&self) -> std::result::Result<(), TunnelHostError> {
        let status = self.host.status().await?;
        let connected = status.is_connected();

        let (event, changed) = {
            let mut inner = self.inner.lock().await;
            if connected != inner.last_known {
                inner.last_known = connected;
                if connected {
                    inner.state = ConnectionState::Connected;
                    (Some(SessionEvent::Connected), true)
                } else {
                    inner.state = ConnectionState::Disconnected;
                    (Some(SessionEvent::Disconnected), true)
                }
            } else if !connected && inner.state == ConnectionState::Disconnecting {
                // Stop finished (or nothing was running): settle without a flag change
                inner.state = ConnectionState::Disconnected;
                (Some(SessionEvent::Disconnected), false)
            } else {
                (None, false)
            }
        };

        if changed {
            tracing::info!("Tunnel status changed: {:?} (connected: {})", status, connected);
            self.persist_connection(connected);
        }
        if let Some(event) = event {
            self.events.emit(event);
        }
        Ok(())
    }

    fn persist_connection(&self, connected: bool) {
        if let Err(e) = self.store.save(keys::LAST_CONNECTION_STATE, &connected) {
            tracing::warn!("Failed to persist connection state: {}", e);
        }

        let result = if connected {
            if self.connected_since().is_some() {
                Ok(())
            } else {
                self.store.save(keys::LAST_CONNECTED_DATE, &Utc::now())
            }
        } else {
            self.store.remove(keys::LAST_CONNECTED_DATE)
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist connection timestamp: {}", e);
        }
    }

    /// When the current connection started (survives restarts)
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.store.load(keys::LAST_CONNECTED_DATE)
    }

    /// Elapsed connection time as `HH:MM:SS`
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.connected_since().map(|since| Utc::now() - since))
    }

    /// Run reconciliation every `interval` until the returned handle is
    /// stopped or dropped.
    pub fn spawn_reconciler(self: &Arc<Self>, interval: Duration) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let session = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!("Reconciler started ({:?} interval)", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = session.reconcile_once().await {
                            tracing::warn!("Status poll failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Reconciler stopped");
        });

        ReconcilerHandle {
            shutdown_tx,
            task: Some(task),
        }
    }
}

/// Scope of a running reconciliation loop. Dropping it stops the loop.
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Stop the loop and wait for it to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Reconciler task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn log_host_error(e: TunnelHostError) -> TunnelHostError {
    tracing::error!("Tunnel host error: {}", e);
    e
}

/// Format a connection duration as `HH:MM:SS`, "00:00:00" when not connected
pub fn format_elapsed(elapsed: Option<chrono::Duration>) -> String {
    let secs = elapsed.map(|d| d.num_seconds().max(0)).unwrap_or(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{broadcast, Notify};

    use crate::catalog::source::tests::StaticFetcher;
    use crate::catalog::tests::TEST_CATALOG;
    use crate::catalog::{CatalogSource, Server};
    use crate::error::NetworkError;
    use crate::negotiator::PeerNegotiationResult;
    use crate::selection::StaticEntitlement;
    use crate::store::MemoryStore;
    use crate::tunnel::{MemoryTunnelHost, TunnelStatus};

    const PEER_KEY: &str = "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=";

    #[derive(Default)]
    struct TestNegotiator {
        calls: AtomicUsize,
        fail: bool,
        release: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Negotiator for TestNegotiator {
        async fn negotiate(
            &self,
            _server: &Server,
            _local_public_key: &str,
        ) -> std::result::Result<PeerNegotiationResult, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(release) = &self.release {
                release.notified().await;
            }
            if self.fail {
                return Err(NetworkError::Status {
                    url: "http://signal.test/connect".to_string(),
                    status: 502,
                });
            }
            Ok(PeerNegotiationResult {
                assigned_address: "10.0.0.2".to_string(),
                peer_public_key: PEER_KEY.to_string(),
                peer_port: 51820,
            })
        }
    }

    struct Fixture {
        session: Arc<TunnelSession>,
        host: Arc<MemoryTunnelHost>,
        negotiator: Arc<TestNegotiator>,
        store: Arc<dyn KeyValueStore>,
        rx: broadcast::Receiver<SessionEvent>,
    }

    impl Fixture {
        fn new(negotiator: TestNegotiator) -> Self {
            Self::with_store(negotiator, Arc::new(MemoryStore::new()))
        }

        fn with_store(negotiator: TestNegotiator, store: Arc<dyn KeyValueStore>) -> Self {
            let events = EventBus::new();
            let catalog = Arc::new(CatalogSource::new(
                Arc::clone(&store),
                Arc::new(StaticFetcher::new(Some(TEST_CATALOG))),
            ));
            let selector = Arc::new(ServerSelector::new(catalog, Arc::clone(&store), events.clone()));
            let host = Arc::new(MemoryTunnelHost::new());
            let negotiator = Arc::new(negotiator);
            let rx = events.subscribe();

            let session = Arc::new(TunnelSession::new(
                selector,
                Arc::clone(&negotiator) as Arc<dyn Negotiator>,
                Arc::clone(&host) as Arc<dyn TunnelHost>,
                Arc::new(StaticEntitlement(false)),
                Arc::clone(&store),
                events,
            ));

            Self {
                session,
                host,
                negotiator,
                store,
                rx,
            }
        }

        /// Session events published so far, without selection updates
        fn events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                if !matches!(event, SessionEvent::ServerUpdated { .. }) {
                    events.push(event);
                }
            }
            events
        }

        fn negotiations(&self) -> usize {
            self.negotiator.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_connect_is_single_flight() {
        let mut f = Fixture::new(TestNegotiator::default());

        assert_eq!(f.session.connect().await.unwrap(), RequestOutcome::Requested);
        assert_eq!(f.session.state().await, ConnectionState::Connecting);

        // Still connecting
        assert_eq!(f.session.connect().await.unwrap(), RequestOutcome::NoOp);

        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.state().await, ConnectionState::Connected);

        // Connected
        assert_eq!(f.session.connect().await.unwrap(), RequestOutcome::NoOp);

        assert_eq!(f.negotiations(), 1);
        assert_eq!(f.host.records_created(), 1);
        assert_eq!(f.host.start_calls(), 1);
        assert_eq!(
            f.events(),
            vec![SessionEvent::Connecting, SessionEvent::Connected]
        );
    }

    #[tokio::test]
    async fn test_connect_writes_rendered_config() {
        let f = Fixture::new(TestNegotiator::default());
        f.session.connect().await.unwrap();

        let record = f.host.record().unwrap();
        assert!(record.enabled);

        let config = TunnelConfig::parse(&record.config).unwrap();
        assert_eq!(config.address, "10.0.0.2");
        assert_eq!(config.peer_public_key, PEER_KEY);
        assert_eq!(config.endpoint_port, 51820);

        let server: Server = f.store.load(keys::CURRENT_SERVER).unwrap();
        assert_eq!(Some(config.endpoint_host), server.public_ip);
    }

    #[tokio::test]
    async fn test_reconnect_reuses_provider_record() {
        let f = Fixture::new(TestNegotiator::default());

        f.session.connect().await.unwrap();
        f.session.reconcile_once().await.unwrap();
        f.session.disconnect().await.unwrap();
        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);

        f.session.connect().await.unwrap();
        assert_eq!(f.negotiations(), 2);
        assert_eq!(f.host.records_created(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_emits_only_on_change() {
        let mut f = Fixture::new(TestNegotiator::default());

        f.host.set_status(TunnelStatus::Connected);
        f.session.reconcile_once().await.unwrap();
        f.session.reconcile_once().await.unwrap();
        f.host.set_status(TunnelStatus::Disconnected);
        f.session.reconcile_once().await.unwrap();

        assert_eq!(
            f.events(),
            vec![SessionEvent::Connected, SessionEvent::Disconnected]
        );
        assert_eq!(f.store.load::<bool>(keys::LAST_CONNECTION_STATE), Some(false));
        assert!(f.session.connected_since().is_none());
    }

    #[tokio::test]
    async fn test_reasserting_counts_as_connected() {
        let mut f = Fixture::new(TestNegotiator::default());

        f.host.set_status(TunnelStatus::Connecting);
        f.session.reconcile_once().await.unwrap();
        f.host.set_status(TunnelStatus::Reasserting);
        f.session.reconcile_once().await.unwrap();

        assert_eq!(f.events(), vec![SessionEvent::Connected]);
        assert_eq!(f.store.load::<bool>(keys::LAST_CONNECTION_STATE), Some(true));
    }

    #[tokio::test]
    async fn test_connected_timestamp_is_not_overwritten() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let earlier: DateTime<Utc> = "2026-01-02T03:04:05Z".parse().unwrap();
        store.save(keys::LAST_CONNECTED_DATE, &earlier).unwrap();

        let f = Fixture::with_store(TestNegotiator::default(), store);
        f.host.set_status(TunnelStatus::Connected);
        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.connected_since(), Some(earlier));

        f.host.set_status(TunnelStatus::Disconnected);
        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.connected_since(), None);
        assert_eq!(f.session.elapsed_display(), "00:00:00");
    }

    #[tokio::test]
    async fn test_connected_timestamp_recorded() {
        let f = Fixture::new(TestNegotiator::default());
        let before = Utc::now();

        f.host.set_status(TunnelStatus::Connected);
        f.session.reconcile_once().await.unwrap();

        let since = f.session.connected_since().unwrap();
        assert!(since >= before && since <= Utc::now());
    }

    #[tokio::test]
    async fn test_persisted_state_still_connected() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.save(keys::LAST_CONNECTION_STATE, &true).unwrap();

        let mut f = Fixture::with_store(TestNegotiator::default(), store);
        assert_eq!(f.session.state().await, ConnectionState::Connected);

        // OS still reports the tunnel: nothing to announce, nothing to do
        f.host.set_status(TunnelStatus::Connected);
        assert_eq!(f.session.connect().await.unwrap(), RequestOutcome::NoOp);
        assert_eq!(f.negotiations(), 0);
        assert!(f.events().is_empty());
    }

    #[tokio::test]
    async fn test_connect_after_tunnel_dropped_while_away() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.save(keys::LAST_CONNECTION_STATE, &true).unwrap();

        let mut f = Fixture::with_store(TestNegotiator::default(), Arc::clone(&store));
        f.host.set_status(TunnelStatus::Disconnected);

        assert_eq!(f.session.connect().await.unwrap(), RequestOutcome::Requested);
        assert_eq!(f.negotiations(), 1);
        assert_eq!(f.host.start_calls(), 1);
        assert_eq!(f.session.state().await, ConnectionState::Connecting);
        assert_eq!(store.load::<bool>(keys::LAST_CONNECTION_STATE), Some(false));
        assert_eq!(
            f.events(),
            vec![SessionEvent::Disconnected, SessionEvent::Connecting]
        );
    }

    #[tokio::test]
    async fn test_negotiation_failure_reverts() {
        let mut f = Fixture::new(TestNegotiator {
            fail: true,
            ..Default::default()
        });

        let err = f.session.connect().await.unwrap_err();
        assert!(matches!(err, SkyLinkError::Network(NetworkError::Status { status: 502, .. })));
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
        assert_eq!(f.host.records_created(), 0);

        let events = f.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], SessionEvent::Connecting);
        assert!(matches!(events[1], SessionEvent::ConnectFailed { .. }));
        assert_eq!(events[2], SessionEvent::Disconnected);

        // User retries by connecting again
        assert!(f.session.connect().await.is_err());
        assert_eq!(f.negotiations(), 2);
    }

    #[tokio::test]
    async fn test_host_start_failure_reverts() {
        let f = Fixture::new(TestNegotiator::default());
        f.host.fail_start(true);

        let err = f.session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SkyLinkError::TunnelHost(TunnelHostError::StartFailed { .. })
        ));
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_host_save_failure_reverts() {
        let f = Fixture::new(TestNegotiator::default());
        f.host.fail_save(true);

        assert!(f.session.connect().await.is_err());
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
        assert_eq!(f.host.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_late_negotiation_is_discarded() {
        let release = Arc::new(Notify::new());
        let mut f = Fixture::new(TestNegotiator {
            release: Some(Arc::clone(&release)),
            ..Default::default()
        });

        let session = Arc::clone(&f.session);
        let connect = tokio::spawn(async move { session.connect().await });

        while f.negotiations() == 0 {
            tokio::task::yield_now().await;
        }

        // Nothing is running yet, so there is nothing to stop
        assert_eq!(f.session.disconnect().await.unwrap(), RequestOutcome::Requested);
        assert_eq!(f.host.stop_calls(), 0);
        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);

        release.notify_one();
        assert_eq!(connect.await.unwrap().unwrap(), RequestOutcome::NoOp);

        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
        assert_eq!(f.host.records_created(), 0);
        assert_eq!(f.host.start_calls(), 0);
        assert_eq!(
            f.events(),
            vec![
                SessionEvent::Connecting,
                SessionEvent::Disconnecting,
                SessionEvent::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_late_failure_of_cancelled_attempt_is_silent() {
        let release = Arc::new(Notify::new());
        let mut f = Fixture::new(TestNegotiator {
            fail: true,
            release: Some(Arc::clone(&release)),
            ..Default::default()
        });

        let session = Arc::clone(&f.session);
        let connect = tokio::spawn(async move { session.connect().await });

        while f.negotiations() == 0 {
            tokio::task::yield_now().await;
        }

        f.session.disconnect().await.unwrap();
        f.session.reconcile_once().await.unwrap();

        release.notify_one();
        assert_eq!(connect.await.unwrap().unwrap(), RequestOutcome::NoOp);

        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
        assert_eq!(
            f.events(),
            vec![
                SessionEvent::Connecting,
                SessionEvent::Disconnecting,
                SessionEvent::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_status_failure_restores_state() {
        let mut f = Fixture::new(TestNegotiator::default());
        f.session.connect().await.unwrap();
        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.state().await, ConnectionState::Connected);
        f.events();

        f.host.fail_status(true);
        let err = f.session.disconnect().await.unwrap_err();
        assert!(matches!(
            err,
            SkyLinkError::TunnelHost(TunnelHostError::StatusFailed { .. })
        ));
        assert_eq!(f.session.state().await, ConnectionState::Connected);
        assert_eq!(
            f.events(),
            vec![SessionEvent::Disconnecting, SessionEvent::Connected]
        );
        assert!(f.session.reconcile_once().await.is_err());

        // Recovers once the host answers again
        f.host.fail_status(false);
        assert_eq!(f.session.disconnect().await.unwrap(), RequestOutcome::Requested);
        assert_eq!(f.host.stop_calls(), 1);
        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_stops_running_tunnel() {
        let mut f = Fixture::new(TestNegotiator::default());
        f.session.connect().await.unwrap();
        f.session.reconcile_once().await.unwrap();
        f.events();

        assert_eq!(f.session.disconnect().await.unwrap(), RequestOutcome::Requested);
        assert_eq!(f.session.state().await, ConnectionState::Disconnecting);
        assert_eq!(f.host.stop_calls(), 1);

        // Repeated disconnect while the OS winds down
        assert_eq!(f.session.disconnect().await.unwrap(), RequestOutcome::NoOp);

        f.session.reconcile_once().await.unwrap();
        assert_eq!(f.session.state().await, ConnectionState::Disconnected);
        assert_eq!(
            f.events(),
            vec![SessionEvent::Disconnecting, SessionEvent::Disconnected]
        );

        assert_eq!(f.session.disconnect().await.unwrap(), RequestOutcome::NoOp);
        assert_eq!(f.host.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_runs_until_stopped() {
        let mut f = Fixture::new(TestNegotiator::default());
        let handle = f.session.spawn_reconciler(Duration::from_secs(1));
        assert!(handle.is_running());

        f.host.set_status(TunnelStatus::Connected);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(f.session.state().await, ConnectionState::Connected);

        handle.stop().await;

        // No more ticks after stop
        f.host.set_status(TunnelStatus::Disconnected);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.session.state().await, ConnectionState::Connected);
        assert_eq!(f.events(), vec![SessionEvent::Connected]);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(None), "00:00:00");
        assert_eq!(format_elapsed(Some(chrono::Duration::seconds(59))), "00:00:59");
        assert_eq!(format_elapsed(Some(chrono::Duration::seconds(3723))), "01:02:03");
        assert_eq!(format_elapsed(Some(chrono::Duration::seconds(-5))), "00:00:00");
    }
}
