//! Service wiring
//!
//! Builds every component once and hands out shared references. This is the
//! single entry point for the CLI and the daemon routes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{CatalogFetcher, CatalogSource, HttpCatalogFetcher, Server};
use crate::directory::{self, CountryKey, DirectoryRow, ExpandedSet};
use crate::error::{Result, SelectionError};
use crate::events::EventBus;
use crate::negotiator::{HttpNegotiator, Negotiator};
use crate::selection::{Entitlement, ServerSelector};
use crate::session::{ConnectionState, ReconcilerHandle, RequestOutcome, TunnelSession};
use crate::settings::ClientSettings;
use crate::store::{FileStore, KeyValueStore};
use crate::tunnel::{MemoryTunnelHost, TunnelHost, WgQuickHost};

/// Snapshot reported by `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    /// Persisted selected server
    pub server: Option<Server>,
    pub connected_since: Option<DateTime<Utc>>,
    /// `HH:MM:SS`
    pub elapsed: String,
}

pub struct VpnService {
    catalog: Arc<CatalogSource>,
    selector: Arc<ServerSelector>,
    session: Arc<TunnelSession>,
    entitlement: Arc<dyn Entitlement>,
    events: EventBus,
    settings: ClientSettings,
}

impl VpnService {
    /// Wire the service from explicit collaborators
    pub fn new(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn CatalogFetcher>,
        negotiator: Arc<dyn Negotiator>,
        host: Arc<dyn TunnelHost>,
        entitlement: Arc<dyn Entitlement>,
    ) -> Self {
        let events = EventBus::new();
        let catalog = Arc::new(CatalogSource::new(Arc::clone(&store), fetcher));
        let selector = Arc::new(ServerSelector::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            events.clone(),
        ));
        let session = Arc::new(TunnelSession::new(
            Arc::clone(&selector),
            negotiator,
            host,
            Arc::clone(&entitlement),
            store,
            events.clone(),
        ));

        Self {
            catalog,
            selector,
            session,
            entitlement,
            events,
            settings,
        }
    }

    /// Wire the production stack: file store, HTTP directory and signaling,
    /// wg-quick tunnel host (in-process host on dry runs)
    pub fn from_settings(settings: ClientSettings, entitlement: Arc<dyn Entitlement>) -> Result<Self> {
        tracing::debug!("Using state file {:?}", settings.state_file);
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&settings.state_file));

        let fetcher = Arc::new(HttpCatalogFetcher::new(
            settings.directory_url.clone(),
            settings.http_timeout,
        )?);
        let negotiator = Arc::new(HttpNegotiator::new(
            settings.signaling_url.clone(),
            settings.http_timeout,
        )?);

        let host: Arc<dyn TunnelHost> = if settings.dry_run {
            tracing::info!("Dry run: tunnel host is in-process only");
            Arc::new(MemoryTunnelHost::connecting_immediately())
        } else {
            Arc::new(WgQuickHost::new(&settings.config_dir, &settings.tunnel_name))
        };

        Ok(Self::new(settings, store, fetcher, negotiator, host, entitlement))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &Arc<TunnelSession> {
        &self.session
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub async fn connect(&self) -> Result<RequestOutcome> {
        self.session.connect().await
    }

    pub async fn disconnect(&self) -> Result<RequestOutcome> {
        self.session.disconnect().await
    }

    /// Reconcile once with the OS, then report
    pub async fn status(&self) -> StatusSnapshot {
        if let Err(e) = self.session.reconcile_once().await {
            tracing::warn!("Status poll failed: {}", e);
        }

        StatusSnapshot {
            state: self.session.state().await,
            server: self.selector.selected(),
            connected_since: self.session.connected_since(),
            elapsed: self.session.elapsed_display(),
        }
    }

    /// Directory rows: search results for a non-blank query, otherwise every
    /// country expanded
    pub async fn servers(&self, query: Option<&str>) -> Result<Vec<DirectoryRow>> {
        let catalog = self.catalog.ensure_loaded().await?;

        let mut servers = catalog.free_servers();
        servers.extend(catalog.premium_servers());
        if let Some(rows) = query.and_then(|q| directory::search(q, &servers)) {
            return Ok(rows);
        }

        let view = directory::DirectoryView::new(&catalog);
        let expanded: ExpandedSet = view
            .rows()
            .iter()
            .filter(|row| matches!(row, DirectoryRow::Country { .. }))
            .scan([0usize; 2], |next, row| {
                let section = row.section();
                let index = next[section];
                next[section] += 1;
                Some(CountryKey { section, index })
            })
            .collect();
        Ok(directory::rebuild(&catalog, &expanded))
    }

    /// Explicit server selection by name.
    ///
    /// Applies the subscription gate, then drops the current session so the
    /// next connect uses the new server. Once the gate has passed the
    /// selection stands; a failed disconnect is only logged.
    pub async fn select_server(&self, name: &str) -> Result<Server> {
        let catalog = self.catalog.ensure_loaded().await?;
        let server = catalog
            .find(name)
            .cloned()
            .ok_or_else(|| SelectionError::UnknownServer {
                name: name.to_string(),
            })?;

        self.selector
            .select_server(&server, self.entitlement.is_subscribed())?;
        if let Err(e) = self.session.disconnect().await {
            tracing::warn!("Selected {} but could not drop the current session: {}", server.name, e);
        }
        Ok(server)
    }

    /// Re-download the directory; returns the number of servers
    pub async fn refresh(&self) -> Result<usize> {
        let catalog = self.catalog.refresh().await?;
        Ok(catalog.servers().count())
    }

    /// Start the reconciliation loop for the lifetime of the returned handle
    pub fn spawn_reconciler(&self) -> ReconcilerHandle {
        self.session.spawn_reconciler(self.settings.poll_interval)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::catalog::source::tests::StaticFetcher;
    use crate::catalog::tests::TEST_CATALOG;
    use crate::error::{NetworkError, SkyLinkError};
    use crate::events::SessionEvent;
    use crate::negotiator::PeerNegotiationResult;
    use crate::selection::StaticEntitlement;
    use crate::store::{keys, MemoryStore};
    use crate::tunnel::TunnelStatus;

    pub(crate) struct FixedNegotiator;

    #[async_trait]
    impl Negotiator for FixedNegotiator {
        async fn negotiate(
            &self,
            _server: &Server,
            _local_public_key: &str,
        ) -> std::result::Result<PeerNegotiationResult, NetworkError> {
            Ok(PeerNegotiationResult {
                assigned_address: "10.0.0.2".to_string(),
                peer_public_key: "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=".to_string(),
                peer_port: 51820,
            })
        }
    }

    /// Service over in-memory collaborators
    pub(crate) fn test_service(subscribed: bool) -> (VpnService, Arc<MemoryTunnelHost>, Arc<dyn KeyValueStore>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryTunnelHost::new());
        let service = VpnService::new(
            ClientSettings::default(),
            Arc::clone(&store),
            Arc::new(StaticFetcher::new(Some(TEST_CATALOG))),
            Arc::new(FixedNegotiator),
            Arc::clone(&host) as Arc<dyn TunnelHost>,
            Arc::new(StaticEntitlement(subscribed)),
        );
        (service, host, store)
    }

    #[tokio::test]
    async fn test_select_premium_without_subscription() {
        let (service, _, store) = test_service(false);

        let err = service.select_server("us-nyc-1").await.unwrap_err();
        assert!(matches!(
            err,
            SkyLinkError::Selection(SelectionError::SubscriptionRequired { .. })
        ));
        assert!(store.load::<Server>(keys::CURRENT_SERVER).is_none());
    }

    #[tokio::test]
    async fn test_select_disconnects_active_session() {
        let (service, host, _) = test_service(true);
        let mut rx = service.events().subscribe();

        service.connect().await.unwrap();
        host.set_status(TunnelStatus::Connected);
        assert_eq!(service.status().await.state, ConnectionState::Connected);

        let server = service.select_server("us-nyc-1").await.unwrap();
        assert_eq!(server.name, "us-nyc-1");
        assert_eq!(host.stop_calls(), 1);
        assert_eq!(service.session().state().await, ConnectionState::Disconnecting);

        let status = service.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.server.map(|s| s.name), Some("us-nyc-1".to_string()));
        assert_eq!(status.elapsed, "00:00:00");

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::ServerUpdated {
            server: "us-nyc-1".to_string()
        }));
        assert_eq!(seen.last(), Some(&SessionEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_select_survives_failed_disconnect() {
        let (service, host, store) = test_service(true);

        service.connect().await.unwrap();
        host.set_status(TunnelStatus::Connected);
        assert_eq!(service.status().await.state, ConnectionState::Connected);

        host.fail_status(true);
        let server = service.select_server("us-nyc-1").await.unwrap();
        assert_eq!(server.name, "us-nyc-1");
        assert_eq!(
            store.load::<Server>(keys::CURRENT_SERVER).map(|s| s.name),
            Some("us-nyc-1".to_string())
        );

        // Session falls back to the last reported state
        assert_eq!(service.session().state().await, ConnectionState::Connected);
        assert_eq!(host.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_select_unknown_server() {
        let (service, _, _) = test_service(true);
        assert!(matches!(
            service.select_server("xx-nowhere-1").await,
            Err(SkyLinkError::Selection(SelectionError::UnknownServer { .. }))
        ));
    }

    #[tokio::test]
    async fn test_server_listing() {
        let (service, _, _) = test_service(false);

        // Fully expanded: 4 countries + 4 servers
        let rows = service.servers(None).await.unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(service.servers(Some(" ")).await.unwrap().len(), 8);

        let rows = service.servers(Some("dallas")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].section(), 0);

        assert_eq!(service.refresh().await.unwrap(), 4);
    }
}
