//! Server selection policy
//!
//! Chooses or validates the active server under the free/premium rules,
//! persists the choice and publishes `ServerUpdated` on every change.
//!
//! A persisted selection always wins over re-selection, so reconnects never
//! silently hop servers. The subscription gate is only applied to explicit
//! user selections.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::catalog::{CatalogSource, Pool, Server};
use crate::error::SelectionError;
use crate::events::{EventBus, SessionEvent};
use crate::store::{keys, KeyValueStore};

/// Subscription status, consumed as a boolean capability
pub trait Entitlement: Send + Sync {
    fn is_subscribed(&self) -> bool;
}

/// Fixed entitlement (CLI flag, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEntitlement(pub bool);

impl Entitlement for StaticEntitlement {
    fn is_subscribed(&self) -> bool {
        self.0
    }
}

/// Selection policy over the catalog and the persisted selected server
pub struct ServerSelector {
    catalog: Arc<CatalogSource>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
}

impl ServerSelector {
    pub fn new(catalog: Arc<CatalogSource>, store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        Self {
            catalog,
            store,
            events,
        }
    }

    /// The persisted selected server, if any
    pub fn selected(&self) -> Option<Server> {
        self.store.load(keys::CURRENT_SERVER)
    }

    /// Return the persisted server, or pick one at random from the pool the
    /// subscription status allows and persist it.
    pub async fn get_or_select_server(&self, is_subscribed: bool) -> Result<Server, SelectionError> {
        if let Some(server) = self.selected() {
            tracing::info!("Loaded previously selected server: {}", server.name);
            return Ok(server);
        }

        let catalog = self.catalog.ensure_loaded().await?;

        let pool = Pool::of(is_subscribed);
        let candidates = catalog.pool(pool);
        let server = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                tracing::warn!("No servers available for selection in the {} pool", pool.as_str());
                SelectionError::NoServerAvailable {
                    pool: pool.as_str(),
                }
            })?;

        self.persist(&server)?;
        Ok(server)
    }

    /// Explicit user selection.
    ///
    /// A premium server without a subscription is rejected before anything is
    /// persisted; the caller should route to the upgrade flow.
    pub fn select_server(&self, server: &Server, is_subscribed: bool) -> Result<(), SelectionError> {
        if server.requires_subscription && !is_subscribed {
            tracing::info!("Rejected selection of premium server {}", server.name);
            return Err(SelectionError::SubscriptionRequired {
                server: server.name.clone(),
            });
        }

        self.persist(server)
    }

    fn persist(&self, server: &Server) -> Result<(), SelectionError> {
        self.store.save(keys::CURRENT_SERVER, server)?;
        tracing::info!("Saved selected server: {}", server.name);
        self.events.emit(SessionEvent::ServerUpdated {
            server: server.name.clone(),
        });
        Ok(())
    }
}
