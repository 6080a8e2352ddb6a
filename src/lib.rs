//! SkyLink - privacy VPN client core
//!
//! Everything between the UI and the OS tunnel: the server catalog and its
//! free/premium pools, server selection under the subscription gate, local
//! key material, peer negotiation with the signaling endpoint, and the tunnel
//! session state machine reconciled against the OS-reported status.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use skylink::{ClientSettings, StaticEntitlement, VpnService};
//!
//! #[tokio::main]
//! async fn main() -> skylink::Result<()> {
//!     let service = VpnService::from_settings(
//!         ClientSettings::default(),
//!         Arc::new(StaticEntitlement(false)),
//!     )?;
//!     let reconciler = service.spawn_reconciler();
//!     service.connect().await?;
//!     reconciler.stop().await;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod daemon;
pub mod directory;
pub mod error;
pub mod events;
pub mod keys;
pub mod negotiator;
pub mod selection;
pub mod service;
pub mod session;
pub mod settings;
pub mod store;
pub mod tunnel;

pub use catalog::{Catalog, CatalogSource, Server};
pub use daemon::DaemonService;
pub use error::{Result, SkyLinkError};
pub use events::{EventBus, SessionEvent};
pub use selection::{Entitlement, ServerSelector, StaticEntitlement};
pub use service::VpnService;
pub use session::{ConnectionState, TunnelSession};
pub use settings::ClientSettings;
