//! Error types for the SkyLink VPN client core

use thiserror::Error;

/// Main error type for SkyLink
#[derive(Error, Debug)]
pub enum SkyLinkError {
    /// Server catalog errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Server selection errors
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Network errors (catalog fetch, negotiation)
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// OS tunnel host errors
    #[error("Tunnel host error: {0}")]
    TunnelHost(#[from] TunnelHostError),

    /// Tunnel configuration text errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Persistent store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Key material errors
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Server catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The document is not a catalog at all (top level is malformed).
    /// Individual bad entries never produce this; they are skipped.
    #[error("Malformed catalog document: {reason}")]
    Decode { reason: String },

    #[error("No cached catalog found")]
    CacheMiss,

    #[error("Catalog fetch failed: {0}")]
    Fetch(#[from] NetworkError),

    #[error("Catalog cache unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Server {server} has no public IP")]
    NoEndpoint { server: String },
}

/// Server selection errors
#[derive(Error, Debug)]
pub enum SelectionError {
    /// A premium server was picked without an active subscription.
    /// The caller should route to the upgrade flow.
    #[error("Server {server} requires a subscription")]
    SubscriptionRequired { server: String },

    #[error("No server available in the {pool} pool")]
    NoServerAvailable { pool: &'static str },

    #[error("Unknown server: {name}")]
    UnknownServer { name: String },

    #[error("Catalog unavailable: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Failed to persist selection: {0}")]
    Store(#[from] StoreError),
}

/// OS tunnel-hosting errors
#[derive(Error, Debug)]
pub enum TunnelHostError {
    #[error("Failed to load tunnel provider: {reason}")]
    LoadFailed { reason: String },

    #[error("Failed to save tunnel provider: {reason}")]
    SaveFailed { reason: String },

    #[error("Failed to start tunnel: {reason}")]
    StartFailed { reason: String },

    #[error("Failed to stop tunnel: {reason}")]
    StopFailed { reason: String },

    #[error("Failed to query tunnel status: {reason}")]
    StatusFailed { reason: String },

    #[error("No tunnel provider configured")]
    NoProvider,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel configuration text errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },
}

/// Persistent key/value store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to encode value for {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("Failed to write store at {path}: {reason}")]
    Write { path: String, reason: String },
}

/// Local key material errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Stored {field} is not a valid 32-byte base64 key")]
    InvalidKey { field: &'static str },

    #[error("Failed to persist key pair: {0}")]
    Store(#[from] StoreError),
}

impl SkyLinkError {
    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Selection(SelectionError::SubscriptionRequired { server }) => {
                format!(
                    "{} is a premium location.\n  Subscribe to unlock premium servers.",
                    server
                )
            }

            Self::Selection(SelectionError::NoServerAvailable { pool }) => {
                format!(
                    "No {} servers are available right now.\n  Refresh the server list and try again.",
                    pool
                )
            }

            Self::Selection(SelectionError::UnknownServer { name }) => {
                format!(
                    "No server named {}.\n  Run `skylink servers` to list locations.",
                    name
                )
            }

            Self::Catalog(CatalogError::CacheMiss) => {
                "Server list not downloaded yet.\n  Run `skylink refresh` and try again.".to_string()
            }

            Self::Network(NetworkError::Request { url, .. }) => {
                format!(
                    "Could not reach {}.\n  Check your internet connection.",
                    url
                )
            }

            Self::TunnelHost(TunnelHostError::StartFailed { reason }) => {
                #[cfg(target_os = "linux")]
                return format!(
                    "Tunnel failed to start: {}\n  Make sure wireguard-tools is installed and run with sudo.",
                    reason
                );
                #[cfg(not(target_os = "linux"))]
                return format!("Tunnel failed to start: {}", reason);
            }

            _ => format!("{}", self),
        }
    }

    /// Check if the user can simply retry the action
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Catalog(CatalogError::Fetch(_)) => true,
            Self::Catalog(CatalogError::CacheMiss) => true,
            Self::TunnelHost(TunnelHostError::StatusFailed { .. }) => true,

            Self::Selection(SelectionError::SubscriptionRequired { .. }) => false,
            Self::Config(_) => false,
            Self::Key(_) => false,

            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Selection(SelectionError::SubscriptionRequired { .. }) => 2,
            Self::Network(_) => 3,
            Self::Catalog(_) => 4,
            Self::Selection(_) => 5,
            Self::TunnelHost(_) => 6,
            Self::Key(_) | Self::Store(_) => 7,
            Self::System(_) => 8,
        }
    }
}

/// Result type alias for SkyLink operations
pub type Result<T> = std::result::Result<T, SkyLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_required_message() {
        let err = SkyLinkError::from(SelectionError::SubscriptionRequired {
            server: "de-fra-1".to_string(),
        });
        assert!(err.user_message().contains("de-fra-1"));
        assert!(!err.is_recoverable());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_network_errors_are_recoverable() {
        let err = SkyLinkError::from(NetworkError::Status {
            url: "https://example.com".to_string(),
            status: 503,
        });
        assert!(err.is_recoverable());
        assert_eq!(err.exit_code(), 3);
    }
}
