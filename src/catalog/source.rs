//! Catalog loading: cache first, remote directory as the fallback
//!
//! The raw directory document is cached verbatim in the key/value store.
//! A remote fetch only happens when the cache is missing or unreadable, or
//! when a refresh is explicitly requested.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Catalog;
use crate::error::{CatalogError, NetworkError};
use crate::store::{keys, KeyValueStore};

/// Remote directory document provider
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Download the raw directory document
    async fn fetch(&self) -> Result<Vec<u8>, NetworkError>;
}

/// Fetches the directory document over HTTP
pub struct HttpCatalogFetcher {
    http: reqwest::Client,
    url: String,
}

impl HttpCatalogFetcher {
    /// Create a fetcher with its own client and request timeout
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

    /// Create a fetcher with a pre-built client
    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CatalogFetcher for HttpCatalogFetcher {
    async fn fetch(&self) -> Result<Vec<u8>, NetworkError> {
        tracing::debug!("GET {}", self.url);

        let resp = self
            .http
            .get(&self.url)
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

        let body = resp.bytes().await.map_err(|e| NetworkError::InvalidResponse {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!("Fetched directory document ({} bytes)", body.len());
        Ok(body.to_vec())
    }
}

/// Owns the decoded catalog and its cache
pub struct CatalogSource {
    store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn CatalogFetcher>,
    current: RwLock<Option<Arc<Catalog>>>,
}

impl CatalogSource {
    pub fn new(store: Arc<dyn KeyValueStore>, fetcher: Arc<dyn CatalogFetcher>) -> Self {
        Self {
            store,
            fetcher,
            current: RwLock::new(None),
        }
    }

    /// The catalog decoded so far, if any
    pub async fn current(&self) -> Option<Arc<Catalog>> {
        self.current.read().await.clone()
    }

    /// Return the loaded catalog, loading it from the cache and only on cache
    /// failure from the network
    pub async fn ensure_loaded(&self) -> Result<Arc<Catalog>, CatalogError> {
        if let Some(catalog) = self.current().await {
            return Ok(catalog);
        }

        match self.load_cached().await {
            Ok(catalog) => Ok(catalog),
            Err(e) => {
                tracing::info!("Cached catalog unavailable ({}), fetching from directory", e);
                self.refresh().await
            }
        }
    }

    /// Decode the cached document
    pub async fn load_cached(&self) -> Result<Arc<Catalog>, CatalogError> {
        tracing::debug!("Retrieving cached server document");

        let raw = self
            .store
            .load_bytes(keys::CACHED_SERVER_JSON)
            .ok_or(CatalogError::CacheMiss)?;

        let catalog = Arc::new(Catalog::load(&raw)?);
        *self.current.write().await = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Fetch the document from the directory, cache it verbatim and decode it
    pub async fn refresh(&self) -> Result<Arc<Catalog>, CatalogError> {
        let raw = self.fetcher.fetch().await?;

        // Decode before caching so a broken download never replaces a good cache
        let catalog = Arc::new(Catalog::load(&raw)?);
        self.store.save_bytes(keys::CACHED_SERVER_JSON, &raw)?;

        *self.current.write().await = Some(Arc::clone(&catalog));
        Ok(catalog)
    }
}
