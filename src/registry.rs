//! Scheme → client registry.
//!
//! Each configured scheme gets a data client bound to its endpoint URL and
//! a presigning client.  When no distinct presigning URL is configured the
//! presigning client *is* the data client (the same `Arc`), otherwise a
//! second client is built against the presigning URL.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::client::backend::ObjectClient;
use crate::config::Settings;
use crate::errors::{Result, StorageError};

/// Boxed future returned by [`ClientFactory::build`].
pub type BuildFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Arc<dyn ObjectClient>>> + Send + 'a>>;

/// Builds clients for an endpoint from resolved settings.
pub trait ClientFactory: Send + Sync + 'static {
    /// Build one client for `endpoint_url` (`None` = provider default).
    fn build<'a>(&'a self, settings: &'a Settings, endpoint_url: Option<&'a str>)
        -> BuildFuture<'a>;
}

/// Data and presigning clients for one scheme.
#[derive(Clone)]
pub struct ClientPair {
    pub data: Arc<dyn ObjectClient>,
    pub presigning: Arc<dyn ObjectClient>,
}

/// Immutable map of scheme → [`ClientPair`].
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<String, ClientPair>,
}

impl ClientRegistry {
    /// Build clients for every scheme in `settings.endpoints`.
    pub async fn build(settings: &Settings, factory: &dyn ClientFactory) -> Result<Self> {
        let mut clients = BTreeMap::new();
        for (scheme, endpoints) in &settings.endpoints {
            let data = factory.build(settings, endpoints.endpoint_url()).await?;
            let presigning = match endpoints.presigning_url() {
                Some(url) => factory.build(settings, Some(url)).await?,
                None => Arc::clone(&data),
            };
            info!(
                "S3 clients ready: scheme={} endpoint={} presigning={}",
                scheme,
                endpoints.endpoint_url().unwrap_or("<default>"),
                endpoints.presigning_url().unwrap_or("<shared>")
            );
            clients.insert(scheme.clone(), ClientPair { data, presigning });
        }
        Ok(Self { clients })
    }

    /// Client for data operations on `scheme`.
    pub fn client_for(&self, scheme: &str) -> Result<&Arc<dyn ObjectClient>> {
        self.pair(scheme).map(|pair| &pair.data)
    }

    /// Client for signing URLs on `scheme`.
    pub fn presigning_client_for(&self, scheme: &str) -> Result<&Arc<dyn ObjectClient>> {
        self.pair(scheme).map(|pair| &pair.presigning)
    }

    /// Configured schemes, in sorted order.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    fn pair(&self, scheme: &str) -> Result<&ClientPair> {
        self.clients
            .get(&scheme.to_ascii_lowercase())
            .ok_or_else(|| StorageError::UnknownScheme(scheme.to_string()))
    }
}

// -- Tests -------------------------------------------------------------------
