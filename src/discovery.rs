// src/discovery.rs

use crate::config::{BackendConfig, ServiceDiscoveryConfig, StoreKind};
use crate::consul::ConsulBackend;
use crate::etcd::EtcdBackend;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a single store call. One slow or unresponsive store must
/// never stall a whole poll tick.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of asking the store for one key's current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The raw string stored at the key.
    Found(String),
    /// Key does not exist in the store. Not an error.
    NotFound,
    /// The store rejected our credentials.
    AuthFailure,
    /// Network/connection failure, malformed store URL, or no store URL
    /// configured at all.
    Unreachable,
}

/// Uniform fetch capability over a remote KV store. One call per key per
/// poll tick; the poller owns retry cadence, not this layer.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn fetch(&self, key: &str) -> FetchOutcome;
}

/// Select the concrete backend once at startup.
pub fn backend_for(config: &ServiceDiscoveryConfig) -> Arc<dyn DiscoveryBackend> {
    match &config.backend {
        BackendConfig::Consul(c) => Arc::new(ConsulBackend::new(c.clone())),
        BackendConfig::Etcd(e) => Arc::new(EtcdBackend::new(e.clone())),
    }
}
