// src/resolution_cache.rs

use crate::binding_registry::{BindingRegistry, EndpointBinding};
use crate::discovery::FetchOutcome;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Serving the statically configured URL.
    Default,
    /// Serving the administrator override.
    Overridden,
    /// Serving a value observed in the discovery store.
    Discovered,
    /// The key is present in the store but its value is not a usable URL.
    /// Requests against this row fault until the store is corrected.
    Invalid,
}

/// The currently-effective endpoint for one keyed binding. Replaced as a
/// whole on every applied poll outcome; readers never see partial updates.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub state: EndpointState,
    pub last_polled: SystemTime,
}

impl ResolvedEndpoint {
    fn seeded(binding: &EndpointBinding) -> Self {
        let (url, state) = match &binding.override_url {
            Some(url) => (url.clone(), EndpointState::Overridden),
            None => (binding.default_url.clone(), EndpointState::Default),
        };
        ResolvedEndpoint {
            url,
            state,
            last_polled: SystemTime::now(),
        }
    }
}

/// A fetched value may only be served if it parses as an absolute http(s)
/// URL with a host.
pub fn is_dispatchable_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url.host_str().map_or(false, |h| !h.is_empty())
        }
        Err(_) => false,
    }
}

/// Computes the entry that should replace `prev` after one poll of one
/// binding. Pure; the table lives here so it can be tested row by row.
pub fn transition(
    prev: &ResolvedEndpoint,
    binding: &EndpointBinding,
    outcome: &FetchOutcome,
) -> ResolvedEndpoint {
    let now = SystemTime::now();
    match outcome {
        FetchOutcome::Found(value) if is_dispatchable_url(value) => ResolvedEndpoint {
            url: value.clone(),
            state: EndpointState::Discovered,
            last_polled: now,
        },
        FetchOutcome::Found(_) => ResolvedEndpoint {
            // Keep the previous URL in the entry; it is never served while
            // the state is Invalid.
            url: prev.url.clone(),
            state: EndpointState::Invalid,
            last_polled: now,
        },
        FetchOutcome::NotFound => {
            let (url, state) = match &binding.override_url {
                Some(url) => (url.clone(), EndpointState::Overridden),
                None => (binding.default_url.clone(), EndpointState::Default),
            };
            ResolvedEndpoint {
                url,
                state,
                last_polled: now,
            }
        }
        // Transient store trouble holds the last good state.
        FetchOutcome::AuthFailure | FetchOutcome::Unreachable => ResolvedEndpoint {
            url: prev.url.clone(),
            state: prev.state,
            last_polled: now,
        },
    }
}

/// One entry per keyed binding; written only by the poller, read on every
/// routed request. Entries are replaced by swapping the Arc behind a short
/// write lock, so a concurrent reader observes either the pre-tick or the
/// post-tick entry in full.
pub struct ResolutionCache {
    entries: HashMap<usize, RwLock<Arc<ResolvedEndpoint>>>,
}

impl ResolutionCache {
    /// Creates the entry set, exactly once, seeded Overridden/Default.
    pub fn new(registry: &BindingRegistry) -> Self {
        let entries = registry
            .keyed()
            .map(|(idx, binding)| (idx, RwLock::new(Arc::new(ResolvedEndpoint::seeded(binding)))))
            .collect();
        ResolutionCache { entries }
    }

    /// Snapshot of the entry for a registry row, if the row is keyed.
    pub fn load(&self, row: usize) -> Option<Arc<ResolvedEndpoint>> {
        self.entries.get(&row).map(|slot| slot.read().clone())
    }

    /// Applies one poll outcome to one row. Returns the stored entry.
    pub fn apply(
        &self,
        row: usize,
        binding: &EndpointBinding,
        outcome: &FetchOutcome,
    ) -> Option<Arc<ResolvedEndpoint>> {
        let slot = self.entries.get(&row)?;
        let prev = slot.read().clone();
        let next = Arc::new(transition(&prev, binding, outcome));
        *slot.write() = next.clone();
        Some(next)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
