// src/poller.rs

use crate::binding_registry::BindingRegistry;
use crate::discovery::{DiscoveryBackend, FetchOutcome, FETCH_TIMEOUT};
use crate::resolution_cache::ResolutionCache;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Background loop that keeps the resolution cache in step with the
/// discovery store. One per process; the request path never waits on it.
pub struct Poller {
    backend: Arc<dyn DiscoveryBackend>,
    registry: Arc<BindingRegistry>,
    cache: Arc<ResolutionCache>,
    poll_interval: Duration,
}

/// Handle to a running poller. Dropping it does not stop the task; call
/// `stop` for a cooperative shutdown.
pub struct PollerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signals the loop to exit and waits for the in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

impl Poller {
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        registry: Arc<BindingRegistry>,
        cache: Arc<ResolutionCache>,
        poll_interval: Duration,
    ) -> Self {
        Poller {
            backend,
            registry,
            cache,
            poll_interval,
        }
    }

    /// Moves the poller to Running on a spawned task.
    pub fn spawn(self) -> PollerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            log::info!(
                "endpoint poller running: {} bound key(s), every {:?}",
                self.registry.keyed().count(),
                self.poll_interval
            );
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_tick().await,
                    _ = stop_rx.changed() => {
                        log::info!("endpoint poller stopped");
                        return;
                    }
                }
            }
        });
        PollerHandle { stop_tx, task }
    }

    /// Polls every bound key once. Rows are fetched concurrently and fail
    /// independently; the tick lasts about as long as the slowest single
    /// fetch, never the sum.
    pub async fn run_tick(&self) {
        let fetches = self.registry.keyed().map(|(row, binding)| {
            let backend = Arc::clone(&self.backend);
            let cache = Arc::clone(&self.cache);
            // keyed() only yields rows with a key.
            let key = binding.discovery_key.clone().unwrap_or_default();
            async move {
                let outcome = match timeout(FETCH_TIMEOUT, backend.fetch(&key)).await {
                    Ok(outcome) => outcome,
                    Err(_) => FetchOutcome::Unreachable,
                };
                let prev = cache.load(row);
                let next = cache.apply(row, binding, &outcome);
                if let (Some(prev), Some(next)) = (prev, next) {
                    if prev.state != next.state || prev.url != next.url {
                        log::info!(
                            "endpoint {}/{} slot {} now {:?} -> {} (key {})",
                            binding.api_id,
                            binding.env,
                            binding.slot,
                            next.state,
                            next.url,
                            key
                        );
                    } else if matches!(
                        outcome,
                        FetchOutcome::AuthFailure | FetchOutcome::Unreachable
                    ) {
                        log::debug!(
                            "holding last state for key {} after {:?}",
                            key,
                            outcome
                        );
                    }
                }
            }
        });
        join_all(fetches).await;
    }
}
