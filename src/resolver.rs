// src/resolver.rs

use crate::binding_registry::{BindingRegistry, Environment};
use crate::config::StoreKind;
use crate::resolution_cache::{EndpointState, ResolutionCache};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Structured fault surfaced to the API consumer, rendered as
/// `{"fault":{"code":...,"message":...,"description":...}}` with HTTP 500.
#[derive(Debug, Clone, Serialize)]
pub struct Fault {
    pub code: String,
    pub message: String,
    pub description: String,
}

impl Fault {
    /// The discovered value for a bound key failed URL validation. The code
    /// tells operators which store misbehaved.
    fn invalid_url(kind: StoreKind, key: &str) -> Self {
        let code = match kind {
            StoreKind::Consul => "101503",
            StoreKind::Etcd => "101505",
        };
        Fault {
            code: code.to_string(),
            message: "Runtime Error".to_string(),
            description: format!("URL defined at {} for key {} is invalid", kind, key),
        }
    }

    fn no_endpoint(api_id: &str, env: Environment) -> Self {
        Fault {
            code: "101500".to_string(),
            message: "Runtime Error".to_string(),
            description: format!("no backend endpoint configured for {} {}", api_id, env),
        }
    }
}

/// The single entry point the routing path calls, once per dispatched
/// request. Reads only in-memory state; never touches the store.
pub struct Resolver {
    registry: Arc<BindingRegistry>,
    cache: Arc<ResolutionCache>,
    store_kind: StoreKind,
    discovery_enabled: bool,
    rotation: Mutex<HashMap<(String, Environment), usize>>,
}

impl Resolver {
    pub fn new(
        registry: Arc<BindingRegistry>,
        cache: Arc<ResolutionCache>,
        store_kind: StoreKind,
        discovery_enabled: bool,
    ) -> Self {
        Resolver {
            registry,
            cache,
            store_kind,
            discovery_enabled,
            rotation: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the endpoint URL a request for (api, environment) should be
    /// dispatched to right now, or the fault to answer with instead.
    pub fn resolve(&self, api_id: &str, env: Environment) -> Result<String, Fault> {
        let rows = self.registry.lookup(api_id, env);
        if rows.is_empty() {
            return Err(Fault::no_endpoint(api_id, env));
        }
        let row = if rows.len() == 1 {
            rows[0]
        } else {
            rows[self.next_slot(api_id, env, rows.len())]
        };
        let binding = self.registry.row(row);

        if !self.discovery_enabled || binding.discovery_key.is_none() {
            return Ok(binding.static_url().to_string());
        }

        match self.cache.load(row) {
            Some(entry) if entry.state == EndpointState::Invalid => {
                let key = binding.discovery_key.as_deref().unwrap_or_default();
                Err(Fault::invalid_url(self.store_kind, key))
            }
            Some(entry) => Ok(entry.url.clone()),
            // Keyed but never cached; fall open to the static URL.
            None => Ok(binding.static_url().to_string()),
        }
    }

    /// Round-robin position across the slots of one (api, environment) pair.
    fn next_slot(&self, api_id: &str, env: Environment, count: usize) -> usize {
        let mut rotation = self.rotation.lock();
        let counter = rotation.entry((api_id.to_string(), env)).or_insert(0);
        let picked = *counter % count;
        *counter = (*counter + 1) % count;
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiDefinition, EndpointSet};
    use crate::discovery::FetchOutcome;

    fn apis() -> Vec<ApiDefinition> {
        vec![ApiDefinition {
            id: "apiA".to_string(),
            context: "a".to_string(),
            production: EndpointSet {
                urls: vec!["https://a/prod".to_string()],
            },
            sandbox: EndpointSet {
                urls: vec!["https://a/sand".to_string()],
            },
        }]
    }

    fn build(
        apis: &[ApiDefinition],
        params: &[(&str, &str)],
        kind: StoreKind,
        enabled: bool,
    ) -> (Arc<BindingRegistry>, Arc<ResolutionCache>, Resolver) {
        let params: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let registry = Arc::new(BindingRegistry::build(apis, &params).unwrap());
        let cache = Arc::new(ResolutionCache::new(&registry));
        let resolver = Resolver::new(registry.clone(), cache.clone(), kind, enabled);
        (registry, cache, resolver)
    }

    fn prod_poll(
        registry: &BindingRegistry,
        cache: &ResolutionCache,
        api: &str,
        outcome: FetchOutcome,
    ) {
        let row = registry.lookup(api, Environment::Production)[0];
        cache.apply(row, registry.row(row), &outcome);
    }

    #[test]
    fn unbound_pair_resolves_to_default() {
        let (_, _, resolver) = build(&apis(), &[], StoreKind::Consul, true);
        assert_eq!(
            resolver.resolve("apiA", Environment::Sandbox).unwrap(),
            "https://a/sand"
        );
    }

    #[test]
    fn disabled_discovery_always_serves_static() {
        let (registry, cache, resolver) = build(
            &apis(),
            &[("apiA_prod_consulKey", "keyA")],
            StoreKind::Consul,
            false,
        );
        // Even if something had landed in the cache, disabled means static.
        prod_poll(
            &registry,
            &cache,
            "apiA",
            FetchOutcome::Found("https://disc/y".to_string()),
        );
        assert_eq!(
            resolver.resolve("apiA", Environment::Production).unwrap(),
            "https://a/prod"
        );
    }

    #[test]
    fn bound_pair_serves_cached_url() {
        let (registry, cache, resolver) = build(
            &apis(),
            &[("apiA_prod_consulKey", "keyA")],
            StoreKind::Consul,
            true,
        );
        prod_poll(
            &registry,
            &cache,
            "apiA",
            FetchOutcome::Found("https://disc/y".to_string()),
        );
        assert_eq!(
            resolver.resolve("apiA", Environment::Production).unwrap(),
            "https://disc/y"
        );
    }

    #[test]
    fn invalid_state_faults_with_consul_code() {
        let (registry, cache, resolver) = build(
            &apis(),
            &[("apiA_prod_consulKey", "keyA")],
            StoreKind::Consul,
            true,
        );
        prod_poll(
            &registry,
            &cache,
            "apiA",
            FetchOutcome::Found("abcd".to_string()),
        );
        let fault = resolver
            .resolve("apiA", Environment::Production)
            .unwrap_err();
        assert_eq!(fault.code, "101503");
        assert_eq!(fault.message, "Runtime Error");
        assert_eq!(
            fault.description,
            "URL defined at consul for key keyA is invalid"
        );
    }

    #[test]
    fn invalid_state_faults_with_etcd_code() {
        let (registry, cache, resolver) = build(
            &apis(),
            &[("apiA_prod_consulKey", "keyA")],
            StoreKind::Etcd,
            true,
        );
        prod_poll(
            &registry,
            &cache,
            "apiA",
            FetchOutcome::Found("abcd".to_string()),
        );
        let fault = resolver
            .resolve("apiA", Environment::Production)
            .unwrap_err();
        assert_eq!(fault.code, "101505");
        assert!(fault.description.contains("defined at etcd"));
    }

    #[test]
    fn fault_clears_after_revert() {
        let (registry, cache, resolver) = build(
            &apis(),
            &[("apiA_prod_consulKey", "keyA")],
            StoreKind::Consul,
            true,
        );
        prod_poll(
            &registry,
            &cache,
            "apiA",
            FetchOutcome::Found("abcd".to_string()),
        );
        assert!(resolver.resolve("apiA", Environment::Production).is_err());

        prod_poll(&registry, &cache, "apiA", FetchOutcome::NotFound);
        assert_eq!(
            resolver.resolve("apiA", Environment::Production).unwrap(),
            "https://a/prod"
        );
    }

    #[test]
    fn multiple_slots_rotate() {
        let apis = vec![ApiDefinition {
            id: "apiA".to_string(),
            context: "a".to_string(),
            production: EndpointSet {
                urls: vec![
                    "https://a/prod0".to_string(),
                    "https://a/prod1".to_string(),
                ],
            },
            sandbox: EndpointSet { urls: vec![] },
        }];
        let (_, _, resolver) = build(&apis, &[], StoreKind::Consul, true);
        let first = resolver.resolve("apiA", Environment::Production).unwrap();
        let second = resolver.resolve("apiA", Environment::Production).unwrap();
        let third = resolver.resolve("apiA", Environment::Production).unwrap();
        assert_eq!(first, "https://a/prod0");
        assert_eq!(second, "https://a/prod1");
        assert_eq!(third, first);
    }

    #[test]
    fn unknown_api_faults() {
        let (_, _, resolver) = build(&apis(), &[], StoreKind::Consul, true);
        let fault = resolver
            .resolve("ghost", Environment::Production)
            .unwrap_err();
        assert_eq!(fault.code, "101500");
    }

    #[test]
    fn fault_serializes_for_the_wire() {
        let fault = Fault::invalid_url(StoreKind::Consul, "pizzashackprod");
        let body = serde_json::json!({ "fault": fault });
        let rendered = body.to_string();
        assert!(rendered.contains("\"code\":\"101503\""));
        assert!(rendered.contains("\"message\":\"Runtime Error\""));
        assert!(rendered.contains("URL defined at consul for key pizzashackprod is invalid"));
    }
}
