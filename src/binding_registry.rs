// src/binding_registry.rs

use crate::config::{ApiDefinition, ConfigError};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Production,
    Sandbox,
}

impl Environment {
    /// Parameter names use the short forms from the CLI surface.
    pub fn from_param(s: &str) -> Result<Self, ConfigError> {
        match s {
            "prod" => Ok(Environment::Production),
            "sand" => Ok(Environment::Sandbox),
            other => Err(ConfigError::Environment(other.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => f.write_str("production"),
            Environment::Sandbox => f.write_str("sandbox"),
        }
    }
}

/// One (api, environment, slot) endpoint and everything statically known
/// about it. Immutable once the registry is built.
#[derive(Debug, Clone)]
pub struct EndpointBinding {
    pub api_id: String,
    pub env: Environment,
    pub slot: usize,
    /// From the API definition. Present for every declared slot; rows
    /// created by an override parameter alone fall back to the override.
    pub default_url: String,
    /// Administrator-supplied `<apiId>_<env>_endpoint_<slot>` parameter.
    pub override_url: Option<String>,
    /// `<apiId>_<env>_consulKey` parameter; rows without one never touch
    /// the discovery store.
    pub discovery_key: Option<String>,
}

impl EndpointBinding {
    /// The best statically-known URL: override outranks default.
    pub fn static_url(&self) -> &str {
        self.override_url.as_deref().unwrap_or(&self.default_url)
    }
}

const CONSUL_KEY_SUFFIX: &str = "_consulKey";
const ENDPOINT_MARKER: &str = "_endpoint_";

/// Static registry of endpoint bindings, built once at startup from the API
/// definitions plus runtime parameters, then only read.
#[derive(Debug)]
pub struct BindingRegistry {
    rows: Vec<EndpointBinding>,
    by_pair: HashMap<(String, Environment), Vec<usize>>,
}

impl BindingRegistry {
    pub fn build(
        apis: &[ApiDefinition],
        params: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut rows: Vec<EndpointBinding> = Vec::new();
        let mut index: HashMap<(String, Environment, usize), usize> = HashMap::new();

        for api in apis {
            for (env, set) in [
                (Environment::Production, &api.production),
                (Environment::Sandbox, &api.sandbox),
            ] {
                for (slot, url) in set.urls.iter().enumerate() {
                    index.insert((api.id.clone(), env, slot), rows.len());
                    rows.push(EndpointBinding {
                        api_id: api.id.clone(),
                        env,
                        slot,
                        default_url: url.clone(),
                        override_url: None,
                        discovery_key: None,
                    });
                }
            }
        }

        // Attach overrides first so a row created by an override alone has a
        // serving URL before any key binding lands on it.
        for (name, value) in params {
            if let Some((api_id, env, slot)) = parse_override_param(name)? {
                match index.get(&(api_id.clone(), env, slot)) {
                    Some(&i) => rows[i].override_url = Some(value.clone()),
                    None => {
                        index.insert((api_id.clone(), env, slot), rows.len());
                        rows.push(EndpointBinding {
                            api_id,
                            env,
                            slot,
                            default_url: value.clone(),
                            override_url: Some(value.clone()),
                            discovery_key: None,
                        });
                    }
                }
            }
        }

        for (name, value) in params {
            if let Some((api_id, env)) = parse_key_param(name)? {
                // A key binding addresses slot 0 of its pair; additional
                // slots keep their static URLs.
                match index.get(&(api_id.clone(), env, 0)) {
                    Some(&i) => rows[i].discovery_key = Some(value.clone()),
                    None => {
                        log::warn!(
                            "ignoring key binding for undeclared endpoint {}/{}",
                            api_id,
                            env
                        );
                    }
                }
            }
        }

        let mut by_pair: HashMap<(String, Environment), Vec<usize>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            by_pair
                .entry((row.api_id.clone(), row.env))
                .or_default()
                .push(i);
        }
        for slots in by_pair.values_mut() {
            slots.sort_by_key(|&i| rows[i].slot);
        }

        Ok(BindingRegistry { rows, by_pair })
    }

    /// Row indices for an (api, environment) pair, in slot order.
    pub fn lookup(&self, api_id: &str, env: Environment) -> &[usize] {
        self.by_pair
            .get(&(api_id.to_string(), env))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn row(&self, idx: usize) -> &EndpointBinding {
        &self.rows[idx]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The poller's worklist: every row bound to a discovery key.
    pub fn keyed(&self) -> impl Iterator<Item = (usize, &EndpointBinding)> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.discovery_key.is_some())
    }
}

/// `<apiId>_<env>_consulKey` → (apiId, env). API ids may contain anything
/// but `_`-separated suffixes, so parsing strips from the right.
fn parse_key_param(name: &str) -> Result<Option<(String, Environment)>, ConfigError> {
    let Some(prefix) = name.strip_suffix(CONSUL_KEY_SUFFIX) else {
        return Ok(None);
    };
    let Some((api_id, env)) = prefix.rsplit_once('_') else {
        return Err(ConfigError::Parameter(name.to_string()));
    };
    Ok(Some((api_id.to_string(), Environment::from_param(env)?)))
}

/// `<apiId>_<env>_endpoint_<slot>` → (apiId, env, slot).
fn parse_override_param(
    name: &str,
) -> Result<Option<(String, Environment, usize)>, ConfigError> {
    let Some(marker) = name.rfind(ENDPOINT_MARKER) else {
        return Ok(None);
    };
    let slot_part = &name[marker + ENDPOINT_MARKER.len()..];
    let Ok(slot) = slot_part.parse::<usize>() else {
        // Not an override parameter after all (e.g. an api id that happens
        // to contain "_endpoint_").
        return Ok(None);
    };
    let prefix = &name[..marker];
    let Some((api_id, env)) = prefix.rsplit_once('_') else {
        return Err(ConfigError::Parameter(name.to_string()));
    };
    Ok(Some((
        api_id.to_string(),
        Environment::from_param(env)?,
        slot,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointSet;

    const API_ID: &str = "4a731db3-3a76-4950-a2d9-9778fd73b31c";

    fn apis() -> Vec<ApiDefinition> {
        vec![ApiDefinition {
            id: API_ID.to_string(),
            context: "pizzashack".to_string(),
            production: EndpointSet {
                urls: vec!["https://localhost:9443/echo/prod".to_string()],
            },
            sandbox: EndpointSet {
                urls: vec!["https://localhost:9443/echo/sand".to_string()],
            },
        }]
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn declared_slots_become_rows() {
        let registry = BindingRegistry::build(&apis(), &HashMap::new()).unwrap();
        assert_eq!(registry.len(), 2);
        let prod = registry.lookup(API_ID, Environment::Production);
        assert_eq!(prod.len(), 1);
        assert_eq!(
            registry.row(prod[0]).static_url(),
            "https://localhost:9443/echo/prod"
        );
        assert!(registry.lookup("other", Environment::Production).is_empty());
    }

    #[test]
    fn key_binding_attaches_to_slot_zero() {
        let name = format!("{}_prod_consulKey", API_ID);
        let p = params(&[(name.as_str(), "pizzashackprod")]);
        let registry = BindingRegistry::build(&apis(), &p).unwrap();
        let keyed: Vec<_> = registry.keyed().collect();
        assert_eq!(keyed.len(), 1);
        let (_, row) = keyed[0];
        assert_eq!(row.env, Environment::Production);
        assert_eq!(row.discovery_key.as_deref(), Some("pizzashackprod"));
        // The sandbox row stays unkeyed.
        let sand = registry.lookup(API_ID, Environment::Sandbox);
        assert!(registry.row(sand[0]).discovery_key.is_none());
    }

    #[test]
    fn override_outranks_default_statically() {
        let name = format!("{}_sand_endpoint_0", API_ID);
        let p = params(&[(name.as_str(), "https://localhost:9443/echo/newsand")]);
        let registry = BindingRegistry::build(&apis(), &p).unwrap();
        let sand = registry.lookup(API_ID, Environment::Sandbox);
        assert_eq!(
            registry.row(sand[0]).static_url(),
            "https://localhost:9443/echo/newsand"
        );
        assert_eq!(
            registry.row(sand[0]).default_url,
            "https://localhost:9443/echo/sand"
        );
    }

    #[test]
    fn override_alone_creates_a_row() {
        let p = params(&[("newapi_prod_endpoint_0", "https://backend/one")]);
        let registry = BindingRegistry::build(&apis(), &p).unwrap();
        let rows = registry.lookup("newapi", Environment::Production);
        assert_eq!(rows.len(), 1);
        assert_eq!(registry.row(rows[0]).static_url(), "https://backend/one");
        assert!(registry.row(rows[0]).discovery_key.is_none());
    }

    #[test]
    fn key_binding_for_undeclared_endpoint_is_ignored() {
        let p = params(&[("ghost_prod_consulKey", "ghostkey")]);
        let registry = BindingRegistry::build(&apis(), &p).unwrap();
        assert_eq!(registry.keyed().count(), 0);
    }

    #[test]
    fn bad_environment_in_param_is_rejected() {
        let p = params(&[("api_stage_consulKey", "k")]);
        let err = BindingRegistry::build(&apis(), &p).unwrap_err();
        assert!(matches!(err, ConfigError::Environment(_)));
    }

    #[test]
    fn unrelated_params_are_ignored() {
        let p = params(&[
            ("consulurl", "http://localhost:8500"),
            ("token", "mastertoken"),
            ("consultimer", "1000"),
        ]);
        let registry = BindingRegistry::build(&apis(), &p).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.keyed().count(), 0);
    }
}
