use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use std::{fmt, fs::File, io::BufReader, path::Path};
use thiserror::Error;

/// Poll cadence used when no timer parameter is supplied, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file '{path}' : {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("malformed runtime parameter '{0}', expected name=value")]
    Parameter(String),

    #[error("invalid value '{value}' for parameter '{name}': {reason}")]
    ParameterValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("unknown environment '{0}', expected 'prod' or 'sand'")]
    Environment(String),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub http_port: u16,
    #[serde(default)]
    pub https: Option<HttpsConfig>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    pub rate_limit_per_sec: u64,
    pub rate_limit_burst_secs: u64,
    pub service_discovery: ServiceDiscoverySettings,
    pub apis: Vec<ApiDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct HttpsConfig {
    pub port: u16,
    pub cert_path: String,
    pub key_path: String,
}

/// The `service_discovery` section of the YAML file. Connection details and
/// key bindings arrive separately as runtime parameters.
#[derive(Debug, Deserialize)]
pub struct ServiceDiscoverySettings {
    pub enabled: bool,
    #[serde(default)]
    pub store: StoreKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Consul,
    Etcd,
}

impl Default for StoreKind {
    fn default() -> Self {
        StoreKind::Consul
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Consul => f.write_str("consul"),
            StoreKind::Etcd => f.write_str("etcd"),
        }
    }
}

/// Static API definition: the identifier bindings key on, the request
/// context it matches, and the configured endpoint URLs per environment
/// (slot = position in `urls`).
#[derive(Debug, Clone, Deserialize)]
pub struct ApiDefinition {
    pub id: String,
    pub context: String,
    pub production: EndpointSet,
    pub sandbox: EndpointSet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSet {
    pub urls: Vec<String>,
}

impl Config {
    /// Load and parse configuration from the given YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        let file = File::open(p).map_err(|e| ConfigError::Io {
            path: p.display().to_string(),
            source: e,
        })?;
        let reader = BufReader::new(file);
        let cfg = serde_yaml::from_reader(reader)?;
        Ok(cfg)
    }
}

/// Split repeated `-e name=value` arguments into a map. Later occurrences of
/// the same name win.
pub fn parse_runtime_params(pairs: &[String]) -> Result<HashMap<String, String>, ConfigError> {
    let mut map = HashMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::Parameter(pair.clone()))?;
        if name.is_empty() {
            return Err(ConfigError::Parameter(pair.clone()));
        }
        map.insert(name.to_string(), value.to_string());
    }
    Ok(map)
}

/// Process-wide service discovery configuration, assembled once at startup
/// and read-only afterwards.
#[derive(Debug, Clone)]
pub struct ServiceDiscoveryConfig {
    pub enabled: bool,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Consul(ConsulConfig),
    Etcd(EtcdConfig),
}

#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Store URL; absent when the operator never supplied `consulurl`. Every
    /// fetch against an absent URL reports the store as unreachable.
    pub url: Option<String>,
    pub token: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub poll_interval: Duration,
}

impl ServiceDiscoveryConfig {
    pub fn from_parts(
        settings: &ServiceDiscoverySettings,
        params: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let backend = match settings.store {
            StoreKind::Consul => BackendConfig::Consul(ConsulConfig {
                url: params.get("consulurl").cloned(),
                token: params.get("token").cloned(),
                poll_interval: timer_param(params, "consultimer")?,
            }),
            StoreKind::Etcd => BackendConfig::Etcd(EtcdConfig {
                url: params.get("etcdurl").cloned(),
                username: params.get("etcdusername").cloned(),
                password: params.get("etcdpassword").cloned(),
                poll_interval: timer_param(params, "etcdtimer")?,
            }),
        };
        Ok(ServiceDiscoveryConfig {
            enabled: settings.enabled,
            backend,
        })
    }

    pub fn kind(&self) -> StoreKind {
        match self.backend {
            BackendConfig::Consul(_) => StoreKind::Consul,
            BackendConfig::Etcd(_) => StoreKind::Etcd,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        match &self.backend {
            BackendConfig::Consul(c) => c.poll_interval,
            BackendConfig::Etcd(e) => e.poll_interval,
        }
    }
}

fn timer_param(params: &HashMap<String, String>, name: &str) -> Result<Duration, ConfigError> {
    match params.get(name) {
        None => Ok(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)),
        Some(raw) => {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::ParameterValue {
                name: name.to_string(),
                value: raw.clone(),
                reason: "not a millisecond count".to_string(),
            })?;
            Ok(Duration::from_millis(millis))
        }
    }
}
