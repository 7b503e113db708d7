// src/consul.rs

use crate::config::{ConsulConfig, StoreKind};
use crate::discovery::{DiscoveryBackend, FetchOutcome, FETCH_TIMEOUT};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// Consul KV backend. One `GET /v1/kv/<key>` per fetch, token passed via the
/// `X-Consul-Token` header. KV values come back base64-encoded.
pub struct ConsulBackend {
    client: Client,
    config: ConsulConfig,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl ConsulBackend {
    pub fn new(config: ConsulConfig) -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self { client, config }
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulBackend {
    fn kind(&self) -> StoreKind {
        StoreKind::Consul
    }

    async fn fetch(&self, key: &str) -> FetchOutcome {
        let Some(base) = self.config.url.as_deref() else {
            // No consulurl parameter was ever supplied.
            return FetchOutcome::Unreachable;
        };
        let url = format!("{}/v1/kv/{}", base.trim_end_matches('/'), key);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.header("X-Consul-Token", token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                log::debug!("consul fetch for key {} failed: {}", key, e);
                return FetchOutcome::Unreachable;
            }
        };

        match response.status() {
            StatusCode::NOT_FOUND => FetchOutcome::NotFound,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchOutcome::AuthFailure,
            status if status.is_success() => match response.text().await {
                Ok(body) => parse_kv_body(&body),
                Err(_) => FetchOutcome::Unreachable,
            },
            status => {
                log::debug!("consul returned HTTP {} for key {}", status, key);
                FetchOutcome::Unreachable
            }
        }
    }
}

fn parse_kv_body(body: &str) -> FetchOutcome {
    let entries: Vec<KvEntry> = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return FetchOutcome::Unreachable,
    };
    let Some(entry) = entries.first() else {
        return FetchOutcome::NotFound;
    };
    match &entry.value {
        // A key can exist with no value attached.
        None => FetchOutcome::Found(String::new()),
        Some(encoded) => match BASE64.decode(encoded) {
            Ok(bytes) => FetchOutcome::Found(String::from_utf8_lossy(&bytes).into_owned()),
            // Not base64 after all; pass the raw value through and let URL
            // validation judge it.
            Err(_) => FetchOutcome::Found(encoded.clone()),
        },
    }
}
