// src/etcd.rs

use crate::config::{EtcdConfig, StoreKind};
use crate::discovery::{DiscoveryBackend, FetchOutcome, FETCH_TIMEOUT};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// etcd backend speaking the v3 HTTP gateway. Keys and values are
/// base64-coded in request and response bodies. When credentials are
/// configured the backend authenticates once, caches the session token, and
/// drops it whenever the store reports it invalid so the next poll
/// re-authenticates.
pub struct EtcdBackend {
    client: Client,
    config: EtcdConfig,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    kvs: Option<Vec<RangeKv>>,
}

#[derive(Debug, Deserialize)]
struct RangeKv {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrpcError {
    code: Option<i64>,
    error: Option<String>,
    message: Option<String>,
}

impl EtcdBackend {
    pub fn new(config: EtcdConfig) -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            config,
            token: Mutex::new(None),
        }
    }

    /// Returns the session token to attach, authenticating first if needed.
    /// `Ok(None)` means the store is not running with auth.
    async fn ensure_token(&self, base: &str) -> Result<Option<String>, FetchOutcome> {
        let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) else {
            return Ok(None);
        };
        if let Some(token) = self.token.lock().clone() {
            return Ok(Some(token));
        }

        let body = serde_json::json!({ "name": user, "password": pass });
        let response = self
            .client
            .post(format!("{}/v3/auth/authenticate", base))
            .json(&body)
            .send()
            .await
            .map_err(|_| FetchOutcome::Unreachable)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchOutcome::AuthFailure);
        }
        let text = response.text().await.map_err(|_| FetchOutcome::Unreachable)?;
        match serde_json::from_str::<AuthResponse>(&text) {
            Ok(AuthResponse { token: Some(token) }) => {
                *self.token.lock() = Some(token.clone());
                Ok(Some(token))
            }
            _ if is_auth_error_body(&text) => Err(FetchOutcome::AuthFailure),
            _ => Err(FetchOutcome::Unreachable),
        }
    }

    fn drop_token(&self) {
        self.token.lock().take();
    }
}

#[async_trait]
impl DiscoveryBackend for EtcdBackend {
    fn kind(&self) -> StoreKind {
        StoreKind::Etcd
    }

    async fn fetch(&self, key: &str) -> FetchOutcome {
        let Some(base) = self.config.url.as_deref() else {
            return FetchOutcome::Unreachable;
        };
        let base = base.trim_end_matches('/');

        let token = match self.ensure_token(base).await {
            Ok(t) => t,
            Err(outcome) => return outcome,
        };

        let body = serde_json::json!({ "key": BASE64.encode(key) });
        let mut request = self.client.post(format!("{}/v3/kv/range", base)).json(&body);
        if let Some(token) = &token {
            request = request.header("Authorization", token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                log::debug!("etcd fetch for key {} failed: {}", key, e);
                return FetchOutcome::Unreachable;
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.drop_token();
            return FetchOutcome::AuthFailure;
        }
        let text = match response.text().await {
            Ok(t) => t,
            Err(_) => return FetchOutcome::Unreachable,
        };
        if status.is_success() {
            parse_range_body(&text)
        } else if is_auth_error_body(&text) {
            self.drop_token();
            FetchOutcome::AuthFailure
        } else {
            log::debug!("etcd returned HTTP {} for key {}", status, key);
            FetchOutcome::Unreachable
        }
    }
}

fn parse_range_body(body: &str) -> FetchOutcome {
    let parsed: RangeResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(_) => return FetchOutcome::Unreachable,
    };
    let Some(kv) = parsed.kvs.and_then(|kvs| kvs.into_iter().next()) else {
        return FetchOutcome::NotFound;
    };
    match kv.value {
        None => FetchOutcome::Found(String::new()),
        Some(encoded) => match BASE64.decode(&encoded) {
            Ok(bytes) => FetchOutcome::Found(String::from_utf8_lossy(&bytes).into_owned()),
            Err(_) => FetchOutcome::Found(encoded),
        },
    }
}

/// etcd reports auth problems through grpc-gateway error bodies rather than
/// HTTP status alone: code 16 (unauthenticated), code 7 (permission denied),
/// or an invalid-credentials message on code 3.
fn is_auth_error_body(body: &str) -> bool {
    let Ok(err) = serde_json::from_str::<GrpcError>(body) else {
        return false;
    };
    if matches!(err.code, Some(7) | Some(16)) {
        return true;
    }
    let msg = err.error.or(err.message).unwrap_or_default();
    msg.contains("authentication failed") || msg.contains("invalid auth token")
}
