// src/http_proxy.rs
use crate::{
    binding_registry::Environment,
    config::Config,
    middleware::apply_http_middleware,
    resolver::{Fault, Resolver},
};
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, Response, StatusCode},
    routing::any,
    Extension, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use reqwest::Client;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared reqwest client
fn make_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
}

/// Everything a routed request needs, injected once as an extension.
#[derive(Clone)]
pub struct GatewayContext {
    pub resolver: Arc<Resolver>,
    /// Request context (first path segment) -> api id.
    contexts: HashMap<String, String>,
    client: Client,
}

impl GatewayContext {
    pub fn new(config: &Config, resolver: Arc<Resolver>) -> Self {
        let contexts = config
            .apis
            .iter()
            .map(|api| (api.context.trim_matches('/').to_string(), api.id.clone()))
            .collect();
        GatewayContext {
            resolver,
            contexts,
            client: make_client(),
        }
    }

    pub fn api_for_context(&self, context: &str) -> Option<&str> {
        self.contexts.get(context).map(String::as_str)
    }
}

/// Which environment a request targets. Production unless the caller asks
/// for sandbox; key-type-based selection belongs to the auth pipeline, not
/// here.
fn request_environment(req: &Request<Body>) -> Environment {
    match req
        .headers()
        .get("x-environment")
        .and_then(|v| v.to_str().ok())
    {
        Some("sandbox") | Some("sand") => Environment::Sandbox,
        _ => Environment::Production,
    }
}

fn fault_response(fault: &Fault) -> Response<Body> {
    let body = serde_json::json!({ "fault": fault }).to_string();
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(text))
        .unwrap()
}

/// Proxy handler: one resolve per request, then forward.
async fn route_request(
    Extension(ctx): Extension<Arc<GatewayContext>>,
    req: Request<Body>,
) -> Response<Body> {
    let env = request_environment(&req);
    let method = req.method().clone();
    let mut headers = req.headers().clone();
    let query = req.uri().query().map(str::to_string);
    let path = req.uri().path().trim_start_matches('/');
    let mut parts = path.splitn(2, '/');
    let context = parts.next().unwrap_or("");
    let suffix = parts.next().unwrap_or("").to_string();

    let Some(api_id) = ctx.api_for_context(context) else {
        return text_response(StatusCode::NOT_FOUND, "Service not found");
    };

    let base = match ctx.resolver.resolve(api_id, env) {
        Ok(url) => url,
        Err(fault) => return fault_response(&fault),
    };

    let full_url = match query {
        Some(q) => format!("{}/{}?{}", base.trim_end_matches('/'), suffix, q),
        None => format!("{}/{}", base.trim_end_matches('/'), suffix),
    };
    let Ok(target) = full_url.parse::<reqwest::Url>() else {
        return text_response(StatusCode::BAD_GATEWAY, "Bad gateway");
    };

    let bytes = to_bytes(req.into_body(), MAX_BODY_BYTES)
        .await
        .unwrap_or_default();
    // The backend sets its own host and length.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    match ctx
        .client
        .request(method, target)
        .headers(headers)
        .body(bytes)
        .send()
        .await
    {
        Ok(res) => {
            let mut bldr = Response::builder().status(res.status());
            for (hk, hv) in res.headers().iter() {
                bldr = bldr.header(hk, hv);
            }
            let body = res.bytes().await.unwrap_or_default();
            bldr.body(Body::from(body)).unwrap()
        }
        Err(_) => text_response(StatusCode::BAD_GATEWAY, "Bad gateway"),
    }
}

fn build_router(
    ctx: Arc<GatewayContext>,
    auth_token: Option<String>,
    rate_per_sec: u64,
    rate_burst: Duration,
) -> Router {
    let app = Router::new().fallback(any(route_request));
    apply_http_middleware(app, ctx, auth_token, rate_per_sec, rate_burst)
}

/// Run HTTP gateway
pub async fn run_http_gateway(
    listen_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    auth_token: Option<String>,
    rate_per_sec: u64,
    rate_burst: Duration,
) -> anyhow::Result<()> {
    let app = build_router(ctx, auth_token, rate_per_sec, rate_burst);
    log::info!("HTTP gateway on http://{}", listen_addr);
    axum_server::bind(listen_addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Run HTTPS gateway
pub async fn run_https_gateway(
    listen_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
    cert_pem: String,
    key_pem: String,
    auth_token: Option<String>,
    rate_per_sec: u64,
    rate_burst: Duration,
) -> anyhow::Result<()> {
    let tls = RustlsConfig::from_pem_file(&cert_pem, &key_pem).await?;
    let app = build_router(ctx, auth_token, rate_per_sec, rate_burst);
    log::info!("HTTPS gateway on https://{}", listen_addr);
    axum_server::bind_rustls(listen_addr, tls)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
