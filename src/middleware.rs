// src/middleware.rs

use crate::http_proxy::GatewayContext;
use axum::body::Body;
use axum::error_handling::HandleErrorLayer;
use axum::http::{Request, Response, StatusCode};
use axum::{BoxError, Router};
use futures_core::future::BoxFuture;
use std::{sync::Arc, time::Duration};
use tower::buffer::BufferLayer;
use tower::limit::RateLimitLayer;
use tower::ServiceBuilder;
use tower_http::{
    add_extension::AddExtensionLayer,
    auth::{AsyncAuthorizeRequest, AsyncRequireAuthorizationLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Simple bearer-token authorizer
#[derive(Clone)]
pub struct BearerAuth(pub String);

impl<B> AsyncAuthorizeRequest<B> for BearerAuth
where
    B: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = Body;
    type Future = BoxFuture<'static, Result<Request<B>, Response<Body>>>;

    fn authorize(&mut self, req: Request<B>) -> Self::Future {
        let token = self.0.clone();
        Box::pin(async move {
            if req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .filter(|h| *h == token)
                .is_some()
            {
                Ok(req)
            } else {
                let resp = Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .body(Body::empty())
                    .unwrap();
                Err(resp)
            }
        })
    }
}

/// Stack onto the router:
/// 1. tracing
/// 2. rate limit
/// 3. gateway context extension
/// 4. optional bearer auth (if a token is configured)
pub fn apply_http_middleware(
    router: Router,
    ctx: Arc<GatewayContext>,
    auth_token: Option<String>,
    rate_per_sec: u64,
    rate_burst: Duration,
) -> Router {
    // 1) HTTP request tracing
    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().include_headers(true))
        .on_response(DefaultOnResponse::new());

    // 2) Rate limiting. RateLimit is not Clone, so it sits behind a Buffer;
    //    buffer errors surface as 429s.
    let rate = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|_: BoxError| async {
            StatusCode::TOO_MANY_REQUESTS
        }))
        .layer(BufferLayer::new(1024))
        .layer(RateLimitLayer::new(rate_per_sec, rate_burst));

    // 3) Inject the gateway context via extension
    let router = router
        .layer(trace)
        .layer(rate)
        .layer(AddExtensionLayer::new(ctx));

    // 4) Optional bearer-token auth
    match auth_token {
        Some(token) => router.layer(AsyncRequireAuthorizationLayer::new(BearerAuth(token))),
        None => router,
    }
}
