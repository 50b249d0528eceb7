//! Route handlers and router assembly.
//!
//! Middleware order is load-bearing: audit (outermost) → auth → handler,
//! with event publication and history commits happening inside the handler
//! after the KV write returns. The subscription routes sit outside the
//! request-timeout layer — their connections are long-lived by design.

pub mod audit;
pub mod auth;
pub mod kv;
pub mod subscribe;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, header};
use axum::middleware as axum_mw;
use axum::routing::get;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use stash_core::auth::{AccessOp, Actor};

use crate::error::ApiError;
use crate::middleware::{AuthContext, audit_middleware, auth_middleware};
use crate::state::AppState;

/// Build the full application router.
#[must_use]
pub fn build_router(
    state: Arc<AppState>,
    max_body_bytes: usize,
    request_timeout: Duration,
) -> Router {
    // Bounded-latency API routes.
    let timed = Router::new()
        .nest("/kv", kv::router())
        .nest("/audit", audit::router())
        .layer(TimeoutLayer::new(request_timeout));

    // Streaming routes: no request timeout, the write deadline is lifted
    // for the duration of the subscription.
    let streaming = Router::new().nest("/kv/subscribe", subscribe::router());

    let protected = timed.merge(streaming).layer(axum_mw::from_fn_with_state(
        Arc::clone(&state),
        auth_middleware,
    ));

    Router::new()
        .route("/ping", get(ping))
        .merge(auth::router())
        .merge(protected)
        .layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            audit_middleware,
        ))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

/// Decide `(key, op)` for the request's principal, for the KV and audit
/// routes: a denied public principal maps to 401 (the caller should
/// authenticate), a denied authenticated principal to 403.
///
/// Subscriptions do not use this helper — a denied subscription is 403
/// for every principal.
pub(crate) fn authorize(
    state: &AppState,
    ctx: &AuthContext,
    key: &str,
    op: AccessOp,
) -> Result<(), ApiError> {
    if state.auth.check(&ctx.principal, key, op) {
        return Ok(());
    }
    if matches!(ctx.principal.actor, Actor::Public) {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Forbidden)
    }
}
