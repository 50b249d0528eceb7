//! Login and logout routes.
//!
//! These sit outside the auth middleware: login is the way in, and logout
//! only needs the cookie itself. Login is concurrency-limited — bcrypt
//! verification is deliberately expensive.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tower::limit::ConcurrencyLimitLayer;

use crate::error::ApiError;
use crate::middleware::cookie_name;
use crate::state::AppState;

/// Concurrent logins allowed in flight.
const LOGIN_CONCURRENCY: usize = 8;

/// Top-level auth routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/auth/login",
            post(login).layer(ConcurrencyLimitLayer::new(LOGIN_CONCURRENCY)),
        )
        .route("/auth/logout", post(logout))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid login request: {e}")))?;

    let session = state
        .auth
        .login(&request.username, &request.password)
        .await?;

    let ttl_secs = state.auth.session_ttl().num_seconds().max(0);
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{}",
        cookie_name(state.secure_cookies),
        session.token,
        ttl_secs,
        if state.secure_cookies { "; Secure" } else { "" },
    );
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]).into_response())
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let name = cookie_name(state.secure_cookies);
    if let Some(token) = cookie_value(&headers, name) {
        state.auth.logout(&token).await?;
    }

    let clear = format!(
        "{}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0{}",
        name,
        if state.secure_cookies { "; Secure" } else { "" },
    );
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, clear)]).into_response())
}

fn cookie_value(headers: &HeaderMap, wanted: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == wanted).then(|| value.to_owned())
    })
}
