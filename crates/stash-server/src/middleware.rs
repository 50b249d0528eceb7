//! Request middleware: audit capture (outermost) and principal extraction.
//!
//! Ordering is load-bearing: the audit layer wraps the auth layer so that
//! requests rejected before authorization are still recorded. The auth
//! layer resolves the principal (token → session → public), injects it into
//! the request extensions for handlers, and reports the acting identity
//! back through the response extensions for the audit layer to read.

use std::sync::Arc;

use axum::body::HttpBody;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use stash_core::audit::{AuditAction, AuditRecord, AuditResult};
use stash_core::auth::{Principal, mask_token};
use stash_core::key::normalize_key;

use crate::error::ApiError;
use crate::state::AppState;

/// Session cookie name for HTTPS deployments.
pub const SECURE_COOKIE: &str = "__Host-stash-auth";
/// Session cookie name for plain-HTTP deployments.
pub const PLAIN_COOKIE: &str = "stash-auth";

/// Token header, preferred over the `Authorization` scheme.
pub const TOKEN_HEADER: &str = "x-auth-token";

/// The resolved principal, available to every handler.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The request's principal.
    pub principal: Principal,
}

/// Per-request correlation id, generated by the audit layer.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Acting identity, reported through response extensions for audit.
#[derive(Debug, Clone)]
struct AuditActor {
    name: String,
    kind: String,
}

/// The session cookie name for this deployment.
#[must_use]
pub fn cookie_name(secure: bool) -> &'static str {
    if secure { SECURE_COOKIE } else { PLAIN_COOKIE }
}

/// Extract the presented API token, header first, then bearer scheme.
fn presented_token(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(TOKEN_HEADER) {
        return value.to_str().ok().map(str::to_owned);
    }
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Extract the session cookie value, if present.
pub fn session_cookie(req: &Request, secure: bool) -> Option<String> {
    let wanted = cookie_name(secure);
    let cookies = req.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == wanted).then(|| value.to_owned())
    })
}

/// Resolve the request's principal: token → session → public.
///
/// A presented-but-invalid credential is rejected outright (401) rather
/// than falling back to the public principal.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let (principal, rejected_actor) = if let Some(token) = presented_token(&req) {
        match state.auth.authenticate_token(&token).await {
            Some(p) => (Some(p), None),
            None => (
                None,
                Some(AuditActor {
                    name: mask_token(&token),
                    kind: "token".to_owned(),
                }),
            ),
        }
    } else if let Some(session) = session_cookie(&req, state.secure_cookies) {
        match state.auth.authenticate_session(&session).await {
            Ok(Some(p)) => (Some(p), None),
            Ok(None) => (None, None),
            Err(e) => {
                let mut res = ApiError::from(e).into_response();
                res.extensions_mut().insert(public_actor());
                return res;
            }
        }
    } else {
        (state.auth.public_principal().await, None)
    };

    match principal {
        Some(principal) => {
            let actor = AuditActor {
                name: principal.actor_name().to_owned(),
                kind: principal.actor_type().to_owned(),
            };
            req.extensions_mut().insert(AuthContext { principal });
            let mut res = next.run(req).await;
            res.extensions_mut().insert(actor);
            res
        }
        None => {
            let mut res = ApiError::Unauthorized.into_response();
            res.extensions_mut()
                .insert(rejected_actor.unwrap_or_else(public_actor));
            res
        }
    }
}

fn public_actor() -> AuditActor {
    AuditActor {
        name: "public".to_owned(),
        kind: "public".to_owned(),
    }
}

/// Outermost middleware: stamps a request id and, for KV requests, records
/// one audit entry after the inner handler completes. The write happens on
/// a spawned task so the response is never delayed by the audit store.
pub async fn audit_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let request_id = uuid::Uuid::new_v4().to_string();
    let ip = client_ip(&req);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let request_len: Option<u64> = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    req.extensions_mut().insert(RequestId(request_id.clone()));
    let mut res = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        res.headers_mut().insert("x-request-id", value);
    }

    if let Some(audit) = &state.audit {
        if should_audit(&method, &path) {
            let actor = res
                .extensions()
                .get::<AuditActor>()
                .cloned()
                .unwrap_or_else(public_actor);
            let record = build_record(
                &method,
                res.status(),
                &path,
                &actor,
                request_len,
                response_len(&res),
                ip,
                user_agent,
                request_id,
            );
            let audit = Arc::clone(audit);
            tokio::spawn(async move {
                audit.record(record).await;
            });
        }
    }
    res
}

/// KV requests are audited; the list endpoint and subscription streams are
/// not (a stream only completes at disconnect, where an entry would record
/// nothing useful).
fn should_audit(method: &Method, path: &str) -> bool {
    path.starts_with("/kv/")
        && path != "/kv/"
        && !path.starts_with("/kv/subscribe/")
        && *method != Method::HEAD
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |info| info.0.ip().to_string())
}

fn response_len(res: &Response) -> Option<u64> {
    res.body().size_hint().exact()
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    method: &Method,
    status: StatusCode,
    path: &str,
    actor: &AuditActor,
    request_len: Option<u64>,
    response_len: Option<u64>,
    ip: String,
    user_agent: String,
    request_id: String,
) -> AuditRecord {
    let action = match *method {
        Method::PUT => {
            if status == StatusCode::CREATED {
                AuditAction::Create
            } else {
                AuditAction::Update
            }
        }
        Method::DELETE => AuditAction::Delete,
        _ => AuditAction::Read,
    };

    let result = if status.is_success() {
        AuditResult::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AuditResult::Denied
    } else {
        AuditResult::NotFound
    };

    let value_size = match (result, action) {
        (AuditResult::Success, AuditAction::Read) => response_len,
        (AuditResult::Success, AuditAction::Create | AuditAction::Update) => request_len,
        _ => None,
    };

    debug!(%method, %status, path, actor = %actor.name, "audit capture");

    AuditRecord {
        action,
        key: audit_key(path),
        actor: actor.name.clone(),
        actor_type: actor.kind.clone(),
        result,
        ip,
        user_agent,
        request_id,
        value_size,
    }
}

/// The key a KV request addressed, with routing markers stripped.
fn audit_key(path: &str) -> String {
    let rest = path.strip_prefix("/kv/").unwrap_or(path);
    let rest = if let Some(tail) = rest.strip_prefix("history/") {
        tail
    } else if let Some(tail) = rest.strip_prefix("revision/") {
        tail.split_once('/').map_or(tail, |(_, key)| key)
    } else if let Some(tail) = rest.strip_prefix("restore/") {
        tail.split_once('/').map_or(tail, |(_, key)| key)
    } else {
        rest
    };
    normalize_key(rest).unwrap_or_else(|_| rest.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_scope_covers_kv_only() {
        assert!(should_audit(&Method::GET, "/kv/app/cfg"));
        assert!(should_audit(&Method::PUT, "/kv/secrets/db"));
        assert!(should_audit(&Method::GET, "/kv/history/app/cfg"));
        assert!(!should_audit(&Method::GET, "/kv/"));
        assert!(!should_audit(&Method::GET, "/kv/subscribe/app/*"));
        assert!(!should_audit(&Method::GET, "/ping"));
        assert!(!should_audit(&Method::POST, "/audit/query"));
    }

    #[test]
    fn audit_key_strips_routing_markers() {
        assert_eq!(audit_key("/kv/app/cfg"), "app/cfg");
        assert_eq!(audit_key("/kv/history/app/cfg"), "app/cfg");
        assert_eq!(audit_key("/kv/revision/abc123/app/cfg"), "app/cfg");
        assert_eq!(audit_key("/kv/restore/abc123/app/cfg"), "app/cfg");
        assert_eq!(audit_key("/kv/my%20key"), "my key");
    }

    #[test]
    fn cookie_names_follow_deployment() {
        assert_eq!(cookie_name(true), "__Host-stash-auth");
        assert_eq!(cookie_name(false), "stash-auth");
    }
}
