//! KV routes: list, read, write, delete, history, revision, restore.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use stash_core::auth::AccessOp;
use stash_core::error::KvError;
use stash_core::events::EventAction;
use stash_core::key::{Format, normalize_key};
use stash_core::kv::KeyInfo;
use stash_core::revision::RevisionEntry;
use stash_storage::ListFilter;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::routes::authorize;
use crate::state::AppState;

/// Format selector on PUT requests.
const FORMAT_HEADER: &str = "x-stash-format";
/// Optimistic-lock version on PUT requests, epoch milliseconds.
const EXPECTED_HEADER: &str = "x-stash-expected-updated";

/// Routes nested under `/kv`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_keys))
        .route("/history/{*key}", get(history))
        .route("/revision/{commit}/{*key}", get(get_revision))
        .route("/restore/{commit}/{*key}", put(restore))
        .route(
            "/{*key}",
            get(get_value).put(put_value).delete(delete_value),
        )
}

#[derive(Debug, Deserialize)]
struct ListParams {
    prefix: Option<String>,
    filter: Option<String>,
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<KeyInfo>>, ApiError> {
    let filter = match params.filter.as_deref() {
        None | Some("all") => ListFilter::All,
        Some("secrets") => ListFilter::SecretsOnly,
        Some("keys") => ListFilter::KeysOnly,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("unknown filter '{other}'")));
        }
    };

    let mut infos = state.kv.list(params.prefix.as_deref(), filter).await?;
    infos.retain(|info| state.auth.check(&ctx.principal, &info.key, AccessOp::Read));
    Ok(Json(infos))
}

async fn get_value(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &ctx, &key, AccessOp::Read)?;

    let value = state.kv.get(&key).await?;
    Ok((
        [
            (header::CONTENT_TYPE.as_str(), value.format.content_type()),
            (FORMAT_HEADER, value.format.as_str()),
        ],
        value.bytes.as_ref().clone(),
    )
        .into_response())
}

async fn put_value(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &ctx, &key, AccessOp::Write)?;

    let format = parse_format_header(&headers)?;
    let expected = parse_expected_header(&headers)?;

    if let Some(expected) = expected {
        match state
            .kv
            .set_with_version(&key, &body, format, expected)
            .await
        {
            Ok(()) => {}
            Err(KvError::Conflict { .. }) => {
                let current = state.kv.get_info(&key).await.ok().map(|i| i.updated_at);
                return Err(ApiError::Conflict {
                    current_updated_at: current,
                });
            }
            Err(e) => return Err(e.into()),
        }
        after_write(&state, &ctx, &key, Some(&body), format, EventAction::Update).await;
        return Ok(StatusCode::OK.into_response());
    }

    let created = state.kv.set(&key, &body, format).await?;
    let action = if created {
        EventAction::Create
    } else {
        EventAction::Update
    };
    after_write(&state, &ctx, &key, Some(&body), format, action).await;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(status.into_response())
}

async fn delete_value(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &ctx, &key, AccessOp::Write)?;

    state.kv.delete(&key).await?;
    after_write(&state, &ctx, &key, None, Format::Text, EventAction::Delete).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

/// One history entry on the wire. Values travel base64-encoded; a delete
/// marker has no `value`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntryBody {
    commit_id: String,
    timestamp: i64,
    author: String,
    key: String,
    format: String,
    deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_value: Option<String>,
}

impl From<RevisionEntry> for HistoryEntryBody {
    fn from(entry: RevisionEntry) -> Self {
        use base64::Engine as _;
        let encode = |bytes: Vec<u8>| base64::engine::general_purpose::STANDARD.encode(bytes);
        Self {
            commit_id: entry.commit_id,
            timestamp: entry.timestamp,
            author: entry.author,
            key: entry.key,
            format: entry.format,
            deleted: entry.current_value.is_none(),
            value: entry.current_value.map(encode),
            previous_value: entry.previous_value.map(encode),
        }
    }
}

async fn history(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(key): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntryBody>>, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &ctx, &key, AccessOp::Read)?;

    let revisions = state.revisions.as_ref().ok_or(ApiError::NotFound)?;
    let entries = revisions
        .history(&key, params.limit.unwrap_or(50))
        .await?;
    if entries.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

async fn get_revision(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((commit, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &ctx, &key, AccessOp::Read)?;

    let revisions = state.revisions.as_ref().ok_or(ApiError::NotFound)?;
    let (value, format) = revisions.get_revision(&key, &commit).await?;
    let format: Format = format.parse().unwrap_or_default();
    Ok((
        [
            (header::CONTENT_TYPE.as_str(), format.content_type()),
            (FORMAT_HEADER, format.as_str()),
        ],
        value,
    )
        .into_response())
}

async fn restore(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path((commit, key)): Path<(String, String)>,
) -> Result<Json<KeyInfo>, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &ctx, &key, AccessOp::Write)?;

    let revisions = state.revisions.as_ref().ok_or(ApiError::NotFound)?;
    let (value, format) = revisions.get_revision(&key, &commit).await?;
    let format: Format = format.parse().unwrap_or_default();

    // A restore is a normal write: audited, published, committed.
    let created = state.kv.set(&key, &value, format).await?;
    let action = if created {
        EventAction::Create
    } else {
        EventAction::Update
    };
    after_write(&state, &ctx, &key, Some(&value), format, action).await;

    Ok(Json(state.kv.get_info(&key).await?))
}

fn parse_format_header(headers: &HeaderMap) -> Result<Format, ApiError> {
    match headers.get(FORMAT_HEADER) {
        None => Ok(Format::default()),
        Some(raw) => raw
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ApiError::BadRequest("unknown format".to_owned())),
    }
}

fn parse_expected_header(headers: &HeaderMap) -> Result<Option<i64>, ApiError> {
    match headers.get(EXPECTED_HEADER) {
        None => Ok(None),
        Some(raw) => raw
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| {
                ApiError::BadRequest("invalid expected version (epoch milliseconds)".to_owned())
            }),
    }
}

/// Post-commit side effects of a successful write: event publication
/// (fire-and-forget) and the history commit (failure logged, never
/// surfaced — the KV row is the source of truth).
async fn after_write(
    state: &AppState,
    ctx: &AuthContext,
    key: &str,
    value: Option<&[u8]>,
    format: Format,
    action: EventAction,
) {
    if let Some(bus) = &state.events {
        bus.publish(key, action);
    }

    if let Some(revisions) = &state.revisions {
        let author = ctx.principal.actor_name();
        let outcome = match value {
            Some(value) => revisions.commit(key, value, format.as_str(), author).await,
            None => revisions.delete(key, author).await,
        };
        if let Err(e) = outcome {
            warn!(key, error = %e, "history commit failed, kv row remains authoritative");
        }
    }
}
