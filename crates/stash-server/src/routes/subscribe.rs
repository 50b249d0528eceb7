//! Change-notification subscriptions over server-sent events.
//!
//! `GET /kv/subscribe/<path>` joins the topic derived from the path and
//! streams every subsequent matching event as a `change` record until the
//! client disconnects, the subscriber falls behind, or the bus shuts down.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use stash_core::auth::AccessOp;
use stash_core::events::{representative_key, topic_from_path};

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Routes nested under `/kv/subscribe`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{*path}", get(subscribe))
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(path): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let topic = topic_from_path(&path)
        .ok_or_else(|| ApiError::BadRequest("invalid subscription path".to_owned()))?;

    // Prefix topics are gated by a representative child key. A denied
    // subscription is always 403, whatever the principal — this route has
    // no 401 arm.
    if !state
        .auth
        .check(&ctx.principal, &representative_key(&topic), AccessOp::Read)
    {
        return Err(ApiError::Forbidden);
    }

    let bus = state.events.as_ref().ok_or(ApiError::NotFound)?;
    let subscription = bus.subscribe(&topic);
    debug!(topic = %topic, actor = ctx.principal.actor_name(), "subscriber joined");

    let stream = ReceiverStream::new(subscription.receiver).map(|record| {
        let event = Event::default().event("change");
        Ok(match event.json_data(&record) {
            Ok(event) => event,
            // Serialization of EventRecord cannot fail; keep the stream alive.
            Err(_) => Event::default().event("change").data("{}"),
        })
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
