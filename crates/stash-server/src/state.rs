//! Shared application state.

use std::sync::Arc;

use stash_core::audit::AuditLog;
use stash_core::auth::AuthService;
use stash_core::events::EventBus;
use stash_core::kv::KvStore;
use stash_core::revision::RevisionStore;

/// Everything the handlers need, wired once at startup.
///
/// The optional fields follow the capability pattern: a `None` event bus
/// silently disables notifications, a `None` revision store disables
/// history, and a `None` audit log disables capture and the query endpoint.
pub struct AppState {
    /// The KV store (component A).
    pub kv: Arc<KvStore>,
    /// Auth service (component C).
    pub auth: Arc<AuthService>,
    /// Audit log (component D), when enabled.
    pub audit: Option<Arc<AuditLog>>,
    /// Event bus (component E), when enabled.
    pub events: Option<Arc<EventBus>>,
    /// Revision store (component B), when configured.
    pub revisions: Option<Arc<RevisionStore>>,
    /// Selects the `__Host-` session cookie name.
    pub secure_cookies: bool,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("audit", &self.audit.is_some())
            .field("events", &self.events.is_some())
            .field("revisions", &self.revisions.is_some())
            .finish_non_exhaustive()
    }
}
