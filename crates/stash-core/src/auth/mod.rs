//! Authentication and authorization.
//!
//! The service owns an immutable [`AuthSnapshot`] swapped atomically under a
//! reader-writer lock (readers clone the `Arc` for the duration of one
//! decision), and persists login sessions through the store. Three kinds of
//! principal exist: named users (session cookie), named tokens (header),
//! and the public principal configured as the literal token `*`.
//!
//! # Security model
//!
//! - Password checks always run bcrypt, even for unknown users (a fixed
//!   decoy hash), so timing does not reveal user existence.
//! - Token lookup compares candidates in constant time.
//! - Admin principals bypass the ACL, secrets paths included.
//! - Swapping in a new snapshot deletes the sessions of every user whose
//!   password changed or who disappeared; other sessions stay valid.

pub mod acl;
pub mod config;
mod reload;

use std::sync::{Arc, OnceLock};

use chrono::{TimeDelta, Utc};
use stash_storage::{SessionRow, Store};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use acl::{Access, AccessOp, PermissionRule};
pub use config::{ApiToken, AuthSnapshot, PUBLIC_TOKEN, User};
pub use reload::spawn_config_watcher;

use crate::error::AuthError;

/// Fallback decoy in the unlikely event hashing fails at first use.
const DECOY_FALLBACK: &str = "$2b$12$AAAAAAAAAAAAAAAAAAAAAOUypGGJiMl8IEX1MI2dS2nhBIJ4aDT1m";

fn decoy_hash() -> &'static str {
    static DECOY: OnceLock<String> = OnceLock::new();
    DECOY.get_or_init(|| {
        bcrypt::hash("stash.decoy", bcrypt::DEFAULT_COST)
            .unwrap_or_else(|_| DECOY_FALLBACK.to_owned())
    })
}

/// The identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// A named user (session credential).
    User(String),
    /// A named token, stored masked.
    Token(String),
    /// The public principal.
    Public,
}

/// A resolved principal: identity plus its authorization data.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Who this is, for audit entries and history authorship.
    pub actor: Actor,
    /// Admins bypass the ACL.
    pub admin: bool,
    /// Prefix rules from the snapshot.
    pub rules: Vec<PermissionRule>,
}

impl Principal {
    /// Actor name as recorded in audit entries.
    #[must_use]
    pub fn actor_name(&self) -> &str {
        match &self.actor {
            Actor::User(name) | Actor::Token(name) => name,
            Actor::Public => "public",
        }
    }

    /// Actor type as recorded in audit entries.
    #[must_use]
    pub fn actor_type(&self) -> &'static str {
        match self.actor {
            Actor::User(_) => "user",
            Actor::Token(_) => "token",
            Actor::Public => "public",
        }
    }
}

/// Mask a token for audit entries and commit authorship: the first four
/// characters survive, the rest is blanked.
#[must_use]
pub fn mask_token(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}****")
}

/// The auth service.
pub struct AuthService {
    snapshot: RwLock<Arc<AuthSnapshot>>,
    store: Arc<dyn Store>,
    session_ttl: TimeDelta,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService").finish_non_exhaustive()
    }
}

impl AuthService {
    /// Create the service with an initial snapshot and a session TTL.
    #[must_use]
    pub fn new(snapshot: AuthSnapshot, store: Arc<dyn Store>, session_ttl: TimeDelta) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            store,
            session_ttl,
        }
    }

    /// The configured session lifetime.
    #[must_use]
    pub fn session_ttl(&self) -> TimeDelta {
        self.session_ttl
    }

    /// Clone the current snapshot for one decision.
    pub async fn snapshot(&self) -> Arc<AuthSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Verify a password and create a persisted session.
    ///
    /// Unknown users are verified against a decoy hash so the timing of a
    /// rejection does not reveal whether the user exists.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredentials`] on a bad user/password pair,
    /// [`AuthError::Storage`] when the session cannot be persisted.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionRow, AuthError> {
        let snapshot = self.snapshot().await;
        let known = snapshot.user(username);
        let hash = known.map_or_else(|| decoy_hash().to_owned(), |u| u.password_hash.clone());

        let password = password.to_owned();
        let verified = tokio::task::spawn_blocking(move || {
            bcrypt::verify(&password, &hash).unwrap_or(false)
        })
        .await
        .unwrap_or(false);

        if known.is_none() || !verified {
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        let session = SessionRow {
            token: uuid::Uuid::new_v4().simple().to_string(),
            username: username.to_owned(),
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        self.store.session_insert(&session).await?;
        info!(username, "session created");
        Ok(session)
    }

    /// Delete a session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the store fails.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.store.session_delete(token).await?;
        Ok(())
    }

    /// Resolve an API token to a principal.
    pub async fn authenticate_token(&self, presented: &str) -> Option<Principal> {
        let snapshot = self.snapshot().await;
        snapshot.token(presented).map(|t| Principal {
            actor: Actor::Token(mask_token(&t.token)),
            admin: t.admin,
            rules: t.rules.clone(),
        })
    }

    /// Resolve a session cookie to a principal.
    ///
    /// Expired sessions are deleted on sight. A session whose user no
    /// longer exists in the snapshot is treated as invalid.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the store fails.
    pub async fn authenticate_session(&self, token: &str) -> Result<Option<Principal>, AuthError> {
        let Some(session) = self.store.session_get(token).await? else {
            return Ok(None);
        };
        if session.expires_at <= Utc::now() {
            self.store.session_delete(token).await?;
            return Ok(None);
        }

        let snapshot = self.snapshot().await;
        let Some(user) = snapshot.user(&session.username) else {
            return Ok(None);
        };
        Ok(Some(Principal {
            actor: Actor::User(user.name.clone()),
            admin: user.admin,
            rules: user.rules.clone(),
        }))
    }

    /// The public principal, if the config carries a `*` token.
    pub async fn public_principal(&self) -> Option<Principal> {
        let snapshot = self.snapshot().await;
        snapshot.public().map(|t| Principal {
            actor: Actor::Public,
            admin: t.admin,
            rules: t.rules.clone(),
        })
    }

    /// Decide `(key, op)` for a principal. Admins always pass.
    #[must_use]
    pub fn check(&self, principal: &Principal, key: &str, op: AccessOp) -> bool {
        principal.admin || acl::check(&principal.rules, key, op)
    }

    /// Keep only the keys the principal may read. The result is always a
    /// sublist of the input, in input order.
    #[must_use]
    pub fn filter_keys(&self, principal: &Principal, keys: Vec<String>) -> Vec<String> {
        keys.into_iter()
            .filter(|key| self.check(principal, key, AccessOp::Read))
            .collect()
    }

    /// Swap in a new snapshot and invalidate the sessions of affected users
    /// (removed, or password hash changed). Returns the affected names.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if session deletion fails; the
    /// snapshot swap itself has already happened at that point.
    pub async fn apply_snapshot(&self, next: AuthSnapshot) -> Result<Vec<String>, AuthError> {
        let next = Arc::new(next);
        let affected = {
            let mut guard = self.snapshot.write().await;
            let affected = guard.affected_users(&next);
            *guard = Arc::clone(&next);
            affected
        };

        for username in &affected {
            let removed = self.store.session_delete_for_user(username).await?;
            if removed > 0 {
                info!(user = %username, sessions = removed, "sessions invalidated by config change");
            }
        }
        Ok(affected)
    }

    /// Delete expired sessions. Called from the background sweeper.
    pub async fn sweep_expired_sessions(&self) {
        match self.store.session_delete_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired sessions swept"),
            Err(e) => warn!(error = %e, "session sweep failed"),
        }
    }
}
