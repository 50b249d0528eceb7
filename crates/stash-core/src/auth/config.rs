//! Auth config file parsing and the immutable snapshot.
//!
//! The config is a YAML document with two lists:
//!
//! ```yaml
//! users:
//!   - name: alice
//!     password: $2b$12$...        # bcrypt hash
//!     admin: true
//!     permissions:
//!       - { prefix: "app/*", access: rw }
//! tokens:
//!   - token: ci-deploy-token
//!     permissions:
//!       - { prefix: "app/*", access: r }
//!   - token: "*"                  # the public principal
//!     permissions:
//!       - { prefix: "public/*", access: r }
//! ```
//!
//! Loading validates the whole document; an invalid document is rejected as
//! a unit so a hot-reload can keep the previous snapshot.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use subtle::ConstantTimeEq;

use super::acl::{Access, PermissionRule};
use crate::error::ConfigError;

/// The token value denoting the public principal.
pub const PUBLIC_TOKEN: &str = "*";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    name: String,
    password: String,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    permissions: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    permissions: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    prefix: String,
    access: Access,
}

/// A named user.
#[derive(Debug, Clone)]
pub struct User {
    /// Login name.
    pub name: String,
    /// Bcrypt password hash.
    pub password_hash: String,
    /// Admins bypass the ACL.
    pub admin: bool,
    /// Prefix rules.
    pub rules: Vec<PermissionRule>,
}

/// An API token.
#[derive(Debug, Clone)]
pub struct ApiToken {
    /// The token value; [`PUBLIC_TOKEN`] denotes the public principal.
    pub token: String,
    /// Admins bypass the ACL.
    pub admin: bool,
    /// Prefix rules.
    pub rules: Vec<PermissionRule>,
}

/// An immutable, validated view of the auth config.
///
/// The service swaps whole snapshots under a lock; readers clone the `Arc`
/// and never observe a torn state.
#[derive(Debug, Default)]
pub struct AuthSnapshot {
    users: HashMap<String, User>,
    tokens: Vec<ApiToken>,
}

impl AuthSnapshot {
    /// A snapshot with no principals — every request is rejected.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed YAML, [`ConfigError::Invalid`]
    /// for structural violations (duplicates, bad prefixes, bad hashes).
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Self::from_file(file)
    }

    /// Read, parse, and validate the config file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`parse`](Self::parse).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&yaml)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let mut users = HashMap::new();
        for entry in file.users {
            if entry.name.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "user with empty name".to_owned(),
                });
            }
            if !entry.password.starts_with("$2") {
                return Err(ConfigError::Invalid {
                    reason: format!("user '{}': password is not a bcrypt hash", entry.name),
                });
            }
            let rules = convert_rules(&entry.name, entry.permissions)?;
            let previous = users.insert(
                entry.name.clone(),
                User {
                    name: entry.name.clone(),
                    password_hash: entry.password,
                    admin: entry.admin,
                    rules,
                },
            );
            if previous.is_some() {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate user '{}'", entry.name),
                });
            }
        }

        let mut tokens: Vec<ApiToken> = Vec::new();
        for entry in file.tokens {
            if entry.token.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "token with empty value".to_owned(),
                });
            }
            if tokens.iter().any(|t| t.token == entry.token) {
                return Err(ConfigError::Invalid {
                    reason: "duplicate token value".to_owned(),
                });
            }
            let rules = convert_rules(&entry.token, entry.permissions)?;
            tokens.push(ApiToken {
                token: entry.token,
                admin: entry.admin,
                rules,
            });
        }

        Ok(Self { users, tokens })
    }

    /// Look up a user by name.
    #[must_use]
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    /// Iterate all users.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Look up an API token by its presented value.
    ///
    /// The scan is constant-time per candidate and never short-circuits on
    /// a partial match, so response timing does not leak token bytes. The
    /// public entry is not matchable this way.
    #[must_use]
    pub fn token(&self, presented: &str) -> Option<&ApiToken> {
        let mut found = None;
        for candidate in &self.tokens {
            if candidate.token == PUBLIC_TOKEN {
                continue;
            }
            if candidate
                .token
                .as_bytes()
                .ct_eq(presented.as_bytes())
                .into()
            {
                found = Some(candidate);
            }
        }
        found
    }

    /// The public principal's token entry, if configured.
    #[must_use]
    pub fn public(&self) -> Option<&ApiToken> {
        self.tokens.iter().find(|t| t.token == PUBLIC_TOKEN)
    }

    /// Users whose sessions must be invalidated when `self` is replaced by
    /// `next`: removed users and users whose password hash changed.
    #[must_use]
    pub fn affected_users(&self, next: &Self) -> Vec<String> {
        let mut affected: Vec<String> = self
            .users
            .values()
            .filter(|old| {
                next.user(&old.name)
                    .is_none_or(|new| new.password_hash != old.password_hash)
            })
            .map(|u| u.name.clone())
            .collect();
        affected.sort();
        affected
    }
}

fn convert_rules(owner: &str, entries: Vec<RuleEntry>) -> Result<Vec<PermissionRule>, ConfigError> {
    entries
        .into_iter()
        .map(|entry| {
            validate_prefix(&entry.prefix).map_err(|reason| ConfigError::Invalid {
                reason: format!("principal '{owner}': {reason}"),
            })?;
            Ok(PermissionRule {
                prefix: entry.prefix,
                access: entry.access,
            })
        })
        .collect()
}

/// Check a prefix pattern against the grammar: exact literal, trailing
/// `/*`, or the lone `*`. No embedded wildcards.
fn validate_prefix(prefix: &str) -> Result<(), String> {
    if prefix.is_empty() {
        return Err("empty prefix (use '*' for universal access)".to_owned());
    }
    if prefix == "*" {
        return Ok(());
    }
    match prefix.strip_suffix("/*") {
        Some(literal) => {
            if literal.is_empty() || literal.contains('*') {
                Err(format!("invalid wildcard pattern '{prefix}'"))
            } else {
                Ok(())
            }
        }
        None => {
            if prefix.contains('*') {
                Err(format!(
                    "embedded wildcard in '{prefix}' (only a trailing '/*' is supported)"
                ))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Structurally valid bcrypt hash; these tests only parse, never verify.
    const TEST_HASH: &str = "$2b$04$yrnFbGS5Uw5rvBLdaW0Mn.Rpz5dPq3U0TowOsrkDzrLILzaRSgYd6";

    fn sample() -> String {
        format!(
            r#"
users:
  - name: alice
    password: "{TEST_HASH}"
    admin: true
  - name: bob
    password: "{TEST_HASH}"
    permissions:
      - {{ prefix: "app/*", access: rw }}
      - {{ prefix: "secrets/app/*", access: r }}
tokens:
  - token: ci-token
    permissions:
      - {{ prefix: "ci/*", access: rw }}
  - token: "*"
    permissions:
      - {{ prefix: "public/*", access: r }}
"#
        )
    }

    #[test]
    fn parses_users_and_tokens() {
        let snapshot = AuthSnapshot::parse(&sample()).unwrap();
        assert!(snapshot.user("alice").unwrap().admin);
        assert_eq!(snapshot.user("bob").unwrap().rules.len(), 2);
        assert!(snapshot.user("carol").is_none());
        assert_eq!(snapshot.token("ci-token").unwrap().rules.len(), 1);
        assert!(snapshot.public().is_some());
    }

    #[test]
    fn token_lookup_never_matches_public_entry() {
        let snapshot = AuthSnapshot::parse(&sample()).unwrap();
        assert!(snapshot.token("*").is_none());
        assert!(snapshot.token("unknown").is_none());
    }

    #[test]
    fn empty_document_yields_empty_snapshot() {
        let snapshot = AuthSnapshot::parse("users: []\ntokens: []\n").unwrap();
        assert!(snapshot.public().is_none());
        assert_eq!(snapshot.users().count(), 0);
    }

    #[test]
    fn rejects_duplicate_user() {
        let yaml = format!(
            "users:\n  - name: a\n    password: \"{TEST_HASH}\"\n  - name: a\n    password: \"{TEST_HASH}\"\n"
        );
        assert!(matches!(
            AuthSnapshot::parse(&yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_public_token() {
        let yaml = "tokens:\n  - token: \"*\"\n  - token: \"*\"\n";
        assert!(matches!(
            AuthSnapshot::parse(yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_non_bcrypt_password() {
        let yaml = "users:\n  - name: a\n    password: plaintext\n";
        assert!(matches!(
            AuthSnapshot::parse(yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_embedded_wildcards() {
        for bad in ["a*b", "*/x", "a/*/b", "a/**", ""] {
            assert!(validate_prefix(bad).is_err(), "accepted {bad:?}");
        }
        for good in ["*", "app/*", "app/cfg", "secrets/*", "a b/c"] {
            assert!(validate_prefix(good).is_ok(), "rejected {good:?}");
        }
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            AuthSnapshot::parse("users: {not: [a, list"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn affected_users_tracks_removals_and_hash_changes() {
        let old = AuthSnapshot::parse(&sample()).unwrap();

        let changed = format!(
            r#"
users:
  - name: alice
    password: "$2b$04$differenthashdifferenthashdifferenthashdifferenthash12"
  - name: bob
    password: "{TEST_HASH}"
    permissions:
      - {{ prefix: "everything/*", access: rw }}
tokens: []
"#
        );
        let new = AuthSnapshot::parse(&changed).unwrap();

        // alice's hash changed; bob only changed permissions (not affected).
        assert_eq!(old.affected_users(&new), vec!["alice"]);

        // Removing bob affects bob.
        let removed = format!("users:\n  - name: alice\n    password: \"{TEST_HASH}\"\n");
        let new = AuthSnapshot::parse(&removed).unwrap();
        assert_eq!(old.affected_users(&new), vec!["bob"]);
    }
}
