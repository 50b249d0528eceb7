//! Prefix-ACL evaluation.
//!
//! A principal's rules map key-prefix patterns to an access mode. The
//! pattern grammar is deliberately small: an exact literal, a literal with
//! a trailing `/*` matching any suffix, or the universal `*`. No embedded
//! wildcards.
//!
//! Resolution is longest-prefix-wins: among the rules matching a key, the
//! one with the longest literal prefix decides, ties broken by lexicographic
//! pattern order. The single exception is the secrets gate — for a key on a
//! secrets path, rules whose own prefix does not contain `secrets` as a
//! path segment are discarded *before* selection, so the universal `*`
//! never grants secrets access.

use serde::{Deserialize, Serialize};
use stash_storage::is_secrets_key;

/// Access mode granted by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Read only.
    #[serde(rename = "r")]
    Read,
    /// Write only.
    #[serde(rename = "w")]
    Write,
    /// Read and write.
    #[serde(rename = "rw")]
    ReadWrite,
}

/// The operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    /// Read a value, its metadata, or its history.
    Read,
    /// Create, update, or delete.
    Write,
}

/// A single prefix → access rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    /// Pattern: exact literal, trailing `/*`, or `*`.
    pub prefix: String,
    /// Granted access mode.
    pub access: Access,
}

impl PermissionRule {
    /// Whether the pattern matches the normalized key.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        if self.prefix == "*" {
            return true;
        }
        match self.prefix.strip_suffix('*') {
            // "app/*" keeps the trailing slash in the literal part.
            Some(literal) => key.starts_with(literal),
            None => self.prefix == key,
        }
    }

    /// The literal part of the pattern, used for longest-prefix selection.
    #[must_use]
    pub fn literal_prefix(&self) -> &str {
        if self.prefix == "*" {
            ""
        } else {
            self.prefix.strip_suffix('*').unwrap_or(&self.prefix)
        }
    }

    /// Whether the granted mode covers the operation.
    #[must_use]
    pub fn allows(&self, op: AccessOp) -> bool {
        match op {
            AccessOp::Read => matches!(self.access, Access::Read | Access::ReadWrite),
            AccessOp::Write => matches!(self.access, Access::Write | Access::ReadWrite),
        }
    }

    /// Whether the rule's own prefix reaches into secrets territory.
    ///
    /// Required for a rule to participate in decisions on secrets paths.
    #[must_use]
    pub fn grants_secrets(&self) -> bool {
        let literal = self.literal_prefix().trim_end_matches('/');
        !literal.is_empty() && is_secrets_key(literal)
    }
}

/// Decide `(key, op)` against a rule set. Returns `true` iff access is
/// granted.
#[must_use]
pub fn check(rules: &[PermissionRule], key: &str, op: AccessOp) -> bool {
    let secret = is_secrets_key(key);
    let mut matching: Vec<&PermissionRule> = rules
        .iter()
        .filter(|rule| !secret || rule.grants_secrets())
        .filter(|rule| rule.matches(key))
        .collect();

    matching.sort_by(|a, b| {
        b.literal_prefix()
            .len()
            .cmp(&a.literal_prefix().len())
            .then_with(|| a.prefix.cmp(&b.prefix))
    });

    matching.first().is_some_and(|rule| rule.allows(op))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str, access: Access) -> PermissionRule {
        PermissionRule {
            prefix: prefix.to_owned(),
            access,
        }
    }

    #[test]
    fn universal_rule_matches_everything_plain() {
        let rules = [rule("*", Access::ReadWrite)];
        assert!(check(&rules, "app/cfg", AccessOp::Read));
        assert!(check(&rules, "anything", AccessOp::Write));
    }

    #[test]
    fn universal_rule_never_grants_secrets() {
        let rules = [rule("*", Access::ReadWrite)];
        assert!(!check(&rules, "secrets/db/pwd", AccessOp::Read));
        assert!(!check(&rules, "secrets/db/pwd", AccessOp::Write));
        assert!(!check(&rules, "secrets", AccessOp::Read));
    }

    #[test]
    fn secrets_need_a_secrets_scoped_rule() {
        let rules = [
            rule("*", Access::ReadWrite),
            rule("secrets/*", Access::Read),
        ];
        assert!(check(&rules, "secrets/db/pwd", AccessOp::Read));
        // The secrets rule is read-only; the universal rw rule is gated out.
        assert!(!check(&rules, "secrets/db/pwd", AccessOp::Write));
    }

    #[test]
    fn nested_secrets_segment_counts() {
        let rules = [rule("app/secrets/*", Access::ReadWrite)];
        assert!(check(&rules, "app/secrets/token", AccessOp::Write));
        // A non-secrets rule over the same tree does not reach secrets keys.
        let outside = [rule("app/*", Access::ReadWrite)];
        assert!(!check(&outside, "app/secrets/token", AccessOp::Read));
    }

    #[test]
    fn longest_prefix_wins() {
        let rules = [
            rule("app/*", Access::ReadWrite),
            rule("app/locked/*", Access::Read),
        ];
        assert!(check(&rules, "app/free/x", AccessOp::Write));
        assert!(check(&rules, "app/locked/x", AccessOp::Read));
        // The longer, read-only rule decides — the shorter rw rule loses.
        assert!(!check(&rules, "app/locked/x", AccessOp::Write));
    }

    #[test]
    fn exact_rule_beats_wildcard_of_same_tree() {
        let rules = [
            rule("app/*", Access::Read),
            rule("app/deploy-key", Access::ReadWrite),
        ];
        assert!(check(&rules, "app/deploy-key", AccessOp::Write));
        assert!(!check(&rules, "app/other", AccessOp::Write));
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let forward = [
            rule("app/*", Access::ReadWrite),
            rule("app/locked/*", Access::Read),
        ];
        let reversed = [
            rule("app/locked/*", Access::Read),
            rule("app/*", Access::ReadWrite),
        ];
        for rules in [&forward, &reversed] {
            assert!(!check(rules.as_slice(), "app/locked/x", AccessOp::Write));
            assert!(check(rules.as_slice(), "app/free/x", AccessOp::Write));
        }
    }

    #[test]
    fn wildcard_does_not_match_bare_parent() {
        let rules = [rule("app/*", Access::ReadWrite)];
        assert!(!check(&rules, "app", AccessOp::Read));
        assert!(check(&rules, "app/x", AccessOp::Read));
    }

    #[test]
    fn no_matching_rule_denies() {
        let rules = [rule("app/*", Access::ReadWrite)];
        assert!(!check(&rules, "other/x", AccessOp::Read));
        assert!(!check(&[], "anything", AccessOp::Read));
    }

    #[test]
    fn read_and_write_modes_are_disjoint() {
        assert!(check(&[rule("k", Access::Read)], "k", AccessOp::Read));
        assert!(!check(&[rule("k", Access::Read)], "k", AccessOp::Write));
        assert!(check(&[rule("k", Access::Write)], "k", AccessOp::Write));
        assert!(!check(&[rule("k", Access::Write)], "k", AccessOp::Read));
    }
}
