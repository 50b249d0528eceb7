//! Key normalization and the format hint.
//!
//! Keys are UTF-8 paths with `/` separators. Normalization strips the
//! surrounding slashes and collapses `%20` into a space; the result must be
//! non-empty and at most 4 KiB. The `secrets` classification is derived
//! from the normalized key's path segments and is never stored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KvError;

pub use stash_storage::is_secrets_key;

/// Maximum normalized key length in bytes.
pub const MAX_KEY_BYTES: usize = 4096;

/// Normalize a raw key: strip surrounding `/`, collapse `%20` into a space.
///
/// # Errors
///
/// Returns [`KvError::InvalidKey`] when the result is empty or longer than
/// [`MAX_KEY_BYTES`].
pub fn normalize_key(raw: &str) -> Result<String, KvError> {
    let key = raw.trim_matches('/').replace("%20", " ");
    if key.is_empty() {
        return Err(KvError::InvalidKey {
            reason: "key is empty after normalization".to_owned(),
        });
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(KvError::InvalidKey {
            reason: format!("key exceeds {MAX_KEY_BYTES} bytes"),
        });
    }
    Ok(key)
}

/// Value format hint. Purely informational: the storage engine never
/// validates the bytes against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Plain text (default).
    #[default]
    Text,
    /// JSON document.
    Json,
    /// YAML document.
    Yaml,
    /// XML document.
    Xml,
    /// TOML document.
    Toml,
    /// INI file.
    Ini,
    /// HCL document.
    Hcl,
    /// Shell snippet.
    Shell,
}

impl Format {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Xml => "xml",
            Self::Toml => "toml",
            Self::Ini => "ini",
            Self::Hcl => "hcl",
            Self::Shell => "shell",
        }
    }

    /// MIME type used for `Content-Type` on raw value responses.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::Yaml => "application/yaml",
            Self::Text | Self::Toml | Self::Ini | Self::Hcl | Self::Shell => {
                "text/plain; charset=utf-8"
            }
        }
    }
}

impl FromStr for Format {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            "xml" => Ok(Self::Xml),
            "toml" => Ok(Self::Toml),
            "ini" => Ok(Self::Ini),
            "hcl" => Ok(Self::Hcl),
            "shell" => Ok(Self::Shell),
            other => Err(UnknownFormat {
                value: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A format string that is not one of the known hints.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown format: {value}")]
pub struct UnknownFormat {
    /// The rejected value.
    pub value: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_surrounding_slashes() {
        assert_eq!(normalize_key("/app/cfg/").unwrap(), "app/cfg");
        assert_eq!(normalize_key("///a///").unwrap(), "a");
        assert_eq!(normalize_key("a/b/c").unwrap(), "a/b/c");
    }

    #[test]
    fn normalize_collapses_percent_twenty() {
        assert_eq!(normalize_key("my%20key").unwrap(), "my key");
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(matches!(
            normalize_key("///"),
            Err(KvError::InvalidKey { .. })
        ));
        assert!(matches!(normalize_key(""), Err(KvError::InvalidKey { .. })));
    }

    #[test]
    fn normalize_rejects_oversized() {
        let long = "a".repeat(MAX_KEY_BYTES + 1);
        assert!(matches!(
            normalize_key(&long),
            Err(KvError::InvalidKey { .. })
        ));
    }

    #[test]
    fn format_roundtrip() {
        for name in ["text", "json", "yaml", "xml", "toml", "ini", "hcl", "shell"] {
            assert_eq!(Format::from_str(name).unwrap().as_str(), name);
        }
        assert!(Format::from_str("csv").is_err());
    }

    #[test]
    fn secret_classification_follows_segments() {
        assert!(is_secrets_key(&normalize_key("/secrets/db/").unwrap()));
        assert!(!is_secrets_key(&normalize_key("supersecrets/db").unwrap()));
    }
}
