//! Storage error types.
//!
//! Every variant carries enough context to diagnose the problem without a
//! debugger. Values never appear in error messages — only keys and reasons.

/// Errors that can occur during storage operations.
///
/// All variants are plain data (`Clone`), which lets a single-flight cache
/// hand the same failure to every coalesced caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or migrate the database.
    #[error("failed to open store at '{url}': {reason}")]
    Open { url: String, reason: String },

    /// Failed to read a row.
    #[error("failed to read '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a row.
    #[error("failed to write '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete rows.
    #[error("failed to delete '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// Failed to run a listing or query.
    #[error("failed to list '{scope}': {reason}")]
    List { scope: String, reason: String },

    /// A stored row failed to decode (corrupt timestamp, bad column type).
    #[error("corrupt row for '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}
