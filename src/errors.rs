//! Error types for the relabel tool.
//!
//! Two tiers exist.  [`GuardError`] is fatal and is raised before any
//! object is touched.  Everything else is scoped to a single object and is
//! recorded as an [`ObjectFailure`] while the scan continues.

use std::fmt;

use thiserror::Error;

/// Reasons the Guard refuses a bucket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// Nothing was left after stripping the scheme and trailing separators.
    #[error("bucket name is empty")]
    Empty,

    /// The bucket is (or is prefixed by) the protected backup bucket.
    #[error("refusing to alter Thanos LTS backup bucket gs://{bucket}")]
    Protected { bucket: String },

    /// The bucket does not follow the `<org>-thanos-lts-<token>-<env>` naming.
    #[error("refusing to alter bucket {bucket}: does not match expected pattern {pattern}")]
    PatternMismatch { bucket: String, pattern: String },

    /// The derived environment is the value reserved for backup buckets.
    #[error("refusing to alter bucket gs://{bucket}: environment '{environment}' is reserved for backups")]
    ReservedEnvironment { bucket: String, environment: String },
}

/// Reasons a metadata document cannot be patched.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The bytes are not a JSON object.
    #[error("metadata document is not a valid JSON object: {0}")]
    Unparseable(#[source] serde_json::Error),

    /// A mapping expected on the `thanos.labels` path is absent or not a mapping.
    #[error("metadata document does not contain a '{path}' map")]
    MissingStructure { path: &'static str },

    /// Re-serialization failed.
    #[error("failed to serialize patched metadata document: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Returned by store backends (wrapped in `anyhow::Error`) when a read
/// targets an object that does not exist.
#[derive(Debug, Error)]
#[error("object not found: gs://{bucket}/{name}")]
pub struct ObjectNotFound {
    pub bucket: String,
    pub name: String,
}

/// Pipeline step at which a per-object failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Fetch,
    BackupOriginal,
    Patch,
    BackupPatched,
    Write,
    /// The worker running the object panicked or was cancelled; the step it
    /// reached is unknown.
    Aborted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::BackupOriginal => "backup-original",
            Phase::Patch => "patch",
            Phase::BackupPatched => "backup-patched",
            Phase::Write => "write",
            Phase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recoverable failure for one object.  Carries enough context to retry
/// by hand.
#[derive(Debug, Clone)]
pub struct ObjectFailure {
    /// Full object name within the bucket.
    pub name: String,
    /// Step that failed.
    pub phase: Phase,
    /// Rendered underlying cause (full `anyhow` chain).
    pub cause: String,
}

impl fmt::Display for ObjectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.name, self.phase, self.cause)
    }
}
