//! Error types for provisioning operations.

use std::path::PathBuf;

/// Error type for provisioning operations.
///
/// `ManifestUnchanged` is deliberately absent: an unchanged manifest is a
/// normal phase outcome (see [`crate::manifest::ManifestOutcome`]), not a
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The host could not be classified into a supported distro family.
    /// Fatal; no remediation is attempted.
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// A dependency install failed after the fallback chain was exhausted.
    /// The message names the exact manual command to run.
    #[error("Dependency install failed: {reason}. Run manually: {remediation}")]
    DependencyInstallFailure { reason: String, remediation: String },

    /// Every declared share failed validation.
    #[error("Mount validation failed: {0}")]
    MountFailure(String),

    /// The launched instance never reached a running state.
    #[error("Service health check failed for '{instance}': {reason}")]
    LaunchHealthCheckFailure { instance: String, reason: String },

    /// The credential file could not be written with owner-only
    /// permissions. Never downgraded to a warning.
    #[error("Cannot write credential file {path:?}: {reason}")]
    CredentialWritePermissionDenied { path: PathBuf, reason: String },

    /// Configuration error (missing file, invalid share declarations).
    #[error("Configuration error: {0}")]
    Config(String),

    /// External command failed to spawn or returned a non-zero exit.
    #[error("Command error: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
