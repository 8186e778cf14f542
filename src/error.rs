//! Error types for pybox.

use std::path::PathBuf;

use crate::sandbox::SandboxError;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dependency snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while reading a project's installed packages.
///
/// Callers on the run path degrade all of these to an empty package list.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No virtual environment found under {project}")]
    EnvironmentNotFound { project: PathBuf },

    #[error("Package manager not found in {env_dir}")]
    PackageManagerNotFound { env_dir: PathBuf },

    #[error("Package listing failed ({status}): {stderr}")]
    ListingFailed { status: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while copying a project into an ephemeral workspace.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Project directory {path} does not exist or is not a directory")]
    SourceMissing { path: PathBuf },

    #[error("Failed to create workspace at {path}: {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    #[error("Failed to copy {path}: {reason}")]
    CopyFailed { path: PathBuf, reason: String },

    #[error("Workspace for {project} has already been cleaned up")]
    Released { project: PathBuf },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
