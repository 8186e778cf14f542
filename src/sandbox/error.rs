//! Error types for the Docker execution sandbox.

use serde::{Deserialize, Serialize};

use crate::error::StagingError;

/// Errors that can occur in the sandbox system.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// The base image is missing locally and could not be pulled.
    #[error("Image {image} unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    /// The container could not be constructed (limits rejected, mount failure).
    #[error("Container setup failed: {reason}")]
    ContainerSetup { reason: String },

    /// The process could not be launched or awaited inside the container.
    #[error("Container runtime error: {reason}")]
    ContainerRuntime { reason: String },

    /// The project could not be staged into a workspace.
    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

impl SandboxError {
    /// Classify this error into the kind reported on an
    /// [`ExecutionResult`](super::ExecutionResult).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ImageUnavailable { .. } => ErrorKind::ImageUnavailable,
            Self::Staging(_) => ErrorKind::StagingError,
            Self::ContainerRuntime { .. } => ErrorKind::ContainerRuntimeError,
            Self::DockerNotAvailable { .. }
            | Self::ContainerSetup { .. }
            | Self::Docker(_)
            | Self::Config { .. } => ErrorKind::ContainerSetupError,
        }
    }
}

/// The failure category carried by a run that never produced an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ImageUnavailable,
    StagingError,
    ContainerSetupError,
    ContainerRuntimeError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImageUnavailable => write!(f, "ImageUnavailable"),
            Self::StagingError => write!(f, "StagingError"),
            Self::ContainerSetupError => write!(f, "ContainerSetupError"),
            Self::ContainerRuntimeError => write!(f, "ContainerRuntimeError"),
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
