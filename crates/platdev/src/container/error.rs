//! Container driver error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found locally or in the registry.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Volume was not found.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// A container, volume or network with this name already exists.
    #[error("name already in use: {0}")]
    NameInUse(String),

    /// The container is not running.
    #[error("container is not running: {0}")]
    NotRunning(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Races that leave the engine in the state the caller wanted anyway.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::NameInUse(_) | Self::NotRunning(_))
    }

    /// Whether the error means the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound(_) | Self::ImageNotFound(_) | Self::VolumeNotFound(_)
        )
    }

    /// Map engine stderr onto an error variant.
    ///
    /// Docker and Podman word these differently; both spellings are matched.
    pub fn classify(command: &str, target: &str, stderr: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();
        let target = target.to_string();

        if lower.contains("no such image")
            || lower.contains("unable to find image")
            || lower.contains("image not known")
            || lower.contains("manifest unknown")
            || lower.contains("pull access denied")
            || lower.contains("repository does not exist")
        {
            Self::ImageNotFound(target)
        } else if lower.contains("no such volume") || lower.contains("no volume with name") {
            Self::VolumeNotFound(target)
        } else if lower.contains("no such container") || lower.contains("no container with name") {
            Self::ContainerNotFound(target)
        } else if lower.contains("already in use")
            || lower.contains("already exists")
            || lower.contains("is in use")
        {
            Self::NameInUse(target)
        } else if lower.contains("is not running") || lower.contains("not running") {
            Self::NotRunning(target)
        } else {
            Self::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }
}
