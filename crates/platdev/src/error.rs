//! Orchestration errors and aggregate reports.

use std::fmt;

use platdev_protocol::ProtocolError;
use thiserror::Error;

use crate::container::ContainerError;

/// Result type for orchestration operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The operation does not fit the current state (commit of a stopped container,
    /// purge of the canonical slot, ...).
    #[error("{0}")]
    Precondition(String),

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The relationship graph cannot be ordered.
    #[error("cyclic relationship dependency between: {}", names.join(", "))]
    CyclicDependency { names: Vec<String> },

    #[error("malformed handshake output from {container}")]
    Protocol {
        container: String,
        #[source]
        source: ProtocolError,
    },

    /// Opaque engine failure.
    #[error("{context}")]
    Driver {
        context: String,
        #[source]
        source: ContainerError,
    },

    #[error("build of {name} failed")]
    BuildFailed { name: String, output: String },

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("{failed} of {total} operations failed: {summary}")]
    Batch {
        failed: usize,
        total: usize,
        summary: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PlatformError {
    /// Wrap a driver error with context. Missing images keep their own variant.
    pub fn driver(context: impl Into<String>, source: ContainerError) -> Self {
        match source {
            ContainerError::ImageNotFound(image) => Self::ImageNotFound(image),
            source => Self::Driver {
                context: context.into(),
                source,
            },
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Engine races that leave things in the wanted state.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Driver { source, .. } if source.is_benign_race())
    }
}

/// Outcome of a best-effort fan-out.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<String>,
    pub failures: Vec<(String, PlatformError)>,
}

impl BatchReport {
    pub fn record(&mut self, name: impl Into<String>, result: PlatformResult<()>) {
        let name = name.into();
        match result {
            Ok(()) => self.completed.push(name),
            Err(e) => self.failures.push((name, e)),
        }
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.completed.extend(other.completed);
        self.failures.extend(other.failures);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.failures.len()
    }

    /// Collapse into a single error when anything failed.
    pub fn into_result(self) -> PlatformResult<Vec<String>> {
        if self.failures.is_empty() {
            return Ok(self.completed);
        }
        Err(PlatformError::Batch {
            failed: self.failures.len(),
            total: self.total(),
            summary: self.to_string(),
        })
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, error) in &self.failures {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{name}: {error}")?;
            if let Some(source) = std::error::Error::source(error) {
                write!(f, " ({source})")?;
            }
        }
        Ok(())
    }
}
