//! Platdev orchestration library
//!
//! Runs a multi-service cloud project (apps, workers, backing services and a router)
//! on a single host by driving Docker or Podman.

pub mod address;
pub mod container;
pub mod definition;
pub mod error;
pub mod lifecycle;
pub mod mounts;
pub mod project;
pub mod relationships;
pub mod reporter;
pub mod resolver;
pub mod settings;
pub mod slot;

pub use error::{BatchReport, PlatformError, PlatformResult};
pub use project::{Orchestrator, Project};
pub use reporter::Reporter;
pub use settings::OrchestratorSettings;
