//! Tunables of the orchestration layer.

use std::time::Duration;

use crate::definition::Definition;
use crate::mounts::MountStrategy;
use crate::resolver::ResolveStrategy;

/// Settings shared by every orchestration operation.
///
/// The CLI fills this from its configuration file; tests construct it directly.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// How long a container may take to shut down gracefully before it is forced.
    pub stop_timeout: Duration,
    /// Host-side bound on the readiness wait during open. `None` waits forever.
    pub open_timeout: Option<Duration>,
    /// Concurrency of pulls, stops and volume deletions.
    pub parallelism: usize,
    /// Registry prefix definition types are mapped into.
    pub registry: String,
    /// Image used for throwaway helper containers (mount preparation, slot copies).
    pub helper_image: String,
    pub router_image: String,
    pub router_enabled: bool,
    /// Host port the router publishes its HTTP listener on.
    pub router_port: Option<u16>,
    pub resolve_strategy: ResolveStrategy,
    pub mount_strategy: MountStrategy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            open_timeout: None,
            parallelism: 4,
            registry: "docker.io/platdev".to_string(),
            helper_image: "docker.io/library/busybox:latest".to_string(),
            router_image: "docker.io/platdev/router:latest".to_string(),
            router_enabled: true,
            router_port: Some(8080),
            resolve_strategy: ResolveStrategy::default(),
            mount_strategy: MountStrategy::default(),
        }
    }
}

impl OrchestratorSettings {
    /// Image a definition runs from: `{registry}/{engine}:{version}`.
    pub fn image_for(&self, definition: &Definition) -> String {
        format!(
            "{}/{}:{}",
            self.registry.trim_end_matches('/'),
            definition.engine(),
            definition.version()
        )
    }

    /// Parallelism clamped to at least one worker.
    pub fn workers(&self) -> usize {
        self.parallelism.max(1)
    }
}
