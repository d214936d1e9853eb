//! Container types and configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new port mapping.
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// A named engine volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Subdirectory of the volume to mount instead of its root.
    pub subpath: Option<String>,
}

impl VolumeMount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            subpath: None,
        }
    }

    pub fn subpath(mut self, subpath: impl Into<String>) -> Self {
        self.subpath = Some(subpath.into());
        self
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerConfig {
    /// Container name (optional for transient helpers).
    pub name: Option<String>,
    /// Container hostname.
    pub hostname: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Bind mounts (host_path -> container_path).
    pub binds: Vec<(String, String)>,
    /// Named volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Network to attach the container to.
    pub network: Option<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Arguments are passed to the engine CLI verbatim, so everything is checked
    /// before any command is spawned.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }

        for (host_path, container_path) in &self.binds {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
        }

        for mount in &self.volumes {
            validate_container_name(&mount.source)?;
            validate_container_path(&mount.target)?;
            if let Some(ref subpath) = mount.subpath {
                validate_volume_path(subpath, "volume")?;
                if subpath.starts_with('/') || subpath.split('/').any(|part| part == "..") {
                    return Err(ContainerError::InvalidInput(format!(
                        "volume subpath '{}' must be relative and stay inside the volume",
                        subpath
                    )));
                }
            }
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the container hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a bind mount.
    pub fn bind(mut self, host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.binds.push((host_path.into(), container_path.into()));
        self
    }

    /// Add a named volume mount.
    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Attach to a network.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Container state as reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container exists but was never started.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container is being removed.
    Removing,
    /// Container has exited.
    Exited,
    /// Container is dead.
    Dead,
    /// Unknown state.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the `{{.State.Status}}` string of `inspect`.
    pub fn parse(value: &str) -> Self {
        match value.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" | "stopped" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Inspected status of an existing container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    /// First IP address on any attached network.
    pub ip: Option<String>,
}

impl ContainerStatus {
    pub fn running(ip: impl Into<String>) -> Self {
        Self {
            state: ContainerState::Running,
            ip: Some(ip.into()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

// ============================================================================
// Argument checks
// ============================================================================
//
// Every value below ends up as a CLI argument of the engine binary.

/// Characters that would split a `--mount`/`-v` spec or reach a shell.
const MOUNT_SPEC_RESERVED: &[char] = &[
    '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
    '\'', '\n', '\r', ',', ':', '\0',
];

fn invalid(message: impl Into<String>) -> ContainerError {
    ContainerError::InvalidInput(message.into())
}

fn check_length(what: &str, value: &str, max: usize) -> ContainerResult<()> {
    if value.is_empty() {
        return Err(invalid(format!("{what} cannot be empty")));
    }
    if value.len() > max {
        return Err(invalid(format!("{what} exceeds {max} characters")));
    }
    Ok(())
}

/// Image references: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    check_length("image name", image, 256)?;
    let allowed = |c: char| c.is_ascii_alphanumeric() || ".-_/:@".contains(c);
    if !image.chars().all(allowed) || image.contains("..") {
        return Err(invalid(format!("'{image}' is not a valid image reference")));
    }
    Ok(())
}

/// Container, volume and network names.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    check_length("object name", name, 128)?;
    let leading_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let allowed = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !leading_ok || !name.chars().all(allowed) {
        return Err(invalid(format!(
            "'{name}' is not a valid engine object name (alphanumerics, '-' and '_', not starting with '-')"
        )));
    }
    Ok(())
}

/// RFC 1123 hostnames.
fn validate_hostname(hostname: &str) -> ContainerResult<()> {
    check_length("hostname", hostname, 253)?;
    let label_ok = |label: &str| {
        label.len() <= 63
            && label.starts_with(|c: char| c.is_ascii_alphanumeric())
            && label.ends_with(|c: char| c.is_ascii_alphanumeric())
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if !hostname.split('.').all(label_ok) {
        return Err(invalid(format!("'{hostname}' is not a valid hostname")));
    }
    Ok(())
}

/// One side of a bind mount or a volume subpath.
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    check_length(&format!("{side} mount path"), path, 4096)?;
    if let Some(c) = path.chars().find(|c| MOUNT_SPEC_RESERVED.contains(c)) {
        return Err(invalid(format!("{side} mount path '{path}' contains {c:?}")));
    }
    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    check_length("container path", path, 4096)?;
    if !path.starts_with('/') || path.contains('\0') {
        return Err(invalid(format!("container path '{path}' must be absolute")));
    }
    Ok(())
}
