//! Container engine driver.
//!
//! The orchestrator only talks to the engine through [`ContainerDriver`]. The
//! bundled implementation, [`ContainerRuntime`], shells out to the Docker or Podman
//! CLI; the engine is auto-detected or can be configured explicitly.

mod config;
mod error;

pub use config::{
    ContainerConfig, ContainerState, ContainerStatus, PortMapping, VolumeMount,
    validate_container_name, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }

    /// `--mount` option naming the volume subdirectory to mount.
    pub fn subpath_option(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "volume-subpath",
            RuntimeType::Podman => "subpath",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Capability the orchestrator needs from a container engine.
///
/// Implementations must be safe to call concurrently; the orchestrator fans out
/// deletions and pulls over a shared `Arc<dyn ContainerDriver>`.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create (but do not start) a container. Returns the engine's container ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, name: &str) -> ContainerResult<()>;
    async fn stop_container(&self, name: &str, timeout_seconds: Option<u32>) -> ContainerResult<()>;
    async fn remove_container(&self, name: &str, force: bool) -> ContainerResult<()>;

    /// Inspect a container. `Ok(None)` when it does not exist.
    async fn container_status(&self, name: &str) -> ContainerResult<Option<ContainerStatus>>;

    /// Names of all containers (running or not) starting with `prefix`.
    async fn list_containers(&self, prefix: &str) -> ContainerResult<Vec<String>>;

    /// Run a command in a running container, optionally feeding `stdin`, and
    /// return its stdout.
    async fn run_command(
        &self,
        name: &str,
        user: Option<&str>,
        command: &[&str],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<String>;

    /// Attach an interactive terminal command. Returns the exit code.
    async fn shell(&self, name: &str, user: Option<&str>, command: &[&str]) -> ContainerResult<i32>;

    /// Write a file into a container (created or running).
    async fn upload(&self, name: &str, path: &str, contents: &[u8]) -> ContainerResult<()>;

    /// Read a file out of a container.
    async fn download(&self, name: &str, path: &str) -> ContainerResult<Vec<u8>>;

    async fn logs(&self, name: &str, tail: Option<u32>) -> ContainerResult<String>;

    /// Snapshot a container's filesystem into `image`.
    async fn commit(&self, name: &str, image: &str) -> ContainerResult<()>;
    async fn delete_image(&self, image: &str) -> ContainerResult<()>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;

    /// Run a throwaway container to completion and return its stdout.
    async fn run_transient(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Names of all volumes starting with `prefix`.
    async fn list_volumes(&self, prefix: &str) -> ContainerResult<Vec<String>>;
    async fn create_volume(&self, name: &str) -> ContainerResult<()>;
    async fn remove_volume(&self, name: &str) -> ContainerResult<()>;

    async fn create_network(&self, name: &str) -> ContainerResult<()>;
    async fn remove_network(&self, name: &str) -> ContainerResult<()>;
}

/// Container runtime client backed by the Docker or Podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, then falls back to Podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else {
            // Fall back to docker, will fail at runtime
            Self::with_type(RuntimeType::Docker)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Spawn the engine CLI and collect its output.
    async fn output(
        &self,
        label: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<Output> {
        let spawn_failed = |e: std::io::Error| ContainerError::CommandFailed {
            command: label.to_string(),
            message: e.to_string(),
        };

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_failed)?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        child.wait_with_output().await.map_err(spawn_failed)
    }

    /// Run the engine CLI, returning stdout or a classified error.
    async fn checked(
        &self,
        label: &str,
        target: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<String> {
        let output = self.output(label, args, stdin).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::classify(label, target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Arguments shared by `create` and `run`, from the name flag to the command.
    fn container_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut owned_args: Vec<String> = Vec::new();

        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        if let Some(ref hostname) = config.hostname {
            owned_args.push("--hostname".to_string());
            owned_args.push(hostname.clone());
        }

        if let Some(ref network) = config.network {
            owned_args.push("--network".to_string());
            owned_args.push(network.clone());
        }

        for port in &config.ports {
            owned_args.push("-p".to_string());
            owned_args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        // Bind mounts - handle SELinux labels for Podman
        for (host, container) in &config.binds {
            owned_args.push("-v".to_string());
            if self.runtime_type.needs_selinux_labels() {
                owned_args.push(format!("{}:{}:Z", host, container));
            } else {
                owned_args.push(format!("{}:{}", host, container));
            }
        }

        for mount in &config.volumes {
            let mut spec = format!("type=volume,source={},target={}", mount.source, mount.target);
            if let Some(ref subpath) = mount.subpath {
                spec.push_str(&format!(",{}={}", self.runtime_type.subpath_option(), subpath));
            }
            owned_args.push("--mount".to_string());
            owned_args.push(spec);
        }

        for (key, value) in &config.labels {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = config.workdir {
            owned_args.push("-w".to_string());
            owned_args.push(workdir.clone());
        }

        owned_args.push(config.image.clone());
        owned_args.extend(config.command.iter().cloned());

        owned_args
    }

    fn exec_args(name: &str, user: Option<&str>, interactive: bool, tty: bool) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        if tty {
            args.push("-t".to_string());
        }
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        args.push(name.to_string());
        args
    }
}

fn lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout.lines().map(str::trim).filter(|line| !line.is_empty())
}

#[async_trait]
impl ContainerDriver for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        // Missing images must surface as ImageNotFound instead of an implicit pull.
        let mut args = vec!["create".to_string(), "--pull=never".to_string()];
        args.extend(self.container_args(config));

        let target = config.name.clone().unwrap_or_default();
        match self.checked("create", &target, &args, None).await {
            Ok(stdout) => Ok(stdout.trim().to_string()),
            Err(ContainerError::ImageNotFound(_)) => {
                Err(ContainerError::ImageNotFound(config.image.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn start_container(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.checked("start", name, &["start".to_string(), name.to_string()], None)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout_seconds: Option<u32>) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(name.to_string());

        self.checked("stop", name, &args, None).await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());

        self.checked("rm", name, &args, None).await?;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> ContainerResult<Option<ContainerStatus>> {
        validate_container_name(name)?;

        let args = [
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.State.Status}}|{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}"
                .to_string(),
            name.to_string(),
        ];
        let output = self.output("inspect", &args, None).await?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as absent.
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (state, ips) = line.split_once('|').unwrap_or((line, ""));
        let ip = ips
            .split_whitespace()
            .find(|ip| !ip.is_empty())
            .map(str::to_string);

        Ok(Some(ContainerStatus {
            state: ContainerState::parse(state),
            ip,
        }))
    }

    async fn list_containers(&self, prefix: &str) -> ContainerResult<Vec<String>> {
        let args = [
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name={prefix}"),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let stdout = self.checked("ps", prefix, &args, None).await?;

        // The name filter is a substring match; keep only true prefixes.
        Ok(lines(&stdout)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn run_command(
        &self,
        name: &str,
        user: Option<&str>,
        command: &[&str],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<String> {
        validate_container_name(name)?;

        let mut args = Self::exec_args(name, user, stdin.is_some(), false);
        args.extend(command.iter().map(|part| part.to_string()));

        self.checked("exec", name, &args, stdin).await
    }

    async fn shell(&self, name: &str, user: Option<&str>, command: &[&str]) -> ContainerResult<i32> {
        validate_container_name(name)?;

        let mut args = Self::exec_args(name, user, true, true);
        args.extend(command.iter().map(|part| part.to_string()));

        let status = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: e.to_string(),
            })?;

        Ok(status.code().unwrap_or(-1))
    }

    async fn upload(&self, name: &str, path: &str, contents: &[u8]) -> ContainerResult<()> {
        validate_container_name(name)?;

        let staged = tempfile::NamedTempFile::new()?;
        tokio::fs::write(staged.path(), contents).await?;

        let args = [
            "cp".to_string(),
            staged.path().display().to_string(),
            format!("{name}:{path}"),
        ];
        self.checked("cp", name, &args, None).await?;
        Ok(())
    }

    async fn download(&self, name: &str, path: &str) -> ContainerResult<Vec<u8>> {
        validate_container_name(name)?;

        let staging = tempfile::tempdir()?;
        let local = staging.path().join("download");
        let args = [
            "cp".to_string(),
            format!("{name}:{path}"),
            local.display().to_string(),
        ];
        self.checked("cp", name, &args, None).await?;

        Ok(tokio::fs::read(&local).await?)
    }

    async fn logs(&self, name: &str, tail: Option<u32>) -> ContainerResult<String> {
        validate_container_name(name)?;

        let mut args = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(name.to_string());

        let output = self.output("logs", &args, None).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::classify("logs", name, &stderr));
        }

        // Logs command outputs to stderr for container stderr
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(format!("{}{}", stdout, stderr))
    }

    async fn commit(&self, name: &str, image: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        validate_image_name(image)?;

        let args = ["commit".to_string(), name.to_string(), image.to_string()];
        self.checked("commit", name, &args, None).await?;
        Ok(())
    }

    async fn delete_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;

        let args = ["rmi".to_string(), image.to_string()];
        self.checked("rmi", image, &args, None).await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        // `image inspect` works for both Docker and Podman.
        let args = ["image".to_string(), "inspect".to_string(), image.to_string()];
        let output = self.output("image inspect", &args, None).await?;

        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;

        let args = ["pull".to_string(), image.to_string()];
        self.checked("pull", image, &args, None).await?;
        Ok(())
    }

    async fn run_transient(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut args = vec!["run".to_string(), "--rm".to_string()];
        args.extend(self.container_args(config));

        self.checked("run", &config.image, &args, None).await
    }

    async fn list_volumes(&self, prefix: &str) -> ContainerResult<Vec<String>> {
        let args = [
            "volume".to_string(),
            "ls".to_string(),
            "--format".to_string(),
            "{{.Name}}".to_string(),
        ];
        let stdout = self.checked("volume ls", prefix, &args, None).await?;

        Ok(lines(&stdout)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn create_volume(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        let args = ["volume".to_string(), "create".to_string(), name.to_string()];
        self.checked("volume create", name, &args, None).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        let args = ["volume".to_string(), "rm".to_string(), name.to_string()];
        self.checked("volume rm", name, &args, None).await?;
        Ok(())
    }

    async fn create_network(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        let args = ["network".to_string(), "create".to_string(), name.to_string()];
        self.checked("network create", name, &args, None).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        let args = ["network".to_string(), "rm".to_string(), name.to_string()];
        self.checked("network rm", name, &args, None).await?;
        Ok(())
    }
}
