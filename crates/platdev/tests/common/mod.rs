//! Test utilities: an in-memory container engine and project fixtures.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use platdev::container::{
    ContainerConfig, ContainerDriver, ContainerError, ContainerResult, ContainerState,
    ContainerStatus,
};
use platdev::definition::DefinitionFile;
use platdev::project::ProjectState;
use platdev::{Orchestrator, OrchestratorSettings, Project, Reporter};
use platdev_protocol::{BUILD_COMMAND, BUILD_LOG_PATH, OPEN_COMMAND, READY_MARKER, SHUTDOWN_COMMAND};

pub const PROJECT_ID: &str = "k3j9x2";

/// One command run through [`ContainerDriver::run_command`].
#[derive(Debug, Clone)]
pub struct Exec {
    pub container: String,
    pub user: Option<String>,
    pub command: Vec<String>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub config: ContainerConfig,
    pub status: ContainerStatus,
}

#[derive(Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    files: BTreeMap<(String, String), Vec<u8>>,
    volumes: BTreeSet<String>,
    images: BTreeSet<String>,
    networks: BTreeSet<String>,
    execs: Vec<Exec>,
    transients: Vec<ContainerConfig>,
    stops: Vec<(String, Option<u32>)>,
    creates: usize,
    starts: usize,
    removes: usize,
    pulls: Vec<String>,
    next_ip: u8,

    // Behaviour knobs.
    open_outputs: BTreeMap<String, String>,
    missing_images: BTreeSet<String>,
    stalled_shutdowns: BTreeSet<String>,
    stalled_readiness: BTreeSet<String>,
    failing_builds: BTreeMap<String, String>,
    racing_creates: BTreeSet<String>,
}

/// In-memory stand-in for Docker or Podman.
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

enum ExecOutcome {
    Done(ContainerResult<String>),
    Stall,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Last stdout line the open entrypoint of `container` prints.
    pub fn set_open_output(&self, container: &str, output: &str) {
        self.lock().open_outputs.insert(container.to_string(), output.to_string());
    }

    /// Make pulls of `image` fail as if the registry did not know it.
    pub fn mark_missing(&self, image: &str) {
        self.lock().missing_images.insert(image.to_string());
    }

    /// Make the in-container shutdown of `container` hang forever.
    pub fn stall_shutdown(&self, container: &str) {
        self.lock().stalled_shutdowns.insert(container.to_string());
    }

    /// Make `container` never report it has booted.
    pub fn stall_readiness(&self, container: &str) {
        self.lock().stalled_readiness.insert(container.to_string());
    }

    /// Make the build entrypoint of `container` fail, leaving `log` behind.
    pub fn fail_build(&self, container: &str, log: &str) {
        self.lock().failing_builds.insert(container.to_string(), log.to_string());
    }

    /// Make the next create of `container` lose a race against another
    /// process that creates it first.
    pub fn race_create(&self, container: &str) {
        self.lock().racing_creates.insert(container.to_string());
    }

    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    pub fn add_volume(&self, name: &str) {
        self.lock().volumes.insert(name.to_string());
    }

    pub fn add_container(&self, name: &str, image: &str, state: ContainerState) {
        self.lock().containers.insert(
            name.to_string(),
            FakeContainer {
                config: ContainerConfig::new(image).name(name),
                status: ContainerStatus { state, ip: None },
            },
        );
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.lock().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.lock().volumes.iter().cloned().collect()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    pub fn execs(&self) -> Vec<Exec> {
        self.lock().execs.clone()
    }

    /// Execs of one entrypoint, in call order.
    pub fn execs_of(&self, entrypoint: &str) -> Vec<Exec> {
        self.execs()
            .into_iter()
            .filter(|exec| exec.command.first().is_some_and(|c| c == entrypoint))
            .collect()
    }

    pub fn transients(&self) -> Vec<ContainerConfig> {
        self.lock().transients.clone()
    }

    pub fn stops(&self) -> Vec<(String, Option<u32>)> {
        self.lock().stops.clone()
    }

    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    pub fn removes(&self) -> usize {
        self.lock().removes
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn exec(&self, name: &str, user: Option<&str>, command: &[&str], stdin: Option<&[u8]>) -> ExecOutcome {
        let mut state = self.lock();
        match state.containers.get(name) {
            None => return ExecOutcome::Done(Err(ContainerError::ContainerNotFound(name.to_string()))),
            Some(c) if !c.status.is_running() => {
                return ExecOutcome::Done(Err(ContainerError::NotRunning(name.to_string())));
            }
            Some(_) => {}
        }

        state.execs.push(Exec {
            container: name.to_string(),
            user: user.map(str::to_string),
            command: command.iter().map(|s| s.to_string()).collect(),
            stdin: stdin.map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        });

        let entrypoint = command.first().copied().unwrap_or_default();
        let readiness = command.get(2).is_some_and(|script| script.contains(READY_MARKER));

        if readiness && state.stalled_readiness.contains(name) {
            return ExecOutcome::Stall;
        }
        match entrypoint {
            OPEN_COMMAND => {
                let output = state
                    .open_outputs
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| "{}".to_string());
                ExecOutcome::Done(Ok(format!("starting services\n{output}\n")))
            }
            SHUTDOWN_COMMAND if state.stalled_shutdowns.contains(name) => ExecOutcome::Stall,
            BUILD_COMMAND => match state.failing_builds.get(name).cloned() {
                Some(log) => {
                    state
                        .files
                        .insert((name.to_string(), BUILD_LOG_PATH.to_string()), log.into_bytes());
                    ExecOutcome::Done(Err(ContainerError::CommandFailed {
                        command: "exec".to_string(),
                        message: "exit status 1".to_string(),
                    }))
                }
                None => ExecOutcome::Done(Ok(String::new())),
            },
            _ => ExecOutcome::Done(Ok(String::new())),
        }
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut state = self.lock();
        let name = config.name.clone().unwrap_or_default();
        if state.racing_creates.remove(&name) {
            state.containers.insert(
                name.clone(),
                FakeContainer {
                    config: config.clone(),
                    status: ContainerStatus {
                        state: ContainerState::Created,
                        ip: None,
                    },
                },
            );
        }
        if state.containers.contains_key(&name) {
            return Err(ContainerError::NameInUse(name));
        }
        if !state.images.contains(&config.image) {
            return Err(ContainerError::ImageNotFound(config.image.clone()));
        }
        state.creates += 1;
        state.containers.insert(
            name.clone(),
            FakeContainer {
                config: config.clone(),
                status: ContainerStatus {
                    state: ContainerState::Created,
                    ip: None,
                },
            },
        );
        Ok(format!("id-{name}"))
    }

    async fn start_container(&self, name: &str) -> ContainerResult<()> {
        let mut state = self.lock();
        state.next_ip += 1;
        let ip = format!("10.89.0.{}", state.next_ip);
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| ContainerError::ContainerNotFound(name.to_string()))?;
        container.status = ContainerStatus::running(ip);
        state.starts += 1;
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout_seconds: Option<u32>) -> ContainerResult<()> {
        let mut state = self.lock();
        state.stops.push((name.to_string(), timeout_seconds));
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| ContainerError::ContainerNotFound(name.to_string()))?;
        container.status = ContainerStatus {
            state: ContainerState::Exited,
            ip: None,
        };
        Ok(())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.lock();
        if state.containers.remove(name).is_none() {
            return Err(ContainerError::ContainerNotFound(name.to_string()));
        }
        state.files.retain(|(container, _), _| container != name);
        state.removes += 1;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> ContainerResult<Option<ContainerStatus>> {
        Ok(self.lock().containers.get(name).map(|c| c.status.clone()))
    }

    async fn list_containers(&self, prefix: &str) -> ContainerResult<Vec<String>> {
        Ok(self
            .lock()
            .containers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn run_command(
        &self,
        name: &str,
        user: Option<&str>,
        command: &[&str],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<String> {
        match self.exec(name, user, command, stdin) {
            ExecOutcome::Done(result) => result,
            ExecOutcome::Stall => {
                std::future::pending::<()>().await;
                Ok(String::new())
            }
        }
    }

    async fn shell(&self, name: &str, _user: Option<&str>, _command: &[&str]) -> ContainerResult<i32> {
        match self.lock().containers.get(name) {
            Some(c) if c.status.is_running() => Ok(0),
            Some(_) => Err(ContainerError::NotRunning(name.to_string())),
            None => Err(ContainerError::ContainerNotFound(name.to_string())),
        }
    }

    async fn upload(&self, name: &str, path: &str, contents: &[u8]) -> ContainerResult<()> {
        let mut state = self.lock();
        if !state.containers.contains_key(name) {
            return Err(ContainerError::ContainerNotFound(name.to_string()));
        }
        state
            .files
            .insert((name.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn download(&self, name: &str, path: &str) -> ContainerResult<Vec<u8>> {
        self.file(name, path)
            .ok_or_else(|| ContainerError::ContainerNotFound(format!("{name}:{path}")))
    }

    async fn logs(&self, name: &str, _tail: Option<u32>) -> ContainerResult<String> {
        if self.lock().containers.contains_key(name) {
            Ok(format!("booted {name}\n"))
        } else {
            Err(ContainerError::ContainerNotFound(name.to_string()))
        }
    }

    async fn commit(&self, name: &str, image: &str) -> ContainerResult<()> {
        let mut state = self.lock();
        if !state.containers.contains_key(name) {
            return Err(ContainerError::ContainerNotFound(name.to_string()));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn delete_image(&self, image: &str) -> ContainerResult<()> {
        if self.lock().images.remove(image) {
            Ok(())
        } else {
            Err(ContainerError::ImageNotFound(image.to_string()))
        }
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        let mut state = self.lock();
        state.pulls.push(image.to_string());
        if state.missing_images.contains(image) {
            return Err(ContainerError::ImageNotFound(image.to_string()));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn run_transient(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut state = self.lock();
        for volume in &config.volumes {
            if !state.volumes.contains(&volume.source) {
                return Err(ContainerError::VolumeNotFound(volume.source.clone()));
            }
        }
        state.transients.push(config.clone());
        Ok(String::new())
    }

    async fn list_volumes(&self, prefix: &str) -> ContainerResult<Vec<String>> {
        Ok(self
            .lock()
            .volumes
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn create_volume(&self, name: &str) -> ContainerResult<()> {
        self.lock().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        if self.lock().volumes.remove(name) {
            Ok(())
        } else {
            Err(ContainerError::VolumeNotFound(name.to_string()))
        }
    }

    async fn create_network(&self, name: &str) -> ContainerResult<()> {
        if self.lock().networks.insert(name.to_string()) {
            Ok(())
        } else {
            Err(ContainerError::NameInUse(name.to_string()))
        }
    }

    async fn remove_network(&self, name: &str) -> ContainerResult<()> {
        self.lock().networks.remove(name);
        Ok(())
    }
}

/// Collects everything reported.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    steps: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn step(&self, message: &str) {
        self.steps.lock().unwrap().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }
}

/// Settings with short timeouts and no router.
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        stop_timeout: Duration::from_millis(200),
        parallelism: 4,
        router_enabled: false,
        ..Default::default()
    }
}

pub fn orchestrator(driver: &Arc<FakeDriver>, settings: OrchestratorSettings) -> Orchestrator {
    let driver: Arc<dyn ContainerDriver> = driver.clone();
    Orchestrator::new(driver, settings)
}

/// A project with id [`PROJECT_ID`] rooted at `dir`.
pub fn project(dir: &Path, definitions: &str) -> Project {
    let (definitions, routes) = DefinitionFile::parse(definitions).unwrap().into_parts();
    let state = ProjectState {
        id: PROJECT_ID.to_string(),
        ..ProjectState::generate()
    };
    Project::new(dir, state, definitions, routes)
}

/// Container name of `name` with kind code `code` in the test project.
pub fn container(name: &str, code: &str) -> String {
    format!("platdev-{PROJECT_ID}-{name}-{code}")
}
