//! Per-container lifecycle.
//!
//! ```text
//! Absent --start--> Created --> Running --open--> Opened --stop--> Stopped --purge--> Absent
//!                                           \--build (apps, flag)
//! ```
//!
//! Every operation goes through the [`ContainerDriver`] and reports progress to the
//! [`Reporter`] it is given. Handles are rebuilt on every run and never persisted.

mod stop;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use platdev_protocol::{
    BUILD_COMMAND, BUILD_LOG_PATH, BUILD_PAYLOAD_PATH, BuildPayload, DEPLOY_COMMAND,
    DESCRIPTOR_PATH, OPEN_COMMAND, OpenPayload, RelationshipRecord, RuntimeDescriptor,
    encode_open_payload, parse_open_output, readiness_script,
};
use serde::Serialize;

use crate::address::{NETWORK_NAME, ObjectAddress};
use crate::container::{
    ContainerConfig, ContainerDriver, ContainerError, ContainerState, ContainerStatus, VolumeMount,
};
use crate::definition::Definition;
use crate::error::{PlatformError, PlatformResult};
use crate::mounts::{APP_ROOT, DATA_ROOT, MountPlan, MountStrategy, RUNTIME_USER};
use crate::relationships::{RelationshipLedger, materialize};
use crate::reporter::Reporter;
use crate::settings::OrchestratorSettings;

/// Label carrying the project id on every managed container.
pub const PROJECT_LABEL: &str = "platdev.project";

/// Observable state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Absent,
    Created,
    Running,
    /// Running and opened by this process.
    Opened,
    Stopped,
}

impl LifecycleState {
    pub fn from_status(status: Option<&ContainerStatus>, opened: bool) -> Self {
        match status.map(|s| s.state) {
            None => Self::Absent,
            Some(ContainerState::Running) if opened => Self::Opened,
            Some(ContainerState::Running) => Self::Running,
            Some(ContainerState::Created) => Self::Created,
            Some(_) => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Absent => write!(f, "absent"),
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Opened => write!(f, "opened"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What [`Lifecycle::start`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Project-level inputs a handle is built from.
#[derive(Debug, Clone, Copy)]
pub struct HandleContext<'a> {
    pub project: &'a str,
    pub root: &'a Path,
    pub slot: u32,
    pub variables: &'a BTreeMap<String, String>,
    pub mount_strategy: MountStrategy,
}

/// Binding of a definition to its engine objects for one run.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub address: ObjectAddress,
    pub definition: Definition,
    pub image: String,
    /// Running from a committed snapshot.
    pub committed: bool,
    pub built: bool,
    pub opened: bool,
    pub mounts: MountPlan,
    pub config: ContainerConfig,
    pub descriptor: RuntimeDescriptor,
    /// Records resolved for the declared aliases during open.
    pub relationships: BTreeMap<String, Vec<RelationshipRecord>>,
    pub ip: Option<String>,
}

impl ContainerHandle {
    pub fn new(
        context: HandleContext<'_>,
        definition: &Definition,
        settings: &OrchestratorSettings,
    ) -> PlatformResult<Self> {
        let address =
            ObjectAddress::new(context.project, definition.kind(), definition.name()).with_slot(context.slot);
        if !address.is_valid() {
            return Err(PlatformError::Precondition(format!(
                "'{}' is not a valid object name (lowercase letters, digits, '-' and '_')",
                definition.name()
            )));
        }

        let mounts = MountPlan::new(&address, definition.mounts(), context.mount_strategy)?;
        let image = settings.image_for(definition);

        let mut config = ContainerConfig::new(&image)
            .name(address.container_name())
            .hostname(address.hostname())
            .network(NETWORK_NAME)
            .label(PROJECT_LABEL, context.project)
            .label("platdev.kind", definition.kind().to_string())
            .label("platdev.name", definition.name())
            .label("platdev.slot", context.slot.to_string());

        if definition.runs_source() {
            config = config
                .bind(context.root.display().to_string(), APP_ROOT)
                .workdir(APP_ROOT);
        } else {
            config = config.volume(VolumeMount::new(address.volume_name(), DATA_ROOT));
        }
        for mount in mounts.container_mounts() {
            config = config.volume(mount);
        }

        let mut variables = context.variables.clone();
        variables.extend(definition.variables().clone());

        let descriptor = RuntimeDescriptor {
            project: context.project.to_string(),
            name: definition.name().to_string(),
            kind: definition.kind().to_string(),
            runtime_type: definition.runtime_type().to_string(),
            slot: context.slot,
            disk: definition.disk(),
            user: RUNTIME_USER.to_string(),
            variables,
            relationships: definition
                .relationships()
                .iter()
                .map(|(alias, target)| (alias.clone(), target.to_string()))
                .collect(),
            mounts: mounts.descriptor_mounts(),
            configuration: match definition {
                Definition::Service(service) => service.configuration.clone(),
                _ => serde_json::Value::Null,
            },
        };

        Ok(Self {
            address,
            definition: definition.clone(),
            image,
            committed: false,
            built: false,
            opened: false,
            mounts,
            config,
            descriptor,
            relationships: BTreeMap::new(),
            ip: None,
        })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn container_name(&self) -> String {
        self.address.container_name()
    }

    /// Run from the committed snapshot instead of the definition's image.
    pub fn use_commit(&mut self) {
        self.image = self.address.commit_image();
        self.config.image = self.image.clone();
        self.committed = true;
        self.built = true;
    }

    /// Whether the container needs its data volume to exist before creation.
    pub fn needs_volume(&self) -> bool {
        !self.config.volumes.is_empty()
    }
}

/// Drives single containers through their lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    driver: Arc<dyn ContainerDriver>,
    settings: OrchestratorSettings,
}

impl Lifecycle {
    pub fn new(driver: Arc<dyn ContainerDriver>, settings: OrchestratorSettings) -> Self {
        Self { driver, settings }
    }

    pub fn driver(&self) -> &dyn ContainerDriver {
        self.driver.as_ref()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn status(&self, name: &str) -> PlatformResult<Option<ContainerStatus>> {
        self.driver
            .container_status(name)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to inspect {name}"), e))
    }

    /// Create and start the container. A running container is left alone.
    pub async fn start(
        &self,
        handle: &mut ContainerHandle,
        reporter: &dyn Reporter,
    ) -> PlatformResult<StartOutcome> {
        let name = handle.container_name();

        match self.status(&name).await? {
            Some(status) if status.is_running() => {
                debug!("{name} is already running");
                handle.ip = status.ip;
                return Ok(StartOutcome::AlreadyRunning);
            }
            Some(status) => {
                // Mounts and environment may have changed since it was created.
                reporter.step(&format!("Removing stale container {name} ({})", status.state));
                ignore_benign(self.driver.remove_container(&name, true).await)
                    .map_err(|e| PlatformError::driver(format!("failed to remove stale {name}"), e))?;
            }
            None => {}
        }

        reporter.step(&format!("Starting {} {}", handle.address.kind, handle.name()));

        if handle.needs_volume() {
            let volume = handle.address.volume_name();
            ignore_benign(self.driver.create_volume(&volume).await)
                .map_err(|e| PlatformError::driver(format!("failed to create volume {volume}"), e))?;
        }
        handle.mounts.prepare(self.driver(), &self.settings.helper_image).await?;

        match self.driver.create_container(&handle.config).await {
            Ok(id) => debug!("created {name} ({id})"),
            Err(ContainerError::NameInUse(_)) => {
                info!("{name} was created concurrently, continuing");
            }
            Err(e) => return Err(PlatformError::driver(format!("failed to create {name}"), e)),
        }

        let descriptor = serde_json::to_vec_pretty(&handle.descriptor)?;
        self.driver
            .upload(&name, DESCRIPTOR_PATH, &descriptor)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to upload descriptor to {name}"), e))?;

        self.driver
            .start_container(&name)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to start {name}"), e))?;

        handle.ip = self.status(&name).await?.and_then(|status| status.ip);
        handle.mounts.realize(self.driver(), &name).await?;

        Ok(StartOutcome::Started)
    }

    /// Run the open handshake and append the produced records to `ledger`.
    pub async fn open(
        &self,
        handle: &mut ContainerHandle,
        ledger: &mut RelationshipLedger,
        reporter: &dyn Reporter,
    ) -> PlatformResult<()> {
        let name = handle.container_name();

        let relationships = ledger.resolve(handle.definition.relationships());
        for (alias, target) in handle.definition.relationships() {
            if !relationships.contains_key(alias) {
                reporter.warn(&format!(
                    "{}: relationship '{alias}' ({target}) has no resolved endpoint",
                    handle.name()
                ));
            }
        }
        handle.relationships = relationships.clone();

        reporter.step(&format!("Opening {}", handle.name()));
        self.wait_ready(&name).await?;

        let payload = encode_open_payload(&OpenPayload { relationships }).map_err(|source| {
            PlatformError::Protocol {
                container: name.clone(),
                source,
            }
        })?;
        let stdout = self
            .driver
            .run_command(&name, None, &[OPEN_COMMAND], Some(payload.as_bytes()))
            .await
            .map_err(|e| PlatformError::driver(format!("open failed in {name}"), e))?;

        let entries = parse_open_output(&stdout).map_err(|source| PlatformError::Protocol {
            container: name.clone(),
            source,
        })?;

        if handle.ip.is_none() {
            handle.ip = self.status(&name).await?.and_then(|status| status.ip);
        }

        let engine = handle.definition.engine().to_string();
        let resolved = entries
            .into_iter()
            .map(|(endpoint, fields)| {
                materialize(&handle.address, &engine, &endpoint, fields, handle.ip.as_deref())
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| PlatformError::Protocol {
                container: name.clone(),
                source,
            })?;

        debug!("{} published {} endpoint(s)", handle.name(), resolved.len());
        ledger.append(resolved);
        handle.opened = true;
        Ok(())
    }

    /// Block until the container reports it has booted.
    async fn wait_ready(&self, name: &str) -> PlatformResult<()> {
        let script = readiness_script();
        let command = ["sh", "-c", script.as_str()];
        let wait = self.driver.run_command(name, None, &command, None);

        let result = match self.settings.open_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PlatformError::Timeout {
                    what: format!("{name} to become ready"),
                    seconds: limit.as_secs(),
                })?,
            None => wait.await,
        };
        result.map_err(|e| PlatformError::driver(format!("readiness wait failed in {name}"), e))?;
        Ok(())
    }

    /// Run the build hook of an app. Skipped when nothing needs building.
    pub async fn build(&self, handle: &mut ContainerHandle, reporter: &dyn Reporter) -> PlatformResult<()> {
        let Some(app) = handle.definition.as_app() else {
            return Ok(());
        };
        if handle.built {
            debug!("{} is already built", handle.name());
            return Ok(());
        }
        let Some(hook) = app.hooks.build.clone() else {
            handle.built = true;
            return Ok(());
        };

        let name = handle.container_name();
        reporter.step(&format!("Building {}", handle.name()));

        let payload = BuildPayload {
            name: handle.name().to_string(),
            runtime_type: handle.definition.runtime_type().to_string(),
            hook,
            variables: handle.descriptor.variables.clone(),
            relationships: handle.relationships.clone(),
        };
        self.driver
            .upload(&name, BUILD_PAYLOAD_PATH, &serde_json::to_vec(&payload)?)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to upload build payload to {name}"), e))?;

        if let Err(e) = self.driver.run_command(&name, None, &[BUILD_COMMAND], None).await {
            warn!("build of {} failed: {e}", handle.name());
            let output = match self.driver.download(&name, BUILD_LOG_PATH).await {
                Ok(log) => String::from_utf8_lossy(&log).into_owned(),
                Err(_) => e.to_string(),
            };
            return Err(PlatformError::BuildFailed {
                name: handle.name().to_string(),
                output,
            });
        }

        handle.built = true;
        Ok(())
    }

    /// Run the deploy hook of a running app. Skipped when undeclared.
    pub async fn deploy(&self, handle: &ContainerHandle, reporter: &dyn Reporter) -> PlatformResult<()> {
        let Some(hook) = handle
            .definition
            .as_app()
            .and_then(|app| app.hooks.deploy.as_deref())
        else {
            return Ok(());
        };

        let name = handle.container_name();
        self.require_running(&name, "deploy").await?;

        reporter.step(&format!("Deploying {}", handle.name()));
        self.driver
            .run_command(&name, None, &[DEPLOY_COMMAND], Some(hook.as_bytes()))
            .await
            .map_err(|e| PlatformError::driver(format!("deploy hook failed in {name}"), e))?;
        Ok(())
    }

    /// Snapshot a running app into its commit image.
    pub async fn commit(&self, handle: &mut ContainerHandle, reporter: &dyn Reporter) -> PlatformResult<()> {
        require_app(handle, "commit")?;
        let name = handle.container_name();
        self.require_running(&name, "commit").await?;

        let image = handle.address.commit_image();
        reporter.step(&format!("Committing {} to {image}", handle.name()));
        self.driver
            .commit(&name, &image)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to commit {name}"), e))?;

        handle.committed = true;
        Ok(())
    }

    /// Remove an app's commit image. The app must not be running from it.
    pub async fn delete_commit(&self, handle: &mut ContainerHandle, reporter: &dyn Reporter) -> PlatformResult<()> {
        require_app(handle, "delete the commit of")?;
        let name = handle.container_name();
        if self.status(&name).await?.is_some_and(|s| s.is_running()) {
            return Err(PlatformError::Precondition(format!(
                "cannot delete the commit of {}: it is running, stop it first",
                handle.name()
            )));
        }

        let image = handle.address.commit_image();
        let exists = self
            .driver
            .image_exists(&image)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to inspect {image}"), e))?;
        if !exists {
            return Err(PlatformError::not_found("commit", handle.name()));
        }

        reporter.step(&format!("Deleting commit {image}"));
        self.driver
            .delete_image(&image)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to delete {image}"), e))?;

        handle.committed = false;
        Ok(())
    }

    pub async fn shell(&self, handle: &ContainerHandle, command: &[&str]) -> PlatformResult<i32> {
        let name = handle.container_name();
        self.require_running(&name, "open a shell in").await?;
        self.driver
            .shell(&name, Some(RUNTIME_USER), command)
            .await
            .map_err(|e| PlatformError::driver(format!("shell failed in {name}"), e))
    }

    pub async fn logs(&self, handle: &ContainerHandle, tail: Option<u32>) -> PlatformResult<String> {
        let name = handle.container_name();
        self.driver.logs(&name, tail).await.map_err(|e| match e {
            ContainerError::ContainerNotFound(_) => PlatformError::not_found("container", name),
            e => PlatformError::driver(format!("failed to read logs of {name}"), e),
        })
    }

    /// A missing container counts as not running.
    async fn require_running(&self, name: &str, action: &str) -> PlatformResult<()> {
        match self.status(name).await? {
            Some(status) if status.is_running() => Ok(()),
            _ => Err(PlatformError::Precondition(format!(
                "cannot {action} {name}: container is not running"
            ))),
        }
    }
}

fn require_app(handle: &ContainerHandle, action: &str) -> PlatformResult<()> {
    if handle.definition.as_app().is_none() {
        return Err(PlatformError::Precondition(format!(
            "cannot {action} {}: only apps can be committed",
            handle.name()
        )));
    }
    Ok(())
}

/// Treat engine races that leave the wanted state as success.
pub(crate) fn ignore_benign(result: Result<(), ContainerError>) -> Result<(), ContainerError> {
    match result {
        Err(e) if e.is_benign_race() || e.is_not_found() => {
            debug!("ignoring benign engine error: {e}");
            Ok(())
        }
        other => other,
    }
}
