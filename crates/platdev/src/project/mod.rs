//! Projects and the orchestrator driving them.
//!
//! A [`Project`] is the loaded definitions plus the persisted state file. The
//! [`Orchestrator`] runs whole-project operations: it orders definitions with the
//! [`Resolver`], then walks them through the [`Lifecycle`] strictly one at a time,
//! because each open may consume records appended by an earlier one. Only stops,
//! pulls and volume deletions fan out.

mod state;

pub use state::{
    FLAG_IGNORE_COMMITS, FLAG_NO_ROUTER, OPTION_MOUNT_STRATEGY, ProjectState, STATE_FILE,
};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use platdev_protocol::{ROUTES_DIR, RelationshipRecord};
use serde::Serialize;

use crate::address::{
    CANONICAL_SLOT, NETWORK_NAME, ObjectAddress, ObjectKind, global_prefix, project_prefix,
};
use crate::container::{ContainerConfig, ContainerDriver};
use crate::definition::{DEFINITION_FILE, Definition, DefinitionFile, Route};
use crate::error::{BatchReport, PlatformError, PlatformResult};
use crate::lifecycle::{
    ContainerHandle, HandleContext, Lifecycle, LifecycleState, StartOutcome, ignore_benign,
};
use crate::mounts::MountStrategy;
use crate::relationships::RelationshipLedger;
use crate::reporter::Reporter;
use crate::resolver::Resolver;
use crate::settings::OrchestratorSettings;
use crate::slot::SlotManager;

/// A project directory with its definitions and persisted state.
#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    pub state: ProjectState,
    definitions: Vec<Definition>,
    routes: Vec<Route>,
    ledger: RelationshipLedger,
    handles: BTreeMap<String, ContainerHandle>,
    dry_run: bool,
}

impl Project {
    /// Load `platdev.yaml` and the state file from `root`.
    pub fn load(root: impl Into<PathBuf>, dry_run: bool) -> PlatformResult<Self> {
        let root = root.into();
        let (definitions, routes) = DefinitionFile::load(&root.join(DEFINITION_FILE))?.into_parts();
        let state = ProjectState::load_or_init(&root, dry_run)?;
        debug!(
            "loaded project {} with {} definition(s) from {}",
            state.id,
            definitions.len(),
            root.display()
        );

        let mut project = Self::new(root, state, definitions, routes);
        project.dry_run = dry_run;
        Ok(project)
    }

    pub fn new(
        root: impl Into<PathBuf>,
        state: ProjectState,
        definitions: Vec<Definition>,
        routes: Vec<Route>,
    ) -> Self {
        Self {
            root: root.into(),
            state,
            definitions,
            routes,
            ledger: RelationshipLedger::new(),
            handles: BTreeMap::new(),
            dry_run: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active volume slot.
    pub fn slot(&self) -> u32 {
        self.state.slot
    }

    pub fn definitions(&self) -> &[Definition] {
        &self.definitions
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn definition(&self, name: &str) -> PlatformResult<&Definition> {
        self.definitions
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| PlatformError::not_found("definition", name))
    }

    /// Records appended during the last start, in open order.
    pub fn ledger(&self) -> &RelationshipLedger {
        &self.ledger
    }

    /// Handle of a definition started by this process.
    pub fn handle(&self, name: &str) -> Option<&ContainerHandle> {
        self.handles.get(name)
    }

    /// Relationships resolved for a definition during the last start.
    pub fn relationships_for(&self, name: &str) -> Option<&BTreeMap<String, Vec<RelationshipRecord>>> {
        self.handles.get(name).map(|handle| &handle.relationships)
    }

    /// Redirect volume addressing to `slot` from the next start on.
    pub fn set_slot(&mut self, slot: u32) -> PlatformResult<()> {
        if slot < CANONICAL_SLOT {
            return Err(PlatformError::Precondition(format!(
                "slot must be at least {CANONICAL_SLOT}"
            )));
        }
        self.state.slot = slot;
        self.save()
    }

    /// Persist the state file unless running dry.
    pub fn save(&self) -> PlatformResult<()> {
        if self.dry_run {
            info!("dry-run: would save {}", ProjectState::path(&self.root).display());
            return Ok(());
        }
        self.state.save(&self.root)
    }

    /// Mount strategy from the project options, falling back to `default`.
    pub fn mount_strategy(&self, default: MountStrategy) -> PlatformResult<MountStrategy> {
        match self.state.option(OPTION_MOUNT_STRATEGY) {
            Some(value) => value.parse(),
            None => Ok(default),
        }
    }

    pub fn new_handle(
        &self,
        definition: &Definition,
        settings: &OrchestratorSettings,
    ) -> PlatformResult<ContainerHandle> {
        let context = HandleContext {
            project: self.id(),
            root: &self.root,
            slot: self.slot(),
            variables: &self.state.variables,
            mount_strategy: self.mount_strategy(settings.mount_strategy)?,
        };
        ContainerHandle::new(context, definition, settings)
    }

    fn handle_for(&self, name: &str, settings: &OrchestratorSettings) -> PlatformResult<ContainerHandle> {
        match self.handles.get(name) {
            Some(handle) => Ok(handle.clone()),
            None => self.new_handle(self.definition(name)?, settings),
        }
    }
}

/// Reported state of one definition.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectStatus {
    pub name: String,
    pub kind: ObjectKind,
    pub container: String,
    pub state: LifecycleState,
    pub ip: Option<String>,
    pub built: bool,
    pub committed: bool,
}

#[derive(Serialize)]
struct RoutesDocument<'a> {
    project: &'a str,
    routes: &'a [Route],
}

/// Whole-project operations.
#[derive(Clone)]
pub struct Orchestrator {
    driver: Arc<dyn ContainerDriver>,
    settings: OrchestratorSettings,
    lifecycle: Lifecycle,
    slots: SlotManager,
    resolver: Resolver,
}

impl Orchestrator {
    pub fn new(driver: Arc<dyn ContainerDriver>, settings: OrchestratorSettings) -> Self {
        Self {
            lifecycle: Lifecycle::new(Arc::clone(&driver), settings.clone()),
            slots: SlotManager::new(Arc::clone(&driver), settings.clone()),
            resolver: Resolver::new(settings.resolve_strategy),
            driver,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    /// Start every definition in dependency order, open it and build it.
    pub async fn start(&self, project: &mut Project, reporter: &dyn Reporter) -> PlatformResult<()> {
        self.run(project, false, reporter).await
    }

    /// Like [`Orchestrator::start`], but ignores commits and reruns every build hook.
    pub async fn build(&self, project: &mut Project, reporter: &dyn Reporter) -> PlatformResult<()> {
        self.run(project, true, reporter).await
    }

    async fn run(&self, project: &mut Project, rebuild: bool, reporter: &dyn Reporter) -> PlatformResult<()> {
        project.ledger.reset();
        project.handles.clear();

        let order = self.resolver.order(&project.definitions)?;
        debug!(
            "start order for {}: {:?}",
            project.id(),
            order.iter().map(|&i| project.definitions[i].name()).collect::<Vec<_>>()
        );

        let use_commits = !rebuild && !project.state.has_flag(FLAG_IGNORE_COMMITS);
        let mut handles = Vec::with_capacity(order.len());
        for &i in &order {
            let mut handle = project.new_handle(&project.definitions[i], &self.settings)?;
            if use_commits && handle.definition.as_app().is_some() {
                let image = handle.address.commit_image();
                let committed = self
                    .driver
                    .image_exists(&image)
                    .await
                    .map_err(|e| PlatformError::driver(format!("failed to inspect {image}"), e))?;
                if committed {
                    debug!("{} starts from commit {image}", handle.name());
                    handle.use_commit();
                }
            }
            handles.push(handle);
        }

        self.lifecycle.ensure_network(NETWORK_NAME).await?;

        let images: BTreeSet<String> = handles
            .iter()
            .filter(|handle| !handle.committed)
            .map(|handle| handle.image.clone())
            .collect();
        self.lifecycle
            .pull_missing(images.into_iter().collect(), reporter)
            .await?;

        for mut handle in handles {
            let outcome = self.lifecycle.start(&mut handle, reporter).await?;
            self.lifecycle
                .open(&mut handle, &mut project.ledger, reporter)
                .await?;

            if rebuild {
                handle.built = false;
            } else if outcome == StartOutcome::AlreadyRunning {
                handle.built = true;
            }
            self.lifecycle.build(&mut handle, reporter).await?;

            project.handles.insert(handle.name().to_string(), handle);
        }

        if self.settings.router_enabled && !project.state.has_flag(FLAG_NO_ROUTER) {
            self.update_router(project, reporter).await?;
        }

        reporter.step(&format!("Project {} is running", project.id()));
        Ok(())
    }

    /// Ensure the host-wide router runs and knows this project's routes.
    async fn update_router(&self, project: &Project, reporter: &dyn Reporter) -> PlatformResult<()> {
        let name = ObjectAddress::router().container_name();

        let running = match self.lifecycle.status(&name).await? {
            Some(status) if status.is_running() => true,
            Some(_) => {
                ignore_benign(self.driver.remove_container(&name, true).await)
                    .map_err(|e| PlatformError::driver(format!("failed to remove stale {name}"), e))?;
                false
            }
            None => false,
        };

        if !running {
            reporter.step("Starting router");
            self.lifecycle
                .pull_missing(vec![self.settings.router_image.clone()], reporter)
                .await?;

            let mut config = ContainerConfig::new(&self.settings.router_image)
                .name(&name)
                .hostname("router")
                .network(NETWORK_NAME);
            if let Some(port) = self.settings.router_port {
                config = config.port(port, 80);
            }

            match self.driver.create_container(&config).await {
                Ok(_) => {}
                Err(e) if e.is_benign_race() => debug!("router created concurrently"),
                Err(e) => return Err(PlatformError::driver("failed to create router", e)),
            }
            ignore_benign(self.driver.start_container(&name).await)
                .map_err(|e| PlatformError::driver("failed to start router", e))?;
        }

        let document = serde_json::to_vec_pretty(&RoutesDocument {
            project: project.id(),
            routes: &project.routes,
        })?;
        self.driver
            .run_command(&name, Some("root"), &["mkdir", "-p", ROUTES_DIR], None)
            .await
            .map_err(|e| PlatformError::driver("failed to prepare router routes", e))?;
        self.driver
            .upload(&name, &format!("{ROUTES_DIR}/{}.json", project.id()), &document)
            .await
            .map_err(|e| PlatformError::driver("failed to upload routes", e))?;

        debug!("uploaded {} route(s) for {}", project.routes.len(), project.id());
        Ok(())
    }

    /// Run the deploy hook of every app.
    pub async fn deploy(&self, project: &Project, reporter: &dyn Reporter) -> PlatformResult<()> {
        for definition in project.definitions.iter().filter(|d| d.kind() == ObjectKind::App) {
            let handle = project.handle_for(definition.name(), &self.settings)?;
            self.lifecycle.deploy(&handle, reporter).await?;
        }
        Ok(())
    }

    /// Stop and remove every container of the project.
    pub async fn stop(&self, project: &mut Project, reporter: &dyn Reporter) -> PlatformResult<BatchReport> {
        let containers = self.containers(&project_prefix(project.id())).await?;
        info!("stopping {} container(s) of {}", containers.len(), project.id());

        let report = self.lifecycle.stop_many(containers, reporter).await;
        project.handles.clear();
        project.ledger.reset();
        Ok(report)
    }

    /// Stop every container platdev manages on this host, router included.
    pub async fn stop_all(&self, reporter: &dyn Reporter) -> PlatformResult<BatchReport> {
        let containers = self.containers(&global_prefix()).await?;
        info!("stopping {} container(s) on this host", containers.len());
        Ok(self.lifecycle.stop_many(containers, reporter).await)
    }

    /// Stop the project and delete its volumes, or only those of one slot.
    pub async fn purge(
        &self,
        project: &mut Project,
        slot: Option<u32>,
        reporter: &dyn Reporter,
    ) -> PlatformResult<BatchReport> {
        if let Some(slot) = slot
            && slot <= CANONICAL_SLOT
        {
            return Err(PlatformError::Precondition(format!(
                "refusing to purge slot {slot}: it holds the canonical volumes"
            )));
        }

        match slot {
            Some(slot) => {
                let mut report = BatchReport::default();
                if slot == project.slot() {
                    report.merge(self.stop(project, reporter).await?);
                }
                report.merge(self.slots.purge_slot(project.id(), slot, reporter).await?);
                Ok(report)
            }
            None => {
                let mut report = self.stop(project, reporter).await?;
                let volumes = self.slots.volumes(project.id()).await?;
                report.merge(self.slots.remove_volumes(volumes, reporter).await);
                Ok(report)
            }
        }
    }

    /// Replace slot `dest` with a copy of the active slot.
    pub async fn copy_slot(&self, project: &Project, dest: u32, reporter: &dyn Reporter) -> PlatformResult<BatchReport> {
        self.slots
            .copy_slot(project.id(), project.slot(), dest, reporter)
            .await
    }

    /// Volumes of the project grouped by slot.
    pub async fn slot_volumes(&self, project: &Project) -> PlatformResult<BTreeMap<u32, Vec<String>>> {
        self.slots.slots(project.id()).await
    }

    pub async fn commit(&self, project: &mut Project, name: &str, reporter: &dyn Reporter) -> PlatformResult<()> {
        let mut handle = project.handle_for(name, &self.settings)?;
        self.lifecycle.commit(&mut handle, reporter).await?;
        if project.handles.contains_key(name) {
            project.handles.insert(name.to_string(), handle);
        }
        Ok(())
    }

    pub async fn delete_commit(
        &self,
        project: &mut Project,
        name: &str,
        reporter: &dyn Reporter,
    ) -> PlatformResult<()> {
        let mut handle = project.handle_for(name, &self.settings)?;
        self.lifecycle.delete_commit(&mut handle, reporter).await?;
        if project.handles.contains_key(name) {
            project.handles.insert(name.to_string(), handle);
        }
        Ok(())
    }

    pub async fn shell(&self, project: &Project, name: &str, command: &[&str]) -> PlatformResult<i32> {
        let handle = project.handle_for(name, &self.settings)?;
        self.lifecycle.shell(&handle, command).await
    }

    pub async fn logs(&self, project: &Project, name: &str, tail: Option<u32>) -> PlatformResult<String> {
        let handle = project.handle_for(name, &self.settings)?;
        self.lifecycle.logs(&handle, tail).await
    }

    /// State of every definition, in definition order.
    pub async fn status(&self, project: &Project) -> PlatformResult<Vec<ObjectStatus>> {
        let mut statuses = Vec::with_capacity(project.definitions.len());
        for definition in &project.definitions {
            let handle = project.handle_for(definition.name(), &self.settings)?;
            let container = handle.container_name();
            let status = self.lifecycle.status(&container).await?;

            let committed = if definition.kind() == ObjectKind::App {
                self.driver
                    .image_exists(&handle.address.commit_image())
                    .await
                    .map_err(|e| PlatformError::driver(format!("failed to inspect commit of {container}"), e))?
            } else {
                false
            };

            statuses.push(ObjectStatus {
                name: definition.name().to_string(),
                kind: definition.kind(),
                state: LifecycleState::from_status(status.as_ref(), handle.opened),
                ip: status.and_then(|s| s.ip),
                container,
                built: handle.built,
                committed,
            });
        }
        Ok(statuses)
    }

    async fn containers(&self, prefix: &str) -> PlatformResult<Vec<String>> {
        self.driver
            .list_containers(prefix)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to list containers matching {prefix}"), e))
    }
}
