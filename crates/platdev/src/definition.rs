//! Declarative app, worker and service definitions.
//!
//! Definitions are loaded once per run from `platdev.yaml` at the project root and
//! are immutable afterwards. Only deserialization happens here; semantic checks of
//! the declarations belong to the tooling that authors them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::ObjectKind;
use crate::error::{PlatformError, PlatformResult};

/// File holding the project's definitions and routes.
pub const DEFINITION_FILE: &str = "platdev.yaml";

/// Reference from a relationship alias to another definition's endpoint.
///
/// Written as `"target:endpoint"`; a bare `"target"` matches every endpoint the
/// target exposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelationshipTarget {
    pub service: String,
    pub endpoint: Option<String>,
}

impl RelationshipTarget {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Whether a record produced by `service` under `endpoint` satisfies this target.
    pub fn matches(&self, service: &str, endpoint: &str) -> bool {
        self.service == service && self.endpoint.as_deref().is_none_or(|e| e == endpoint)
    }
}

impl FromStr for RelationshipTarget {
    type Err = PlatformError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (service, endpoint) = match value.split_once(':') {
            Some((service, endpoint)) => (service.trim(), Some(endpoint.trim())),
            None => (value.trim(), None),
        };
        if service.is_empty() || endpoint.is_some_and(str::is_empty) {
            return Err(PlatformError::Precondition(format!(
                "invalid relationship target '{value}', expected 'name:endpoint'"
            )));
        }
        Ok(Self {
            service: service.to_string(),
            endpoint: endpoint.map(str::to_string),
        })
    }
}

impl TryFrom<String> for RelationshipTarget {
    type Error = PlatformError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelationshipTarget> for String {
    fn from(target: RelationshipTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for RelationshipTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint {
            Some(ref endpoint) => write!(f, "{}:{}", self.service, endpoint),
            None => write!(f, "{}", self.service),
        }
    }
}

/// Where the storage behind a declared mount lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountSource {
    #[default]
    Local,
    Service,
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSource::Local => write!(f, "local"),
            MountSource::Service => write!(f, "service"),
        }
    }
}

/// A declared persistent path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDeclaration {
    #[serde(default)]
    pub source: MountSource,
    pub source_path: String,
    /// Backing service for `source: service`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl MountDeclaration {
    pub fn local(source_path: impl Into<String>) -> Self {
        Self {
            source: MountSource::Local,
            source_path: source_path.into(),
            service: None,
        }
    }
}

/// Shell hooks of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub runtime_type: String,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipTarget>,
    #[serde(default)]
    pub mounts: BTreeMap<String, MountDeclaration>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub hooks: Hooks,
}

/// A background process running the code of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub name: String,
    /// App whose code the worker runs.
    pub app: String,
    #[serde(rename = "type")]
    pub runtime_type: String,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipTarget>,
    #[serde(default)]
    pub mounts: BTreeMap<String, MountDeclaration>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Start command of the worker process.
    #[serde(default)]
    pub start: Option<String>,
}

/// A backing service (database, cache, search, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub runtime_type: String,
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipTarget>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Engine configuration passed through to the container untouched.
    #[serde(default)]
    pub configuration: serde_json::Value,
}

/// Any definition of a project.
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    App(AppDefinition),
    Worker(WorkerDefinition),
    Service(ServiceDefinition),
}

static NO_MOUNTS: BTreeMap<String, MountDeclaration> = BTreeMap::new();

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::App(app) => &app.name,
            Definition::Worker(worker) => &worker.name,
            Definition::Service(service) => &service.name,
        }
    }

    /// Declared `engine:version` type.
    pub fn runtime_type(&self) -> &str {
        match self {
            Definition::App(app) => &app.runtime_type,
            Definition::Worker(worker) => &worker.runtime_type,
            Definition::Service(service) => &service.runtime_type,
        }
    }

    /// Engine part of the type (`mysql` in `mysql:10.6`).
    pub fn engine(&self) -> &str {
        split_type(self.runtime_type()).0
    }

    /// Version part of the type, `latest` when absent.
    pub fn version(&self) -> &str {
        split_type(self.runtime_type()).1
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Definition::App(_) => ObjectKind::App,
            Definition::Worker(_) => ObjectKind::Worker,
            Definition::Service(_) => ObjectKind::Service,
        }
    }

    pub fn disk(&self) -> Option<u64> {
        match self {
            Definition::App(app) => app.disk,
            Definition::Worker(worker) => worker.disk,
            Definition::Service(service) => service.disk,
        }
    }

    pub fn relationships(&self) -> &BTreeMap<String, RelationshipTarget> {
        match self {
            Definition::App(app) => &app.relationships,
            Definition::Worker(worker) => &worker.relationships,
            Definition::Service(service) => &service.relationships,
        }
    }

    /// Declared mounts. Services never declare any.
    pub fn mounts(&self) -> &BTreeMap<String, MountDeclaration> {
        match self {
            Definition::App(app) => &app.mounts,
            Definition::Worker(worker) => &worker.mounts,
            Definition::Service(_) => &NO_MOUNTS,
        }
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        match self {
            Definition::App(app) => &app.variables,
            Definition::Worker(worker) => &worker.variables,
            Definition::Service(service) => &service.variables,
        }
    }

    /// Whether the container runs project code bind-mounted from the host.
    pub fn runs_source(&self) -> bool {
        matches!(self, Definition::App(_) | Definition::Worker(_))
    }

    pub fn as_app(&self) -> Option<&AppDefinition> {
        match self {
            Definition::App(app) => Some(app),
            _ => None,
        }
    }
}

fn split_type(runtime_type: &str) -> (&str, &str) {
    match runtime_type.split_once(':') {
        Some((engine, version)) if !version.is_empty() => (engine, version),
        Some((engine, _)) => (engine, "latest"),
        None => (runtime_type, "latest"),
    }
}

/// A route handed to the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// URL pattern, e.g. `https://{default}/`.
    pub pattern: String,
    /// Upstream definition, `name:http`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    /// Redirect target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Contents of [`DEFINITION_FILE`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionFile {
    #[serde(default)]
    pub apps: Vec<AppDefinition>,
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl DefinitionFile {
    pub fn parse(contents: &str) -> PlatformResult<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> PlatformResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlatformError::not_found("definition file", path.display().to_string())
            } else {
                PlatformError::Io(e)
            }
        })?;
        Self::parse(&contents)
    }

    /// Flatten into definitions: services first, then apps, then workers.
    pub fn into_parts(self) -> (Vec<Definition>, Vec<Route>) {
        let definitions = self
            .services
            .into_iter()
            .map(Definition::Service)
            .chain(self.apps.into_iter().map(Definition::App))
            .chain(self.workers.into_iter().map(Definition::Worker))
            .collect();
        (definitions, self.routes)
    }
}
