//! Realization of declared persistent paths.
//!
//! | strategy  | storage                                       | container path          |
//! |-----------|-----------------------------------------------|-------------------------|
//! | `none`    | container filesystem                          | plain directory         |
//! | `symlink` | `/app/.platdev/mounts/<source_path>` (source) | symlink to the storage  |
//! | `volume`  | `mounts/<source_path>` in the object's volume | volume subpath mount    |
//!
//! Every strategy leaves the declared path existing and owned by [`RUNTIME_USER`],
//! and running it again changes nothing.
//!
//! `service`-sourced mounts are stored like `local` ones, in the object's own
//! storage. Their source and backing service only reach the runtime descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::debug;
use platdev_protocol::DescriptorMount;
use serde::{Deserialize, Serialize};

use crate::address::ObjectAddress;
use crate::container::{ContainerConfig, ContainerDriver, VolumeMount};
use crate::definition::MountDeclaration;
use crate::error::{PlatformError, PlatformResult};

/// Unprivileged user application processes run as.
pub const RUNTIME_USER: &str = "web";

/// Numeric id of [`RUNTIME_USER`] in every platdev image.
pub const RUNTIME_UID: u32 = 10000;

/// Where project source is bind-mounted in app and worker containers.
pub const APP_ROOT: &str = "/app";

/// Where an object's data volume is mounted.
pub const DATA_ROOT: &str = "/mnt/data";

const SYMLINK_ROOT: &str = "/app/.platdev/mounts";
const VOLUME_SUBDIR: &str = "mounts";

/// How declared mounts are realized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountStrategy {
    None,
    Symlink,
    #[default]
    Volume,
}

impl fmt::Display for MountStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountStrategy::None => write!(f, "none"),
            MountStrategy::Symlink => write!(f, "symlink"),
            MountStrategy::Volume => write!(f, "volume"),
        }
    }
}

impl FromStr for MountStrategy {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(MountStrategy::None),
            "symlink" => Ok(MountStrategy::Symlink),
            "volume" => Ok(MountStrategy::Volume),
            other => Err(PlatformError::Precondition(format!(
                "unknown mount strategy '{other}' (expected none, symlink or volume)"
            ))),
        }
    }
}

/// One declared mount with its storage location resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMount {
    /// Declared container path.
    pub path: String,
    /// Storage directory name, relative to the strategy's root.
    pub storage: String,
    pub declaration: MountDeclaration,
}

impl PlannedMount {
    fn storage_path(&self, strategy: MountStrategy) -> String {
        match strategy {
            MountStrategy::Symlink => format!("{SYMLINK_ROOT}/{}", self.storage),
            MountStrategy::Volume => format!("{DATA_ROOT}/{VOLUME_SUBDIR}/{}", self.storage),
            MountStrategy::None => self.path.clone(),
        }
    }
}

/// The mounts of one container under one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct MountPlan {
    strategy: MountStrategy,
    volume: String,
    mounts: Vec<PlannedMount>,
}

impl MountPlan {
    /// Validate declarations and order them parents first.
    pub fn new(
        address: &ObjectAddress,
        declared: &BTreeMap<String, MountDeclaration>,
        strategy: MountStrategy,
    ) -> PlatformResult<Self> {
        let mut mounts = declared
            .iter()
            .map(|(path, declaration)| plan_mount(path, declaration))
            .collect::<PlatformResult<Vec<_>>>()?;
        mounts.sort_by(|a, b| depth(&a.path).cmp(&depth(&b.path)).then(a.path.cmp(&b.path)));

        Ok(Self {
            strategy,
            volume: address.volume_name(),
            mounts,
        })
    }

    pub fn strategy(&self) -> MountStrategy {
        self.strategy
    }

    pub fn mounts(&self) -> &[PlannedMount] {
        &self.mounts
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Volume mounts to add to the container config.
    pub fn container_mounts(&self) -> Vec<VolumeMount> {
        if self.strategy != MountStrategy::Volume {
            return Vec::new();
        }
        self.mounts
            .iter()
            .map(|mount| {
                VolumeMount::new(&self.volume, &mount.path)
                    .subpath(format!("{VOLUME_SUBDIR}/{}", mount.storage))
            })
            .collect()
    }

    /// Mount entries for the runtime descriptor.
    pub fn descriptor_mounts(&self) -> BTreeMap<String, DescriptorMount> {
        self.mounts
            .iter()
            .map(|mount| {
                (
                    mount.path.clone(),
                    DescriptorMount {
                        source: mount.declaration.source.to_string(),
                        source_path: mount.declaration.source_path.clone(),
                        strategy: self.strategy.to_string(),
                    },
                )
            })
            .collect()
    }

    /// Transient helper that creates volume subdirectories before the container
    /// exists. The engine refuses to mount a subpath that is missing.
    pub fn preparation(&self, helper_image: &str) -> Option<ContainerConfig> {
        if self.strategy != MountStrategy::Volume || self.mounts.is_empty() {
            return None;
        }
        let script = self
            .mounts
            .iter()
            .map(|mount| ensure_dir(&mount.storage_path(self.strategy)))
            .collect::<Vec<_>>()
            .join(" && ");

        Some(
            ContainerConfig::new(helper_image)
                .volume(VolumeMount::new(&self.volume, DATA_ROOT))
                .command(vec!["sh".to_string(), "-c".to_string(), script]),
        )
    }

    /// Script run as root inside the started container.
    pub fn realization(&self) -> Option<String> {
        if self.mounts.is_empty() {
            return None;
        }
        let steps: Vec<String> = self
            .mounts
            .iter()
            .map(|mount| match self.strategy {
                MountStrategy::None | MountStrategy::Volume => ensure_dir(&mount.path),
                MountStrategy::Symlink => link(&mount.storage_path(self.strategy), &mount.path),
            })
            .collect();
        Some(steps.join(" && "))
    }

    /// Create volume subdirectories ahead of container creation.
    pub async fn prepare(&self, driver: &dyn ContainerDriver, helper_image: &str) -> PlatformResult<()> {
        let Some(config) = self.preparation(helper_image) else {
            return Ok(());
        };
        debug!("preparing {} mount(s) in volume {}", self.mounts.len(), self.volume);
        driver
            .run_transient(&config)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to prepare mounts in {}", self.volume), e))?;
        Ok(())
    }

    /// Make every declared path exist in a running container.
    pub async fn realize(&self, driver: &dyn ContainerDriver, container: &str) -> PlatformResult<()> {
        let Some(script) = self.realization() else {
            return Ok(());
        };
        debug!("realizing {} mount(s) in {} ({})", self.mounts.len(), container, self.strategy);
        driver
            .run_command(container, Some("root"), &["sh", "-c", script.as_str()], None)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to realize mounts in {container}"), e))?;
        Ok(())
    }
}

fn plan_mount(path: &str, declaration: &MountDeclaration) -> PlatformResult<PlannedMount> {
    let trimmed = path.trim_end_matches('/');
    if !trimmed.starts_with('/') || trimmed.split('/').any(|part| part == "..") {
        return Err(PlatformError::Precondition(format!(
            "mount path '{path}' must be an absolute path below /"
        )));
    }

    let storage = match declaration.source_path.trim_matches('/') {
        "" => trimmed.trim_start_matches('/').replace('/', "-"),
        source => source.to_string(),
    };
    if storage.split('/').any(|part| part == ".." || part == ".") {
        return Err(PlatformError::Precondition(format!(
            "mount source path '{}' must stay inside its storage root",
            declaration.source_path
        )));
    }

    Ok(PlannedMount {
        path: trimmed.to_string(),
        storage,
        declaration: declaration.clone(),
    })
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|part| !part.is_empty()).count()
}

fn ensure_dir(path: &str) -> String {
    let path = quote(path);
    format!("mkdir -p {path} && chown {RUNTIME_UID}:{RUNTIME_UID} {path}")
}

/// Link `path` to `storage`, moving content out of a pre-existing directory once.
fn link(storage: &str, path: &str) -> String {
    let storage_q = quote(storage);
    let path_q = quote(path);
    let parent = match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    };
    format!(
        "{} && mkdir -p {} && \
         if [ -d {path_q} ] && [ ! -L {path_q} ]; then cp -a {path_q}/. {storage_q}/ && rm -rf {path_q}; fi && \
         ln -sfn {storage_q} {path_q} && chown -h {RUNTIME_UID}:{RUNTIME_UID} {path_q}",
        ensure_dir(storage),
        quote(&parent),
    )
}

/// Single-quote for `sh`.
pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ObjectKind;
    use crate::definition::MountSource;

    fn declared() -> BTreeMap<String, MountDeclaration> {
        let mut mounts = BTreeMap::new();
        mounts.insert("/app/web/files/private".to_string(), MountDeclaration::local("private"));
        mounts.insert("/app/web/files".to_string(), MountDeclaration::local("files"));
        mounts.insert("/app/tmp/".to_string(), MountDeclaration::local(""));
        mounts
    }

    fn address() -> ObjectAddress {
        ObjectAddress::new("k3j9x2", ObjectKind::App, "web").with_slot(2)
    }

    #[test]
    fn plan_orders_parents_first() {
        let plan = MountPlan::new(&address(), &declared(), MountStrategy::Volume).unwrap();
        let paths: Vec<_> = plan.mounts().iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/app/tmp", "/app/web/files", "/app/web/files/private"]);
        assert_eq!(plan.mounts()[0].storage, "app-tmp");
    }

    #[test]
    fn volume_strategy_mounts_subpaths_of_slot_volume() {
        let plan = MountPlan::new(&address(), &declared(), MountStrategy::Volume).unwrap();
        let mounts = plan.container_mounts();
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].source, "platdev-k3j9x2-web-app-2");
        assert_eq!(mounts[1].target, "/app/web/files");
        assert_eq!(mounts[1].subpath.as_deref(), Some("mounts/files"));

        let helper = plan.preparation("busybox:latest").unwrap();
        assert_eq!(helper.volumes[0].target, DATA_ROOT);
        assert!(helper.command[2].contains("mkdir -p '/mnt/data/mounts/files'"));
        assert!(helper.validate().is_ok());
    }

    #[test]
    fn symlink_strategy_needs_no_engine_mounts() {
        let plan = MountPlan::new(&address(), &declared(), MountStrategy::Symlink).unwrap();
        assert!(plan.container_mounts().is_empty());
        assert!(plan.preparation("busybox:latest").is_none());

        let script = plan.realization().unwrap();
        assert!(script.contains("ln -sfn '/app/.platdev/mounts/files' '/app/web/files'"));
        assert!(script.contains("chown 10000:10000 '/app/.platdev/mounts/private'"));
    }

    #[test]
    fn none_strategy_still_creates_directories() {
        let plan = MountPlan::new(&address(), &declared(), MountStrategy::None).unwrap();
        assert!(plan.container_mounts().is_empty());
        assert!(plan.realization().unwrap().contains("mkdir -p '/app/tmp'"));
        assert_eq!(plan.descriptor_mounts()["/app/tmp"].strategy, "none");
    }

    #[test]
    fn service_mounts_use_object_storage() {
        let mut mounts = BTreeMap::new();
        mounts.insert(
            "/app/shared".to_string(),
            MountDeclaration {
                source: MountSource::Service,
                source_path: "shared".to_string(),
                service: Some("files".to_string()),
            },
        );
        let plan = MountPlan::new(&address(), &mounts, MountStrategy::Volume).unwrap();

        let engine_mounts = plan.container_mounts();
        assert_eq!(engine_mounts[0].source, "platdev-k3j9x2-web-app-2");
        assert_eq!(engine_mounts[0].subpath.as_deref(), Some("mounts/shared"));
        assert_eq!(plan.descriptor_mounts()["/app/shared"].source, "service");
    }

    #[test]
    fn rejects_escaping_paths() {
        let mut mounts = BTreeMap::new();
        mounts.insert("relative/path".to_string(), MountDeclaration::local("x"));
        assert!(MountPlan::new(&address(), &mounts, MountStrategy::Volume).is_err());

        let mut mounts = BTreeMap::new();
        mounts.insert("/app/files".to_string(), MountDeclaration::local("../etc"));
        assert!(MountPlan::new(&address(), &mounts, MountStrategy::Volume).is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(MountStrategy::from_str("Symlink").unwrap(), MountStrategy::Symlink);
        assert!("bind".parse::<MountStrategy>().is_err());
    }
}
