//! Volume slots: numbered parallel copies of a project's persistent data.
//!
//! Slot 1 is the canonical set. Copies live next to it under `-{n}` suffixed volume
//! names and are created, listed and purged here.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, info};

use crate::address::{CANONICAL_SLOT, ObjectAddress, belongs_to_slot, get_slot, project_prefix};
use crate::container::{ContainerConfig, ContainerDriver, VolumeMount};
use crate::error::{BatchReport, PlatformError, PlatformResult};
use crate::reporter::Reporter;
use crate::settings::OrchestratorSettings;

#[derive(Clone)]
pub struct SlotManager {
    driver: Arc<dyn ContainerDriver>,
    settings: OrchestratorSettings,
}

impl SlotManager {
    pub fn new(driver: Arc<dyn ContainerDriver>, settings: OrchestratorSettings) -> Self {
        Self { driver, settings }
    }

    /// Every volume of the project.
    pub async fn volumes(&self, project: &str) -> PlatformResult<Vec<String>> {
        let prefix = project_prefix(project);
        self.driver
            .list_volumes(&prefix)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to list volumes of {project}"), e))
    }

    /// Volumes of the project in one slot.
    pub async fn slot_volumes(&self, project: &str, slot: u32) -> PlatformResult<Vec<String>> {
        Ok(self
            .volumes(project)
            .await?
            .into_iter()
            .filter(|name| belongs_to_slot(name, slot))
            .collect())
    }

    /// Volumes grouped by slot.
    pub async fn slots(&self, project: &str) -> PlatformResult<BTreeMap<u32, Vec<String>>> {
        let mut slots: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for name in self.volumes(project).await? {
            slots.entry(get_slot(&name)).or_default().push(name);
        }
        Ok(slots)
    }

    /// Delete every volume of `slot`. The canonical slot is never purged.
    pub async fn purge_slot(&self, project: &str, slot: u32, reporter: &dyn Reporter) -> PlatformResult<BatchReport> {
        if slot <= CANONICAL_SLOT {
            return Err(PlatformError::Precondition(format!(
                "refusing to purge slot {slot}: it holds the canonical volumes"
            )));
        }

        let volumes = self.slot_volumes(project, slot).await?;
        info!("purging {} volume(s) of slot {slot} in {project}", volumes.len());
        Ok(self.remove_volumes(volumes, reporter).await)
    }

    /// Replace slot `dest` with a copy of slot `from`.
    pub async fn copy_slot(
        &self,
        project: &str,
        from: u32,
        dest: u32,
        reporter: &dyn Reporter,
    ) -> PlatformResult<BatchReport> {
        if from == dest {
            return Err(PlatformError::Precondition(format!(
                "cannot copy slot {from} onto itself"
            )));
        }
        if dest <= CANONICAL_SLOT {
            return Err(PlatformError::Precondition(
                "refusing to overwrite the canonical slot; copy into a numbered slot instead"
                    .to_string(),
            ));
        }

        let existing = self.slot_volumes(project, dest).await?;
        let mut report = self.remove_volumes(existing, reporter).await;
        if !report.is_success() {
            return Ok(report);
        }

        let sources = self.slot_volumes(project, from).await?;
        let pairs: Vec<(String, String)> = sources
            .into_iter()
            .filter_map(|source| {
                let address = ObjectAddress::decode(&source);
                if address.is_zero() {
                    debug!("skipping unmanaged volume {source}");
                    return None;
                }
                let target = address.with_slot(dest).volume_name();
                Some((source, target))
            })
            .collect();

        let results: Vec<(String, PlatformResult<()>)> = stream::iter(pairs)
            .map(|(source, target)| async move {
                let result = self.copy_volume(&source, &target, reporter).await;
                (target, result)
            })
            .buffer_unordered(self.settings.workers())
            .collect()
            .await;

        for (target, result) in results {
            report.record(target, result);
        }
        Ok(report)
    }

    async fn copy_volume(&self, source: &str, target: &str, reporter: &dyn Reporter) -> PlatformResult<()> {
        reporter.step(&format!("Copying {source} to {target}"));
        self.driver
            .create_volume(target)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to create volume {target}"), e))?;

        let helper = ContainerConfig::new(&self.settings.helper_image)
            .volume(VolumeMount::new(source, "/from"))
            .volume(VolumeMount::new(target, "/to"))
            .command(vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp -a /from/. /to/".to_string(),
            ]);
        self.driver
            .run_transient(&helper)
            .await
            .map_err(|e| PlatformError::driver(format!("failed to copy {source} to {target}"), e))?;
        Ok(())
    }

    /// Delete volumes concurrently. Volumes already gone count as deleted.
    pub async fn remove_volumes(&self, volumes: Vec<String>, reporter: &dyn Reporter) -> BatchReport {
        let results: Vec<(String, PlatformResult<()>)> = stream::iter(volumes)
            .map(|name| async move {
                reporter.step(&format!("Deleting volume {name}"));
                let result = match self.driver.remove_volume(&name).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(PlatformError::driver(format!("failed to delete volume {name}"), e)),
                };
                (name, result)
            })
            .buffer_unordered(self.settings.workers())
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (name, result) in results {
            report.record(name, result);
        }
        report
    }
}
