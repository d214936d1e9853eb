//! Stop, removal and the other fan-out operations.
//!
//! These touch no shared orchestration state, so they run on a bounded number of
//! concurrent workers and report per item instead of aborting on the first error.

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use platdev_protocol::SHUTDOWN_COMMAND;

use super::{Lifecycle, ignore_benign};
use crate::container::ContainerError;
use crate::error::{BatchReport, PlatformError, PlatformResult};
use crate::reporter::Reporter;

impl Lifecycle {
    /// Stop and remove one container.
    ///
    /// The in-container shutdown gets `stop_timeout` to finish; after that the
    /// engine stops the container without further grace.
    pub async fn stop(&self, name: &str, reporter: &dyn Reporter) -> PlatformResult<()> {
        let Some(status) = self.status(name).await? else {
            debug!("{name} does not exist, nothing to stop");
            return Ok(());
        };

        if status.is_running() {
            reporter.step(&format!("Stopping {name}"));
            let limit = self.settings.stop_timeout;
            let graceful = tokio::time::timeout(
                limit,
                self.driver.run_command(name, Some("root"), &[SHUTDOWN_COMMAND], None),
            )
            .await;

            let grace = match graceful {
                Ok(Ok(_)) => None,
                Ok(Err(e)) if e.is_benign_race() || e.is_not_found() => None,
                Ok(Err(e)) => {
                    debug!("graceful shutdown of {name} failed: {e}");
                    Some(0)
                }
                Err(_) => {
                    reporter.warn(&format!(
                        "{name} did not shut down within {}s, forcing",
                        limit.as_secs()
                    ));
                    Some(0)
                }
            };

            ignore_benign(self.driver.stop_container(name, grace).await)
                .map_err(|e| PlatformError::driver(format!("failed to stop {name}"), e))?;
        }

        ignore_benign(self.driver.remove_container(name, true).await)
            .map_err(|e| PlatformError::driver(format!("failed to remove {name}"), e))?;
        Ok(())
    }

    /// Stop and remove many containers concurrently.
    pub async fn stop_many(&self, names: Vec<String>, reporter: &dyn Reporter) -> BatchReport {
        let results: Vec<(String, PlatformResult<()>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.stop(&name, reporter).await;
                (name, result)
            })
            .buffer_unordered(self.settings.workers())
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (name, result) in results {
            if let Err(ref e) = result {
                warn!("failed to stop {name}: {e}");
            }
            report.record(name, result);
        }
        report
    }

    /// Pull every image that is not present locally.
    ///
    /// All pulls run to completion; the first failure is returned afterwards.
    pub async fn pull_missing(&self, images: Vec<String>, reporter: &dyn Reporter) -> PlatformResult<()> {
        let results: Vec<PlatformResult<()>> = stream::iter(images)
            .map(|image| async move {
                let present = self
                    .driver
                    .image_exists(&image)
                    .await
                    .map_err(|e| PlatformError::driver(format!("failed to inspect {image}"), e))?;
                if present {
                    return Ok(());
                }

                reporter.step(&format!("Pulling {image}"));
                match self.driver.pull_image(&image).await {
                    Ok(()) => {
                        info!("pulled {image}");
                        Ok(())
                    }
                    Err(ContainerError::ImageNotFound(_)) => Err(PlatformError::ImageNotFound(image)),
                    Err(e) => Err(PlatformError::driver(format!("failed to pull {image}"), e)),
                }
            })
            .buffer_unordered(self.settings.workers())
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Create the shared network if it does not exist yet.
    pub async fn ensure_network(&self, name: &str) -> PlatformResult<()> {
        ignore_benign(self.driver.create_network(name).await)
            .map_err(|e| PlatformError::driver(format!("failed to create network {name}"), e))
    }
}
