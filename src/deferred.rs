use crate::cms::{CmsApiError, ProductApi};
use crate::models::DeferredReport;
use crate::retry::DelayRange;
use crate::staging::ImageStager;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Pacing for deferred image delivery. Batches stay small and spaced out so
/// the follow-up updates look like ordinary editing traffic; a 406 means the
/// defense layer noticed us, so the next batch waits considerably longer.
#[derive(Debug, Clone)]
pub struct DeferredPacing {
    pub batch_size: usize,
    pub inter_batch: DelayRange,
    pub blocked_extra: DelayRange,
}

impl Default for DeferredPacing {
    fn default() -> Self {
        Self {
            batch_size: 3,
            inter_batch: DelayRange::new(Duration::from_secs(2), Duration::from_secs(3)),
            blocked_extra: DelayRange::new(Duration::from_secs(5), Duration::from_secs(10)),
        }
    }
}

impl DeferredPacing {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let batch_size = std::env::var("CMS_DEFERRED_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(defaults.batch_size);
        Self {
            batch_size,
            ..defaults
        }
    }
}

/// Delivers the images that exceeded the initial request's budget, in small
/// delayed batches. Batches are independent: a failed batch is counted and
/// the processor moves on to the next one.
pub struct DeferredImageProcessor<'a> {
    api: &'a dyn ProductApi,
    stager: &'a dyn ImageStager,
    pacing: DeferredPacing,
}

impl<'a> DeferredImageProcessor<'a> {
    pub fn new(api: &'a dyn ProductApi, stager: &'a dyn ImageStager, pacing: DeferredPacing) -> Self {
        Self { api, stager, pacing }
    }

    pub async fn process_remaining(
        &self,
        remote_id: u64,
        reference: &str,
        images: &[String],
    ) -> DeferredReport {
        let total = images.len();
        let mut processed = 0;
        let mut errors = 0;

        let batches: Vec<&[String]> = images.chunks(self.pacing.batch_size).collect();
        let batch_count = batches.len();
        info!(
            target = "catalog.deferred",
            reference,
            remote_id,
            total,
            batches = batch_count,
            "delivering deferred images"
        );

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let mut staged = Vec::new();
            for (index, url) in batch.iter().enumerate() {
                let key = format!("{reference}-deferred{batch_index}-{index}");
                match self.stager.stage(&key, url).await {
                    Ok(image) => staged.push(image),
                    Err(err) => {
                        errors += 1;
                        warn!(
                            target = "catalog.deferred",
                            reference,
                            url = %url,
                            error = %err,
                            "deferred image failed to stage"
                        );
                    }
                }
            }

            let mut blocked = false;
            if !staged.is_empty() {
                match self.api.append_images(remote_id, &staged).await {
                    Ok(()) => processed += staged.len(),
                    Err(err) => {
                        errors += staged.len();
                        blocked = matches!(err, CmsApiError::Blocked);
                        warn!(
                            target = "catalog.deferred",
                            reference,
                            remote_id,
                            batch = batch_index + 1,
                            error = %err,
                            "deferred batch rejected"
                        );
                    }
                }
            }
            for image in staged {
                image.release();
            }

            if batch_index + 1 < batch_count {
                if blocked {
                    let extra = self.pacing.blocked_extra.sample();
                    warn!(
                        target = "catalog.deferred",
                        reference,
                        extra_ms = extra.as_millis() as u64,
                        "defense block, extending the pause"
                    );
                    sleep(extra).await;
                }
                sleep(self.pacing.inter_batch.sample()).await;
            }
        }

        info!(
            target = "catalog.deferred",
            reference, remote_id, processed, errors, total, "deferred delivery finished"
        );
        DeferredReport {
            processed,
            errors,
            total,
        }
    }
}
