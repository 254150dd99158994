use crate::cms::ProductApi;
use crate::deferred::{DeferredImageProcessor, DeferredPacing};
use crate::models::{BatchSummary, ProductRecord, ProductReport, UploadOutcome};
use crate::retry::{DelayRange, RetryDecision, RetryPolicy};
use crate::staging::ImageStager;
use crate::uploader::UploadPipeline;
use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Products per batch group. Deliberately small: the remote defenses key
    /// on bursts, so throughput is traded for reliability.
    pub batch_size: usize,
    pub product_delay: DelayRange,
    pub batch_delay: DelayRange,
    pub retry: RetryPolicy,
    pub deferred: DeferredPacing,
    pub initial_image_budget: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            batch_size: 2,
            product_delay: DelayRange::new(Duration::from_secs(1), Duration::from_millis(1500)),
            batch_delay: DelayRange::new(Duration::from_secs(3), Duration::from_secs(2)),
            retry: RetryPolicy::default(),
            deferred: DeferredPacing::default(),
            initial_image_budget: 2,
        }
    }
}

impl SchedulerOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("CMS_PRODUCT_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.batch_size),
            retry: RetryPolicy::from_env(),
            deferred: DeferredPacing::from_env(),
            initial_image_budget: std::env::var("CMS_INITIAL_IMAGE_BUDGET")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.initial_image_budget),
            ..defaults
        }
    }
}

pub fn batch_count(products: usize, batch_size: usize) -> usize {
    products.div_ceil(batch_size.max(1))
}

/// Sequences products through the upload pipeline: small batch groups,
/// strictly sequential processing, randomized pacing between requests, and
/// one retry policy for everything. A product's terminal failure never
/// aborts the run.
pub struct BatchScheduler<'a> {
    api: &'a dyn ProductApi,
    stager: &'a dyn ImageStager,
    options: SchedulerOptions,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        api: &'a dyn ProductApi,
        stager: &'a dyn ImageStager,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            api,
            stager,
            options,
        }
    }

    pub async fn run_all(&self, products: &[ProductRecord]) -> BatchSummary {
        let started_at = Utc::now();
        let mut summary = BatchSummary {
            run_id: Uuid::new_v4(),
            total: products.len(),
            succeeded: 0,
            failed: 0,
            rejected: 0,
            skipped: 0,
            started_at,
            finished_at: started_at,
            reports: Vec::with_capacity(products.len()),
        };

        let pipeline =
            UploadPipeline::with_budget(self.api, self.stager, self.options.initial_image_budget);
        let deferred =
            DeferredImageProcessor::new(self.api, self.stager, self.options.deferred.clone());

        let groups = batch_count(products.len(), self.options.batch_size);
        info!(
            target = "catalog.scheduler",
            run_id = %summary.run_id,
            products = products.len(),
            groups,
            "starting upload run"
        );

        for (group_index, group) in products.chunks(self.options.batch_size).enumerate() {
            info!(
                target = "catalog.scheduler",
                group = group_index + 1,
                of = groups,
                size = group.len(),
                "processing batch group"
            );
            for (index, product) in group.iter().enumerate() {
                let report = self.process_one(&pipeline, &deferred, product).await;
                summary.tally(&report);
                summary.reports.push(report);

                if index + 1 < group.len() {
                    sleep(self.options.product_delay.sample()).await;
                }
            }
            if group_index + 1 < groups {
                sleep(self.options.batch_delay.sample()).await;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            target = "catalog.scheduler",
            run_id = %summary.run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rejected = summary.rejected,
            skipped = summary.skipped,
            "upload run finished"
        );
        summary
    }

    async fn process_one(
        &self,
        pipeline: &UploadPipeline<'_>,
        deferred: &DeferredImageProcessor<'_>,
        product: &ProductRecord,
    ) -> ProductReport {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match pipeline.upload(product).await {
                Ok(result) => {
                    let deferred_report = match result.pending {
                        Some(pending) => Some(
                            deferred
                                .process_remaining(
                                    pending.remote_id,
                                    &product.reference,
                                    &pending.images,
                                )
                                .await,
                        ),
                        None => None,
                    };
                    return ProductReport {
                        reference: product.reference.clone(),
                        outcome: result.outcome,
                        attempts,
                        deferred: deferred_report,
                        timestamp: Utc::now(),
                    };
                }
                Err(err) => match self.options.retry.classify(&err, attempts - 1) {
                    RetryDecision::Retry {
                        delay,
                        rotate_identity,
                    } => {
                        warn!(
                            target = "catalog.scheduler",
                            reference = %product.reference,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            rotate_identity,
                            error = %err,
                            "upload attempt failed, retrying"
                        );
                        if rotate_identity {
                            self.api.rotate_identity();
                        }
                        sleep(delay).await;
                    }
                    RetryDecision::Exhausted => {
                        warn!(
                            target = "catalog.scheduler",
                            reference = %product.reference,
                            attempts,
                            error = %err,
                            "retries exhausted"
                        );
                        return ProductReport {
                            reference: product.reference.clone(),
                            outcome: UploadOutcome::Failed {
                                error: err.to_string(),
                                retries_exhausted: true,
                            },
                            attempts,
                            deferred: None,
                            timestamp: Utc::now(),
                        };
                    }
                    RetryDecision::Terminal => {
                        return ProductReport {
                            reference: product.reference.clone(),
                            outcome: UploadOutcome::Failed {
                                error: err.to_string(),
                                retries_exhausted: false,
                            },
                            attempts,
                            deferred: None,
                            timestamp: Utc::now(),
                        };
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cms::{CmsApiError, ProductDraft};
    use crate::models::{RawColor, RemoteProduct, SkipReason};
    use crate::staging::{DownloadError, StagedImage};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Instant;

    struct FakeStager {
        dir: tempfile::TempDir,
        counter: AtomicUsize,
    }

    impl FakeStager {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                counter: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageStager for FakeStager {
        async fn stage(&self, key: &str, url: &str) -> Result<StagedImage, DownloadError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let path = self.dir.path().join(format!("{key}_{n}.jpg"));
            std::fs::write(&path, b"img")?;
            Ok(StagedImage::new(url, path))
        }
    }

    #[derive(Default)]
    struct MockApi {
        remote: Mutex<HashMap<String, u64>>,
        next_id: AtomicU64,
        create_errors: Mutex<VecDeque<CmsApiError>>,
        create_windows: Mutex<Vec<(Instant, Instant)>>,
        rotations: AtomicUsize,
    }

    #[async_trait]
    impl ProductApi for MockApi {
        async fn find_by_reference(
            &self,
            reference: &str,
        ) -> Result<Option<RemoteProduct>, CmsApiError> {
            Ok(self
                .remote
                .lock()
                .unwrap()
                .get(reference)
                .map(|&id| RemoteProduct {
                    id,
                    data: serde_json::json!({}),
                }))
        }

        async fn create_product(&self, draft: ProductDraft<'_>) -> Result<u64, CmsApiError> {
            let started = Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = match self.create_errors.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    self.remote
                        .lock()
                        .unwrap()
                        .insert(draft.record.reference.clone(), id);
                    Ok(id)
                }
            };
            self.create_windows
                .lock()
                .unwrap()
                .push((started, Instant::now()));
            result
        }

        async fn update_product(
            &self,
            _id: u64,
            _draft: ProductDraft<'_>,
        ) -> Result<(), CmsApiError> {
            Ok(())
        }

        async fn append_images(
            &self,
            _id: u64,
            _images: &[StagedImage],
        ) -> Result<(), CmsApiError> {
            Ok(())
        }

        fn rotate_identity(&self) {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options_zero() -> SchedulerOptions {
        SchedulerOptions {
            batch_size: 2,
            product_delay: DelayRange::zero(),
            batch_delay: DelayRange::zero(),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(20),
                max_jitter: Duration::ZERO,
                rate_limit_cooldown: Duration::from_millis(60),
            },
            deferred: DeferredPacing {
                batch_size: 3,
                inter_batch: DelayRange::zero(),
                blocked_extra: DelayRange::zero(),
            },
            initial_image_budget: 2,
        }
    }

    fn record(reference: &str, images: &[&str]) -> ProductRecord {
        ProductRecord {
            reference: reference.into(),
            name: "Mug".into(),
            description: "Steel mug".into(),
            price: None,
            categories: vec![],
            colors: vec![RawColor::Name("Black".into())],
            images: images.iter().map(|s| s.to_string()).collect(),
            extra_info: None,
            product_url: None,
            site: None,
            scraped_at: Utc::now(),
        }
    }

    #[test]
    fn batch_count_is_the_ceiling() {
        assert_eq!(batch_count(5, 2), 3);
        assert_eq!(batch_count(4, 2), 2);
        assert_eq!(batch_count(0, 2), 0);
    }

    #[tokio::test]
    async fn products_are_never_in_flight_concurrently() {
        let api = MockApi::default();
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());
        let products: Vec<ProductRecord> = (0..5)
            .map(|i| record(&format!("X-{i}"), &["url1"]))
            .collect();

        let summary = scheduler.run_all(&products).await;
        assert_eq!(summary.succeeded, 5);

        let windows = api.create_windows.lock().unwrap();
        assert_eq!(windows.len(), 5);
        for pair in windows.windows(2) {
            // The next call starts only after the previous one ended.
            assert!(pair[1].0 >= pair[0].1);
        }
    }

    #[tokio::test]
    async fn block_rotates_identity_and_waits_at_least_the_base_backoff() {
        let api = MockApi::default();
        api.create_errors
            .lock()
            .unwrap()
            .push_back(CmsApiError::Blocked);
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());

        let started = Instant::now();
        let summary = scheduler.run_all(&[record("X-1", &["url1"])]).await;
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(api.rotations.load(Ordering::SeqCst), 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.reports[0].attempts, 2);
    }

    #[tokio::test]
    async fn rate_limits_use_the_fixed_cooldown() {
        let api = MockApi::default();
        api.create_errors
            .lock()
            .unwrap()
            .push_back(CmsApiError::RateLimited);
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());

        let started = Instant::now();
        let summary = scheduler.run_all(&[record("X-1", &["url1"])]).await;
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(api.rotations.load(Ordering::SeqCst), 0);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let api = MockApi::default();
        api.create_errors
            .lock()
            .unwrap()
            .push_back(CmsApiError::Unexpected("HTTP 418".into()));
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());

        let summary = scheduler.run_all(&[record("X-1", &["url1"])]).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.reports[0].attempts, 1);
        assert_eq!(
            summary.reports[0].outcome,
            UploadOutcome::Failed {
                error: "unexpected response: HTTP 418".into(),
                retries_exhausted: false,
            }
        );
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_product_and_the_run_continues() {
        let api = MockApi::default();
        {
            let mut errors = api.create_errors.lock().unwrap();
            for _ in 0..3 {
                errors.push_back(CmsApiError::Server(503));
            }
        }
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());

        let summary = scheduler
            .run_all(&[record("X-1", &["url1"]), record("X-2", &["url1"])])
            .await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        let failed = &summary.reports[0];
        assert_eq!(failed.attempts, 3);
        assert!(matches!(
            failed.outcome,
            UploadOutcome::Failed {
                retries_exhausted: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn the_x1_scenario_counts_initial_and_deferred_images() {
        let api = MockApi::default();
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());

        let summary = scheduler
            .run_all(&[record("X-1", &["url1", "url2", "url3"])])
            .await;
        assert_eq!(summary.succeeded, 1);
        let report = &summary.reports[0];
        assert_eq!(report.outcome, UploadOutcome::Created { id: 1 });
        assert_eq!(
            report.deferred,
            Some(crate::models::DeferredReport {
                processed: 1,
                errors: 0,
                total: 1,
            })
        );
    }

    #[tokio::test]
    async fn skipped_records_are_tallied_separately() {
        let api = MockApi::default();
        let stager = FakeStager::new();
        let scheduler = BatchScheduler::new(&api, &stager, options_zero());

        let summary = scheduler.run_all(&[record("X-1", &[])]).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            summary.reports[0].outcome,
            UploadOutcome::Skipped {
                reason: SkipReason::NoImages
            }
        );
    }
}
