use crate::cms::{CmsApiError, ProductApi, ProductDraft};
use crate::colors::normalize_colors;
use crate::models::{ProductRecord, RejectReason, SkipReason, UploadOutcome};
use crate::staging::ImageStager;
use tracing::{info, warn};

/// Images that did not fit in the initial request's budget, to be delivered
/// by the deferred batch processor once the product exists remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImages {
    pub remote_id: u64,
    pub images: Vec<String>,
}

#[derive(Debug)]
pub struct UploadResult {
    pub outcome: UploadOutcome,
    pub pending: Option<PendingImages>,
}

impl UploadResult {
    fn terminal(outcome: UploadOutcome) -> Self {
        Self {
            outcome,
            pending: None,
        }
    }
}

/// Create/update state machine for a single product.
///
/// Only a small number of images ride along with the initial request: the
/// remote defense layer rejects multipart bodies past a size threshold, so
/// the record is created with a budgeted subset and the rest is handed to
/// the deferred processor. Returns `Ok` for every terminal outcome; `Err` is
/// reserved for error classes the retry controller may want to replay.
pub struct UploadPipeline<'a> {
    api: &'a dyn ProductApi,
    stager: &'a dyn ImageStager,
    initial_image_budget: usize,
}

impl<'a> UploadPipeline<'a> {
    pub fn new(api: &'a dyn ProductApi, stager: &'a dyn ImageStager) -> Self {
        Self::with_budget(api, stager, initial_budget_from_env())
    }

    pub fn with_budget(
        api: &'a dyn ProductApi,
        stager: &'a dyn ImageStager,
        initial_image_budget: usize,
    ) -> Self {
        Self {
            api,
            stager,
            initial_image_budget: initial_image_budget.max(1),
        }
    }

    pub async fn upload(&self, record: &ProductRecord) -> Result<UploadResult, CmsApiError> {
        if let Some(reason) = record.skip_reason() {
            info!(
                target = "catalog.upload",
                reference = %record.reference,
                ?reason,
                "record skipped before upload"
            );
            return Ok(UploadResult::terminal(UploadOutcome::Skipped { reason }));
        }

        // Existence check routes create vs update. Lookup failures degrade
        // to "not found": risking a duplicate beats stalling the whole run.
        let existing = match self.api.find_by_reference(&record.reference).await {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    target = "catalog.upload",
                    reference = %record.reference,
                    error = %err,
                    "existence check failed, assuming not found"
                );
                None
            }
        };

        let colors = normalize_colors(self.stager, &record.reference, &record.colors).await;

        let budget = self.initial_image_budget;
        let mut staged = Vec::new();
        for (index, url) in record.images.iter().take(budget).enumerate() {
            let key = format!("{}-img{index}", record.reference);
            match self.stager.stage(&key, url).await {
                Ok(image) => staged.push(image),
                Err(err) => warn!(
                    target = "catalog.upload",
                    reference = %record.reference,
                    url = %url,
                    error = %err,
                    "initial image failed to stage"
                ),
            }
        }

        if staged.is_empty() {
            for color in colors {
                color.release();
            }
            return Ok(UploadResult::terminal(UploadOutcome::Skipped {
                reason: SkipReason::NoValidImages,
            }));
        }

        let draft = ProductDraft {
            record,
            colors: &colors,
            images: &staged,
        };

        let sent = match &existing {
            Some(remote) => self
                .api
                .update_product(remote.id, draft)
                .await
                .map(|_| (remote.id, false)),
            None => self.api.create_product(draft).await.map(|id| (id, true)),
        };

        // Staged files are single-use: release them now that the request
        // has finished, whatever happened.
        let initial_sent = staged.len();
        for image in staged {
            image.release();
        }
        for color in colors {
            color.release();
        }

        match sent {
            Ok((id, created)) => {
                let remaining = record.images.len().saturating_sub(budget);
                info!(
                    target = "catalog.upload",
                    reference = %record.reference,
                    id,
                    action = if created { "created" } else { "updated" },
                    initial_images = initial_sent,
                    remaining_images = remaining,
                    "product sent"
                );
                let pending = (remaining > 0).then(|| PendingImages {
                    remote_id: id,
                    images: record.images[budget..].to_vec(),
                });
                let outcome = if created {
                    UploadOutcome::Created { id }
                } else {
                    UploadOutcome::Updated { id }
                };
                Ok(UploadResult { outcome, pending })
            }
            Err(CmsApiError::Validation(reason)) => {
                Ok(UploadResult::terminal(UploadOutcome::Rejected { reason }))
            }
            Err(CmsApiError::Conflict) => {
                // The existence check said "not found" moments ago; someone
                // else created the reference in between.
                warn!(
                    target = "catalog.upload",
                    reference = %record.reference,
                    "conflict on create despite existence check"
                );
                Ok(UploadResult::terminal(UploadOutcome::Rejected {
                    reason: RejectReason::AlreadyExistsConflict,
                }))
            }
            Err(other) => Err(other),
        }
    }
}

fn initial_budget_from_env() -> usize {
    std::env::var("CMS_INITIAL_IMAGE_BUDGET")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawColor, RemoteProduct};
    use crate::staging::{DownloadError, StagedImage};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

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

    struct FailingStager;

    #[async_trait]
    impl ImageStager for FailingStager {
        async fn stage(&self, _key: &str, _url: &str) -> Result<StagedImage, DownloadError> {
            Err(DownloadError::Status(500))
        }
    }

    #[derive(Default)]
    struct MockApi {
        remote: Mutex<HashMap<String, u64>>,
        next_id: AtomicU64,
        calls: Mutex<Vec<String>>,
        create_image_counts: Mutex<Vec<usize>>,
        fail_create_with: Mutex<Option<CmsApiError>>,
        fail_lookup_with: Mutex<Option<CmsApiError>>,
        rotations: AtomicUsize,
    }

    impl MockApi {
        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProductApi for MockApi {
        async fn find_by_reference(
            &self,
            reference: &str,
        ) -> Result<Option<RemoteProduct>, CmsApiError> {
            self.calls.lock().unwrap().push("find".into());
            if let Some(err) = self.fail_lookup_with.lock().unwrap().take() {
                return Err(err);
            }
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
            self.calls.lock().unwrap().push("create".into());
            if let Some(err) = self.fail_create_with.lock().unwrap().take() {
                return Err(err);
            }
            self.create_image_counts
                .lock()
                .unwrap()
                .push(draft.images.len());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.remote
                .lock()
                .unwrap()
                .insert(draft.record.reference.clone(), id);
            Ok(id)
        }

        async fn update_product(
            &self,
            _id: u64,
            _draft: ProductDraft<'_>,
        ) -> Result<(), CmsApiError> {
            self.calls.lock().unwrap().push("update".into());
            Ok(())
        }

        async fn append_images(
            &self,
            _id: u64,
            _images: &[StagedImage],
        ) -> Result<(), CmsApiError> {
            self.calls.lock().unwrap().push("append".into());
            Ok(())
        }

        fn rotate_identity(&self) {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(reference: &str, images: &[&str]) -> ProductRecord {
        ProductRecord {
            reference: reference.into(),
            name: "Mug".into(),
            description: "Steel mug".into(),
            price: Some(9.9),
            categories: vec!["Drinkware".into()],
            colors: vec![RawColor::Name("Black".into())],
            images: images.iter().map(|s| s.to_string()).collect(),
            extra_info: None,
            product_url: None,
            site: None,
            scraped_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_images_skip_without_any_network_call() {
        let api = MockApi::default();
        let stager = FakeStager::new();
        let pipeline = UploadPipeline::with_budget(&api, &stager, 2);

        let result = pipeline.upload(&record("X-1", &[])).await.unwrap();
        assert_eq!(
            result.outcome,
            UploadOutcome::Skipped {
                reason: SkipReason::NoImages
            }
        );
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn second_upload_routes_through_update() {
        let api = MockApi::default();
        let stager = FakeStager::new();
        let pipeline = UploadPipeline::with_budget(&api, &stager, 2);
        let rec = record("X-1", &["url1"]);

        let first = pipeline.upload(&rec).await.unwrap();
        assert_eq!(first.outcome, UploadOutcome::Created { id: 1 });

        let second = pipeline.upload(&rec).await.unwrap();
        assert_eq!(second.outcome, UploadOutcome::Updated { id: 1 });
        assert_eq!(api.calls(), vec!["find", "create", "find", "update"]);
    }

    #[tokio::test]
    async fn initial_request_carries_exactly_the_budget() {
        let api = MockApi::default();
        let stager = FakeStager::new();
        let pipeline = UploadPipeline::with_budget(&api, &stager, 2);
        let rec = record("X-1", &["url1", "url2", "url3"]);

        let result = pipeline.upload(&rec).await.unwrap();
        assert_eq!(result.outcome, UploadOutcome::Created { id: 1 });
        assert_eq!(*api.create_image_counts.lock().unwrap(), vec![2]);
        assert_eq!(
            result.pending,
            Some(PendingImages {
                remote_id: 1,
                images: vec!["url3".into()],
            })
        );
    }

    #[tokio::test]
    async fn conflict_on_create_is_a_rejection_not_an_error() {
        let api = MockApi::default();
        *api.fail_create_with.lock().unwrap() = Some(CmsApiError::Conflict);
        let stager = FakeStager::new();
        let pipeline = UploadPipeline::with_budget(&api, &stager, 2);

        let result = pipeline.upload(&record("X-1", &["url1"])).await.unwrap();
        assert_eq!(
            result.outcome,
            UploadOutcome::Rejected {
                reason: RejectReason::AlreadyExistsConflict
            }
        );
    }

    #[tokio::test]
    async fn lookup_failure_degrades_to_create() {
        let api = MockApi::default();
        *api.fail_lookup_with.lock().unwrap() = Some(CmsApiError::Server(503));
        let stager = FakeStager::new();
        let pipeline = UploadPipeline::with_budget(&api, &stager, 2);

        let result = pipeline.upload(&record("X-1", &["url1"])).await.unwrap();
        assert_eq!(result.outcome, UploadOutcome::Created { id: 1 });
        assert_eq!(api.calls(), vec!["find", "create"]);
    }

    #[tokio::test]
    async fn unstageable_images_skip_with_no_valid_images() {
        let api = MockApi::default();
        let pipeline = UploadPipeline::with_budget(&api, &FailingStager, 2);

        let result = pipeline.upload(&record("X-1", &["url1"])).await.unwrap();
        assert_eq!(
            result.outcome,
            UploadOutcome::Skipped {
                reason: SkipReason::NoValidImages
            }
        );
        assert_eq!(api.calls(), vec!["find"]);
    }

    #[tokio::test]
    async fn blocked_create_bubbles_to_the_retry_controller() {
        let api = MockApi::default();
        *api.fail_create_with.lock().unwrap() = Some(CmsApiError::Blocked);
        let stager = FakeStager::new();
        let pipeline = UploadPipeline::with_budget(&api, &stager, 2);

        let err = pipeline
            .upload(&record("X-1", &["url1"]))
            .await
            .expect_err("blocked should bubble");
        assert!(matches!(err, CmsApiError::Blocked));
    }
}
