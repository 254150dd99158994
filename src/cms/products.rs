use crate::cms::auth::CmsAuthError;
use crate::cms::config::{
    create_product_url, product_by_reference_url, statistics_url, update_product_url,
};
use crate::cms::session::Session;
use crate::colors::{ColorDescriptor, ColorKind};
use crate::http::build_client;
use crate::models::{ProductRecord, RejectReason, RemoteProduct};
use crate::staging::StagedImage;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CmsApiError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unauthorized after token refresh")]
    Unauthorized,
    #[error("blocked by server defenses (HTTP 406)")]
    Blocked,
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("reference already exists")]
    Conflict,
    #[error("record rejected: {0:?}")]
    Validation(RejectReason),
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("staged file unreadable: {0}")]
    Staging(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
    #[error(transparent)]
    Auth(#[from] CmsAuthError),
}

impl CmsApiError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Maps a non-2xx upload response to the error taxonomy. 401 is handled by
/// the caller (token refresh), everything else lands here.
pub fn error_for_status(status: u16, body: &str) -> CmsApiError {
    match status {
        400 => {
            let code = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("code").and_then(Value::as_str).map(str::to_string));
            match code.as_deref().and_then(RejectReason::from_code) {
                Some(reason) => CmsApiError::Validation(reason),
                None => CmsApiError::Unexpected(format!("HTTP 400: {body}")),
            }
        }
        406 => CmsApiError::Blocked,
        409 => CmsApiError::Conflict,
        429 => CmsApiError::RateLimited,
        code if code >= 500 => CmsApiError::Server(code),
        code => CmsApiError::Unexpected(format!("HTTP {code}: {body}")),
    }
}

/// Everything needed to assemble one multipart product request: the scalar
/// fields from the record, normalized colors, and the staged image subset
/// for this request.
pub struct ProductDraft<'a> {
    pub record: &'a ProductRecord,
    pub colors: &'a [ColorDescriptor],
    pub images: &'a [StagedImage],
}

async fn build_form(draft: &ProductDraft<'_>) -> Result<Form, CmsApiError> {
    let record = draft.record;
    let mut form = Form::new()
        .text("reference", record.reference.clone())
        .text("name", record.name.clone())
        .text("description", record.description.clone());
    if let Some(price) = record.price {
        form = form.text("price", format!("{price:.2}"));
    }
    if let Some(extra) = &record.extra_info {
        form = form.text("extra_info", extra.clone());
    }
    for (i, category) in record.categories.iter().enumerate() {
        form = form.text(format!("categories[{i}]"), category.clone());
    }
    for (i, color) in draft.colors.iter().enumerate() {
        form = form
            .text(format!("colors[{i}][name]"), color.name.clone())
            .text(format!("colors[{i}][kind]"), color.kind_label());
        match &color.kind {
            ColorKind::Code { code, numeric_code } => {
                form = form.text(format!("colors[{i}][code]"), code.clone());
                if let Some(numeric) = numeric_code {
                    form = form.text(format!("colors[{i}][numeric_code]"), numeric.clone());
                }
            }
            ColorKind::Image { staged } => {
                form = form.part(format!("color_image_{i}"), image_part(staged).await?);
            }
        }
    }
    attach_images(form, draft.images).await
}

async fn attach_images(mut form: Form, images: &[StagedImage]) -> Result<Form, CmsApiError> {
    for (i, staged) in images.iter().enumerate() {
        form = form.part(format!("product_images[{i}]"), image_part(staged).await?);
    }
    Ok(form)
}

async fn image_part(staged: &StagedImage) -> Result<Part, CmsApiError> {
    let bytes = staged
        .read_bytes()
        .await
        .map_err(|err| CmsApiError::Staging(err.to_string()))?;
    Part::bytes(bytes)
        .file_name(staged.file_name())
        .mime_str(staged.mime())
        .map_err(|err| CmsApiError::Staging(err.to_string()))
}

/// The remote catalog surface the orchestration layer depends on. Split out
/// as a trait so the upload flow can be exercised against in-process doubles.
#[async_trait]
pub trait ProductApi: Send + Sync {
    /// Looks a product up by its unique reference. A 404 is the canonical
    /// not-found signal and is `Ok(None)`, never an error.
    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<RemoteProduct>, CmsApiError>;

    async fn create_product(&self, draft: ProductDraft<'_>) -> Result<u64, CmsApiError>;

    async fn update_product(&self, id: u64, draft: ProductDraft<'_>) -> Result<(), CmsApiError>;

    /// Appends one deferred batch of images to an existing product.
    async fn append_images(&self, id: u64, images: &[StagedImage]) -> Result<(), CmsApiError>;

    /// Switches the outgoing client identity string. Called by the retry
    /// controller after a defense-system block.
    fn rotate_identity(&self);
}

#[derive(Clone)]
pub struct CmsClient {
    session: Arc<Session>,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: u64,
}

impl CmsClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Connectivity self-test: authenticate, then fetch the diagnostics
    /// payload.
    pub async fn self_test(&self) -> Result<Value, CmsApiError> {
        self.statistics().await
    }

    pub async fn statistics(&self) -> Result<Value, CmsApiError> {
        let mut refreshed = false;
        loop {
            let token = self.session.bearer().await?;
            let client = build_client(self.session.user_agent());
            let response = client
                .get(statistics_url())
                .bearer_auth(&token)
                .send()
                .await
                .map_err(CmsApiError::from_reqwest)?;
            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                self.session.invalidate().await;
                refreshed = true;
                continue;
            }
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(CmsApiError::Unauthorized);
            }
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(error_for_status(status, &body));
            }
            return response.json().await.map_err(CmsApiError::from_reqwest);
        }
    }
}

#[async_trait]
impl ProductApi for CmsClient {
    async fn find_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<RemoteProduct>, CmsApiError> {
        let mut refreshed = false;
        loop {
            let token = self.session.bearer().await?;
            let client = build_client(self.session.user_agent());
            let response = client
                .get(product_by_reference_url(reference))
                .bearer_auth(&token)
                .send()
                .await
                .map_err(CmsApiError::from_reqwest)?;

            match response.status() {
                StatusCode::NOT_FOUND => return Ok(None),
                StatusCode::UNAUTHORIZED if !refreshed => {
                    self.session.invalidate().await;
                    refreshed = true;
                }
                StatusCode::UNAUTHORIZED => return Err(CmsApiError::Unauthorized),
                status if status.is_success() => {
                    let found: RemoteProduct =
                        response.json().await.map_err(CmsApiError::from_reqwest)?;
                    debug!(
                        target = "catalog.cms",
                        reference,
                        id = found.id,
                        "reference already on remote"
                    );
                    return Ok(Some(found));
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(error_for_status(status.as_u16(), &body));
                }
            }
        }
    }

    async fn create_product(&self, draft: ProductDraft<'_>) -> Result<u64, CmsApiError> {
        let mut refreshed = false;
        loop {
            let token = self.session.bearer().await?;
            let client = build_client(self.session.user_agent());
            let form = build_form(&draft).await?;
            let response = client
                .post(create_product_url())
                .bearer_auth(&token)
                .multipart(form)
                .send()
                .await
                .map_err(CmsApiError::from_reqwest)?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(target = "catalog.cms", "401 on create, refreshing token");
                self.session.invalidate().await;
                refreshed = true;
                continue;
            }
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(CmsApiError::Unauthorized);
            }
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(error_for_status(status, &body));
            }
            let created: CreatedResponse =
                response.json().await.map_err(CmsApiError::from_reqwest)?;
            return Ok(created.id);
        }
    }

    async fn update_product(&self, id: u64, draft: ProductDraft<'_>) -> Result<(), CmsApiError> {
        let mut refreshed = false;
        loop {
            let token = self.session.bearer().await?;
            let client = build_client(self.session.user_agent());
            let form = build_form(&draft).await?;
            let response = client
                .put(update_product_url(id))
                .bearer_auth(&token)
                .multipart(form)
                .send()
                .await
                .map_err(CmsApiError::from_reqwest)?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(target = "catalog.cms", "401 on update, refreshing token");
                self.session.invalidate().await;
                refreshed = true;
                continue;
            }
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(CmsApiError::Unauthorized);
            }
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(error_for_status(status, &body));
            }
            return Ok(());
        }
    }

    async fn append_images(&self, id: u64, images: &[StagedImage]) -> Result<(), CmsApiError> {
        let mut refreshed = false;
        loop {
            let token = self.session.bearer().await?;
            let client = build_client(self.session.user_agent());
            let form = attach_images(Form::new(), images).await?;
            let response = client
                .put(update_product_url(id))
                .bearer_auth(&token)
                .multipart(form)
                .send()
                .await
                .map_err(CmsApiError::from_reqwest)?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                self.session.invalidate().await;
                refreshed = true;
                continue;
            }
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(CmsApiError::Unauthorized);
            }
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(error_for_status(status, &body));
            }
            return Ok(());
        }
    }

    fn rotate_identity(&self) {
        self.session.rotate_identity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_400_maps_known_codes_to_rejections() {
        let err = error_for_status(400, r#"{"code": "missing_image"}"#);
        assert!(matches!(
            err,
            CmsApiError::Validation(RejectReason::MissingImage)
        ));
    }

    #[test]
    fn status_400_with_unknown_code_is_unexpected() {
        let err = error_for_status(400, r#"{"code": "tea_too_hot"}"#);
        assert!(matches!(err, CmsApiError::Unexpected(_)));
    }

    #[test]
    fn defense_block_and_rate_limit_are_distinct() {
        assert!(matches!(error_for_status(406, ""), CmsApiError::Blocked));
        assert!(matches!(error_for_status(429, ""), CmsApiError::RateLimited));
    }

    #[test]
    fn conflict_and_server_errors_map() {
        assert!(matches!(error_for_status(409, ""), CmsApiError::Conflict));
        assert!(matches!(error_for_status(502, ""), CmsApiError::Server(502)));
    }

    #[tokio::test]
    async fn form_builds_from_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SP-1_0.jpg");
        std::fs::write(&path, b"img").unwrap();
        let staged = StagedImage::new("https://x/a.jpg", path);

        let record = ProductRecord {
            reference: "SP-1".into(),
            name: "Mug".into(),
            description: "Desc".into(),
            price: Some(10.0),
            categories: vec!["Drinkware".into()],
            colors: vec![],
            images: vec!["https://x/a.jpg".into()],
            extra_info: None,
            product_url: None,
            site: None,
            scraped_at: chrono::Utc::now(),
        };
        let colors = vec![ColorDescriptor {
            name: "Black".into(),
            kind: ColorKind::Code {
                code: "#000".into(),
                numeric_code: None,
            },
        }];
        let images = vec![staged];
        let draft = ProductDraft {
            record: &record,
            colors: &colors,
            images: &images,
        };
        assert!(build_form(&draft).await.is_ok());
    }
}
