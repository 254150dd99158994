use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use uuid::Uuid;

/// A product as extracted from a catalog page, before any normalization.
///
/// `reference` is the upsert key on the remote side and carries a
/// site-specific prefix (`SP-`, `XB-`). A record must hold at least one
/// image and one color before an upload is attempted; anything else is
/// filtered out locally without touching the network.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub reference: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub colors: Vec<RawColor>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub extra_info: Option<String>,
    #[serde(default)]
    pub product_url: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default = "Utc::now")]
    pub scraped_at: DateTime<Utc>,
}

impl ProductRecord {
    /// Local pre-flight check. Returns the reason a record cannot be sent,
    /// or `None` when it is ready for upload.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        if !self.missing_fields().is_empty() {
            return Some(SkipReason::InvalidFields);
        }
        if self.images.is_empty() {
            return Some(SkipReason::NoImages);
        }
        if self.colors.is_empty() {
            return Some(SkipReason::NoColors);
        }
        None
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.reference.trim().is_empty() {
            missing.push("reference");
        }
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.description.trim().is_empty() {
            missing.push("description");
        }
        missing
    }
}

/// Color descriptor as scraped. Catalog pages are inconsistent: some expose a
/// bare color name, others a swatch object with a hex code, a supplier
/// numeric code, or a swatch image URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawColor {
    Name(String),
    Swatch(RawSwatch),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSwatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub numeric_code: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Existing product on the remote side, as returned by the by-reference
/// lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProduct {
    pub id: u64,
    #[allow(dead_code)]
    #[serde(flatten)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Created { id: u64 },
    Updated { id: u64 },
    Skipped { reason: SkipReason },
    Rejected { reason: RejectReason },
    Failed { error: String, retries_exhausted: bool },
}

/// Reasons a record is dropped locally, before any network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoImages,
    NoColors,
    NoValidImages,
    InvalidFields,
}

/// Reasons the server refused a record. Terminal for that product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    MissingField,
    MissingImage,
    MissingColors,
    AlreadyExistsConflict,
}

impl RejectReason {
    /// Maps the error code the API puts in a 400 body.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "missing_field" | "missing_required_field" => Some(Self::MissingField),
            "missing_image" | "missing_images" => Some(Self::MissingImage),
            "missing_colors" => Some(Self::MissingColors),
            _ => None,
        }
    }
}

/// Follow-up image delivery counts for one product, reported out-of-band
/// from the create/update outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeferredReport {
    pub processed: usize,
    pub errors: usize,
    pub total: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ProductReport {
    pub reference: String,
    pub outcome: UploadOutcome,
    pub attempts: u32,
    pub deferred: Option<DeferredReport>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<ProductReport>,
}

impl BatchSummary {
    pub fn tally(&mut self, report: &ProductReport) {
        match &report.outcome {
            UploadOutcome::Created { .. } | UploadOutcome::Updated { .. } => self.succeeded += 1,
            UploadOutcome::Skipped { .. } => self.skipped += 1,
            UploadOutcome::Rejected { .. } => self.rejected += 1,
            UploadOutcome::Failed { .. } => self.failed += 1,
        }
    }
}
