use crate::models::{BatchSummary, ProductRecord, UploadOutcome};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("could not write export file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize export payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[allow(dead_code)]
pub fn write_products_json(
    dir: &Path,
    site: &str,
    records: &[ProductRecord],
) -> Result<PathBuf, ExportError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{site}_products_{}.json", timestamp()));
    fs::write(&path, serde_json::to_vec_pretty(records)?)?;
    info!(
        target = "catalog.export",
        path = %path.display(),
        records = records.len(),
        "products exported"
    );
    Ok(path)
}

pub fn write_summary_json(dir: &Path, summary: &BatchSummary) -> Result<PathBuf, ExportError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("upload_summary_{}.json", timestamp()));
    fs::write(&path, serde_json::to_vec_pretty(summary)?)?;
    Ok(path)
}

pub fn write_summary_csv(dir: &Path, summary: &BatchSummary) -> Result<PathBuf, ExportError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("upload_summary_{}.csv", timestamp()));
    let mut out = String::from(
        "reference,status,detail,attempts,deferred_processed,deferred_errors,timestamp\n",
    );
    for report in &summary.reports {
        let (processed, errors) = report
            .deferred
            .map(|d| (d.processed, d.errors))
            .unwrap_or((0, 0));
        out.push_str(&format!(
            "{},{},{},{},{processed},{errors},{}\n",
            csv_field(&report.reference),
            outcome_label(&report.outcome),
            csv_field(&outcome_detail(&report.outcome)),
            report.attempts,
            report.timestamp.to_rfc3339(),
        ));
    }
    fs::write(&path, out)?;
    Ok(path)
}

fn outcome_label(outcome: &UploadOutcome) -> &'static str {
    match outcome {
        UploadOutcome::Created { .. } => "created",
        UploadOutcome::Updated { .. } => "updated",
        UploadOutcome::Skipped { .. } => "skipped",
        UploadOutcome::Rejected { .. } => "rejected",
        UploadOutcome::Failed { .. } => "failed",
    }
}

fn outcome_detail(outcome: &UploadOutcome) -> String {
    match outcome {
        UploadOutcome::Created { id } | UploadOutcome::Updated { id } => format!("id={id}"),
        UploadOutcome::Skipped { reason } => format!("{reason:?}"),
        UploadOutcome::Rejected { reason } => format!("{reason:?}"),
        UploadOutcome::Failed {
            error,
            retries_exhausted,
        } => {
            if *retries_exhausted {
                format!("{error} (retries exhausted)")
            } else {
                error.clone()
            }
        }
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductReport, RawColor, SkipReason};
    use uuid::Uuid;

    fn summary() -> BatchSummary {
        let now = Utc::now();
        BatchSummary {
            run_id: Uuid::new_v4(),
            total: 2,
            succeeded: 1,
            failed: 0,
            rejected: 0,
            skipped: 1,
            started_at: now,
            finished_at: now,
            reports: vec![
                ProductReport {
                    reference: "SP-1".into(),
                    outcome: UploadOutcome::Created { id: 7 },
                    attempts: 1,
                    deferred: None,
                    timestamp: now,
                },
                ProductReport {
                    reference: "SP-2".into(),
                    outcome: UploadOutcome::Skipped {
                        reason: SkipReason::NoImages,
                    },
                    attempts: 1,
                    deferred: None,
                    timestamp: now,
                },
            ],
        }
    }

    #[test]
    fn summary_json_round_trips_as_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_summary_json(dir.path(), &summary()).unwrap();
        let raw = fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["reports"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn summary_csv_has_a_row_per_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_summary_csv(dir.path(), &summary()).unwrap();
        let raw = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("SP-1,created,id=7,1,"));
        assert!(lines[2].starts_with("SP-2,skipped,NoImages,1,"));
    }

    #[test]
    fn csv_fields_with_commas_are_quoted() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("plain"), "plain");
    }

    #[test]
    fn products_export_writes_the_records() {
        let dir = tempfile::tempdir().unwrap();
        let record = ProductRecord {
            reference: "SP-1".into(),
            name: "Mug".into(),
            description: "Desc".into(),
            price: None,
            categories: vec![],
            colors: vec![RawColor::Name("Black".into())],
            images: vec!["https://x/a.jpg".into()],
            extra_info: None,
            product_url: None,
            site: Some("spot-gifts".into()),
            scraped_at: Utc::now(),
        };
        let path = write_products_json(dir.path(), "spot-gifts", &[record]).unwrap();
        let parsed: Vec<ProductRecord> =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].reference, "SP-1");
    }
}
