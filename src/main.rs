mod browser;
mod cms;
mod colors;
mod deferred;
mod export;
mod http;
mod models;
mod retry;
mod scheduler;
mod scraper;
mod sites;
mod staging;
mod uploader;

use cms::{CmsClient, Session};
use eyre::{WrapErr, eyre};
use models::ProductRecord;
use scheduler::{BatchScheduler, SchedulerOptions};
use serde::Deserialize;
use staging::ImageStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catalog.cli", "run failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    match Command::parse(std::env::args().skip(1))? {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::ListSites => list_sites(),
        Command::CheckApi => check_api().await,
        Command::Sync {
            input,
            output,
            site,
        } => sync(&input, &output, site.as_deref()).await,
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    ListSites,
    CheckApi,
    Sync {
        input: PathBuf,
        output: PathBuf,
        site: Option<String>,
    },
}

impl Command {
    fn parse(args: impl Iterator<Item = String>) -> eyre::Result<Self> {
        let mut input = std::env::var("SYNC_INPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("scraped"));
        let mut output = std::env::var("SYNC_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("reports"));
        let mut site = None;

        let args: Vec<String> = args.collect();
        let mut index = 0;
        while index < args.len() {
            match args[index].as_str() {
                "--help" | "-h" => return Ok(Command::Help),
                "--list-sites" => return Ok(Command::ListSites),
                "--check-api" => return Ok(Command::CheckApi),
                "--input" => {
                    input = PathBuf::from(take_value(&args, &mut index, "--input")?);
                }
                "--output" => {
                    output = PathBuf::from(take_value(&args, &mut index, "--output")?);
                }
                "--site" => {
                    site = Some(take_value(&args, &mut index, "--site")?);
                }
                other => return Err(eyre!("unknown argument `{other}`, see --help")),
            }
            index += 1;
        }

        Ok(Command::Sync {
            input,
            output,
            site,
        })
    }
}

fn take_value(args: &[String], index: &mut usize, flag: &str) -> eyre::Result<String> {
    *index += 1;
    args.get(*index)
        .cloned()
        .ok_or_else(|| eyre!("{flag} requires a value"))
}

fn print_help() {
    println!(
        "catalog-sync-rs — uploads scraped product catalogs to the CMS API

USAGE:
    catalog-sync-rs [OPTIONS]

OPTIONS:
    --input <dir>     Directory of scraped product JSON files (default: scraped)
    --output <dir>    Directory for run reports (default: reports)
    --site <name>     Only sync records scraped from this site
    --list-sites      List the configured catalog sites and exit
    --check-api       Run the API connectivity self-test and exit
    -h, --help        Show this help

Credentials come from CMS_USERNAME / CMS_PASSWORD (or a .env file)."
    );
}

fn list_sites() -> eyre::Result<()> {
    for site in sites::builtin_sites() {
        site.validate()
            .wrap_err_with(|| format!("site `{}` failed validation", site.name))?;
        info!(
            target = "catalog.cli",
            key = site.key,
            name = site.name,
            catalog = %site.catalog_url,
            prefix = %site.reference_prefix,
            "site configured"
        );
    }
    Ok(())
}

async fn check_api() -> eyre::Result<()> {
    let session = Arc::new(Session::from_env()?);
    let client = CmsClient::new(session);
    let stats = client
        .self_test()
        .await
        .wrap_err("api connectivity self-test failed")?;
    info!(target = "catalog.cli", payload = %stats, "api reachable");
    Ok(())
}

async fn sync(input: &Path, output: &Path, site: Option<&str>) -> eyre::Result<()> {
    let records = load_products(input, site)?;
    if records.is_empty() {
        warn!(
            target = "catalog.cli",
            input = %input.display(),
            "no product records to sync"
        );
        return Ok(());
    }
    let records = dedupe_by_reference(records);
    info!(
        target = "catalog.cli",
        records = records.len(),
        "starting sync"
    );

    let session = Arc::new(Session::from_env()?);
    let client = CmsClient::new(session);
    let store = ImageStore::from_env().wrap_err("could not prepare the staging directory")?;

    let scheduler = BatchScheduler::new(&client, &store, SchedulerOptions::from_env());
    let summary = scheduler.run_all(&records).await;

    let json_path = export::write_summary_json(output, &summary)?;
    let csv_path = export::write_summary_csv(output, &summary)?;
    info!(
        target = "catalog.cli",
        succeeded = summary.succeeded,
        failed = summary.failed,
        rejected = summary.rejected,
        skipped = summary.skipped,
        json = %json_path.display(),
        csv = %csv_path.display(),
        "sync finished"
    );
    Ok(())
}

/// Product files are either a bare array of records or an object with a
/// `products` array; both shapes occur in the wild.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProductFile {
    List(Vec<ProductRecord>),
    Wrapped { products: Vec<ProductRecord> },
}

impl ProductFile {
    fn into_records(self) -> Vec<ProductRecord> {
        match self {
            ProductFile::List(records) => records,
            ProductFile::Wrapped { products } => products,
        }
    }
}

fn load_products(dir: &Path, site: Option<&str>) -> eyre::Result<Vec<ProductRecord>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .wrap_err_with(|| format!("could not read input directory `{}`", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("could not read `{}`", path.display()))?;
        match serde_json::from_str::<ProductFile>(&raw) {
            Ok(file) => {
                let mut loaded = file.into_records();
                if let Some(wanted) = site {
                    loaded.retain(|record| record.site.as_deref() == Some(wanted));
                }
                info!(
                    target = "catalog.cli",
                    file = %path.display(),
                    records = loaded.len(),
                    "products loaded"
                );
                records.extend(loaded);
            }
            Err(err) => warn!(
                target = "catalog.cli",
                file = %path.display(),
                error = %err,
                "unrecognized product file skipped"
            ),
        }
    }
    Ok(records)
}

fn dedupe_by_reference(records: Vec<ProductRecord>) -> Vec<ProductRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.reference.clone()))
        .collect()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
