#![allow(dead_code)]

use crate::browser::{BrowserDriver, BrowserError};
use crate::models::{ProductRecord, RawColor, RawSwatch};
use crate::sites::{ExtractionKind, FieldRule, SiteConfig};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Walks one catalog site and turns its product pages into records. All DOM
/// access goes through the driver; this layer only decides what to ask for,
/// per the site's typed selector rules.
pub struct CatalogScraper<'a> {
    driver: &'a dyn BrowserDriver,
    config: &'a SiteConfig,
}

impl<'a> CatalogScraper<'a> {
    pub fn new(driver: &'a dyn BrowserDriver, config: &'a SiteConfig) -> Self {
        Self { driver, config }
    }

    pub async fn collect(&self) -> Result<Vec<ProductRecord>, BrowserError> {
        self.driver.navigate(&self.config.catalog_url).await?;
        self.driver
            .wait_for_element(&self.config.product_grid_selector, Duration::from_secs(10))
            .await?;

        let mut rounds = 0;
        while rounds < self.config.scroll.max_rounds {
            let more = self
                .driver
                .scroll(self.config.scroll.step, self.config.scroll.delay)
                .await?;
            if !more {
                break;
            }
            rounds += 1;
        }
        debug!(
            target = "catalog.scraper",
            site = self.config.name,
            rounds,
            "catalog fully loaded"
        );

        let links = self.product_links().await?;
        info!(
            target = "catalog.scraper",
            site = self.config.name,
            products = links.len(),
            "product links collected"
        );

        let mut records = Vec::with_capacity(links.len());
        for link in links {
            match self.extract_product(&link).await {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    target = "catalog.scraper",
                    site = self.config.name,
                    url = %link,
                    error = %err,
                    "product page skipped"
                ),
            }
        }
        Ok(records)
    }

    async fn product_links(&self) -> Result<Vec<String>, BrowserError> {
        let expr = format!(
            "Array.from(document.querySelectorAll('{}')).map(el => el.href).filter(Boolean)",
            js_quote(&self.config.product_link_selector)
        );
        let value = self.driver.evaluate(&expr).await?;
        Ok(string_list(&value))
    }

    async fn extract_product(&self, url: &str) -> Result<ProductRecord, BrowserError> {
        self.driver.navigate(url).await?;
        let fields = &self.config.fields;

        let reference_raw = self
            .first_value(&fields.reference)
            .await?
            .and_then(|v| value_text(&v))
            .unwrap_or_default();
        let reference = apply_prefix(&self.config.reference_prefix, reference_raw.trim());

        let name = self
            .first_value(&fields.name)
            .await?
            .and_then(|v| value_text(&v))
            .unwrap_or_default();
        let description = self
            .first_value(&fields.description)
            .await?
            .and_then(|v| value_text(&v))
            .unwrap_or_default();
        let extra_info = self
            .first_value(&fields.extra_info)
            .await?
            .and_then(|v| value_text(&v));
        let price = self
            .first_value(&fields.price)
            .await?
            .and_then(|v| value_text(&v))
            .as_deref()
            .and_then(parse_price);

        let categories = self
            .first_value(&fields.categories)
            .await?
            .map(|v| string_list(&v))
            .unwrap_or_default();
        let images = self
            .first_value(&fields.images)
            .await?
            .map(|v| string_list(&v))
            .unwrap_or_default();
        let colors = self
            .first_value(&fields.colors)
            .await?
            .map(|v| swatch_list(&v))
            .unwrap_or_default();

        Ok(ProductRecord {
            reference,
            name: name.trim().to_string(),
            description: description.trim().to_string(),
            price,
            categories,
            colors,
            images,
            extra_info,
            product_url: Some(url.to_string()),
            site: Some(self.config.key.to_string()),
            scraped_at: Utc::now(),
        })
    }

    /// Tries the rule's selectors in order until one yields a non-empty
    /// value.
    async fn first_value(&self, rule: &FieldRule) -> Result<Option<Value>, BrowserError> {
        for selector in &rule.selectors {
            let expr = extraction_expr(rule.kind, selector, rule.attribute.as_deref());
            let value = self.driver.evaluate(&expr).await?;
            if !value_is_empty(&value) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

fn extraction_expr(kind: ExtractionKind, selector: &str, attribute: Option<&str>) -> String {
    let sel = js_quote(selector);
    match kind {
        ExtractionKind::Text | ExtractionKind::Price => format!(
            "document.querySelector('{sel}')?.textContent?.trim() ?? null"
        ),
        ExtractionKind::Attribute => format!(
            "document.querySelector('{sel}')?.getAttribute('{}') ?? null",
            js_quote(attribute.unwrap_or(""))
        ),
        ExtractionKind::ImageList => format!(
            "Array.from(document.querySelectorAll('{sel}')).map(el => el.currentSrc || el.src).filter(Boolean)"
        ),
        ExtractionKind::ColorSwatch => format!(
            "Array.from(document.querySelectorAll('{sel}')).map(el => ({{ \
                name: el.getAttribute('title') || el.textContent?.trim() || null, \
                kind: el.dataset.kind || null, \
                code: el.dataset.code || null, \
                numeric_code: el.dataset.numericCode || null, \
                image_url: el.querySelector('img')?.src || el.dataset.image || null \
            }}))"
        ),
        ExtractionKind::StructuredScript => match attribute {
            Some(key) => format!(
                "JSON.parse(document.querySelector('{sel}')?.textContent ?? 'null')?.['{}'] ?? null",
                js_quote(key)
            ),
            None => format!(
                "JSON.parse(document.querySelector('{sel}')?.textContent ?? 'null')"
            ),
        },
    }
}

fn js_quote(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| value_text(item))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn swatch_list(value: &Value) -> Vec<RawColor> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(name) => Some(RawColor::Name(name.clone())),
                Value::Object(_) => serde_json::from_value::<RawSwatch>(item.clone())
                    .ok()
                    .map(RawColor::Swatch),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn apply_prefix(prefix: &str, reference: &str) -> String {
    if reference.is_empty() || reference.starts_with(prefix) {
        reference.to_string()
    } else {
        format!("{prefix}{reference}")
    }
}

/// Parses catalog prices, including the `R$ 1.234,56` shape where `.` is a
/// thousands separator.
fn parse_price(raw: &str) -> Option<f64> {
    let digits: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == ',' || *ch == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let normalized = if digits.contains(',') {
        digits.replace('.', "").replace(',', ".")
    } else {
        digits
    };
    normalized.parse().ok()
}
