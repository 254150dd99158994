use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteConfigError {
    #[error("site `{site}`: field `{field}` has no selectors")]
    NoSelectors { site: String, field: &'static str },
    #[error("site `{site}`: field `{field}` has a blank selector")]
    BlankSelector { site: String, field: &'static str },
    #[error("site `{site}`: attribute extraction for `{field}` needs an attribute name")]
    MissingAttribute { site: String, field: &'static str },
    #[error("site `{site}`: invalid catalog url `{url}`")]
    InvalidCatalogUrl { site: String, url: String },
    #[error("site `{site}`: reference prefix must be non-empty and end with `-`")]
    BadReferencePrefix { site: String },
}

/// How a field is pulled out of a product page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionKind {
    Text,
    Attribute,
    ImageList,
    ColorSwatch,
    Price,
    StructuredScript,
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    /// Candidate selectors, tried in order until one yields a value.
    pub selectors: Vec<String>,
    pub kind: ExtractionKind,
    pub required: bool,
    /// Attribute name for `Attribute` extraction; JSON key for
    /// `StructuredScript`.
    pub attribute: Option<String>,
}

impl FieldRule {
    fn new(kind: ExtractionKind, required: bool, selectors: &[&str]) -> Self {
        Self {
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            kind,
            required,
            attribute: None,
        }
    }

    pub fn text(selectors: &[&str]) -> Self {
        Self::new(ExtractionKind::Text, true, selectors)
    }

    pub fn optional_text(selectors: &[&str]) -> Self {
        Self::new(ExtractionKind::Text, false, selectors)
    }

    pub fn images(selectors: &[&str]) -> Self {
        Self::new(ExtractionKind::ImageList, true, selectors)
    }

    pub fn swatches(selectors: &[&str]) -> Self {
        Self::new(ExtractionKind::ColorSwatch, true, selectors)
    }

    pub fn price(selectors: &[&str]) -> Self {
        Self::new(ExtractionKind::Price, false, selectors)
    }
}

#[derive(Debug, Clone)]
pub struct ScrollSettings {
    pub step: u32,
    pub delay: Duration,
    pub max_rounds: u32,
}

/// One selector rule per record field.
#[derive(Debug, Clone)]
pub struct FieldRules {
    pub reference: FieldRule,
    pub name: FieldRule,
    pub description: FieldRule,
    pub colors: FieldRule,
    pub images: FieldRule,
    pub categories: FieldRule,
    pub extra_info: FieldRule,
    pub price: FieldRule,
}

impl FieldRules {
    fn iter(&self) -> [(&'static str, &FieldRule); 8] {
        [
            ("reference", &self.reference),
            ("name", &self.name),
            ("description", &self.description),
            ("colors", &self.colors),
            ("images", &self.images),
            ("categories", &self.categories),
            ("extra_info", &self.extra_info),
            ("price", &self.price),
        ]
    }
}

/// Typed scraping configuration for one catalog site, validated when loaded
/// rather than discovered broken mid-scrape.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub key: &'static str,
    pub name: &'static str,
    pub catalog_url: String,
    pub product_grid_selector: String,
    pub product_link_selector: String,
    pub reference_prefix: String,
    pub scroll: ScrollSettings,
    pub fields: FieldRules,
}

impl SiteConfig {
    pub fn validate(&self) -> Result<(), SiteConfigError> {
        let site = self.name.to_string();
        if reqwest::Url::parse(&self.catalog_url).is_err() {
            return Err(SiteConfigError::InvalidCatalogUrl {
                site,
                url: self.catalog_url.clone(),
            });
        }
        if self.reference_prefix.is_empty() || !self.reference_prefix.ends_with('-') {
            return Err(SiteConfigError::BadReferencePrefix { site });
        }
        for (field, rule) in self.fields.iter() {
            if rule.required && rule.selectors.is_empty() {
                return Err(SiteConfigError::NoSelectors {
                    site: self.name.to_string(),
                    field,
                });
            }
            if rule.selectors.iter().any(|s| s.trim().is_empty()) {
                return Err(SiteConfigError::BlankSelector {
                    site: self.name.to_string(),
                    field,
                });
            }
            if rule.kind == ExtractionKind::Attribute && rule.attribute.is_none() {
                return Err(SiteConfigError::MissingAttribute {
                    site: self.name.to_string(),
                    field,
                });
            }
        }
        Ok(())
    }
}

pub fn builtin_sites() -> Vec<SiteConfig> {
    vec![spot_gifts(), xbz_brindes()]
}

pub fn find_site(name: &str) -> Option<SiteConfig> {
    let needle = name.trim().to_lowercase().replace(' ', "-");
    builtin_sites()
        .into_iter()
        .find(|site| site.key == needle || site.name.to_lowercase().contains(&needle))
}

fn spot_gifts() -> SiteConfig {
    SiteConfig {
        key: "spot-gifts",
        name: "Spot Gifts",
        catalog_url: "https://www.spotgifts.com.br/pt/catalogo/".into(),
        product_grid_selector: "#produtos-wrap".into(),
        product_link_selector: ".produto a".into(),
        reference_prefix: "SP-".into(),
        scroll: ScrollSettings {
            step: 1000,
            delay: Duration::from_millis(1500),
            max_rounds: 100,
        },
        fields: FieldRules {
            reference: FieldRule::text(&[".ref", "[class*=\"ref\"]"]),
            name: FieldRule::text(&["h1.titulo", "h1", ".titulo"]),
            description: FieldRule::text(&[".texto", ".produto-description", ".description"]),
            colors: FieldRule::swatches(&[".color"]),
            images: FieldRule::images(&[".img-wrap.center img"]),
            categories: FieldRule::optional_text(&[".breadcrumb li", ".produto-categories li"]),
            extra_info: FieldRule::optional_text(&[".conteudo .caracteristica"]),
            price: FieldRule::price(&[".produto-price", ".price", ".current-price"]),
        },
    }
}

fn xbz_brindes() -> SiteConfig {
    SiteConfig {
        key: "xbz-brindes",
        name: "XBZ Brindes",
        catalog_url: "https://www.xbzbrindes.com.br/catalogo".into(),
        product_grid_selector: ".products-grid".into(),
        product_link_selector: ".product-item a.product-link".into(),
        reference_prefix: "XB-".into(),
        scroll: ScrollSettings {
            step: 1200,
            delay: Duration::from_millis(1800),
            max_rounds: 120,
        },
        fields: FieldRules {
            reference: FieldRule::text(&[".product-code", ".sku"]),
            name: FieldRule::text(&["h1.product-title", "h1"]),
            description: FieldRule::text(&[".product-description", ".descricao"]),
            colors: FieldRule::swatches(&[".color-option", ".cor-item"]),
            images: FieldRule::images(&[".product-gallery img"]),
            categories: FieldRule::optional_text(&[".breadcrumbs li"]),
            extra_info: FieldRule::optional_text(&[".product-specs"]),
            price: FieldRule::price(&[".product-price", ".preco"]),
        },
    }
}
