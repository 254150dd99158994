use crate::models::{RawColor, RawSwatch};
use crate::staging::{ImageStager, StagedImage};
use tracing::warn;

/// A color ready for transmission. The API vocabulary only knows `code` and
/// `image`; everything the scrapers produce is funneled into those two.
#[derive(Debug)]
pub struct ColorDescriptor {
    pub name: String,
    pub kind: ColorKind,
}

#[derive(Debug)]
pub enum ColorKind {
    Code {
        code: String,
        numeric_code: Option<String>,
    },
    Image {
        staged: StagedImage,
    },
}

impl ColorDescriptor {
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            ColorKind::Code { .. } => "code",
            ColorKind::Image { .. } => "image",
        }
    }

    fn code(name: String, code: String, numeric_code: Option<String>) -> Self {
        Self {
            name,
            kind: ColorKind::Code { code, numeric_code },
        }
    }

    /// Releases any staged swatch file owned by this descriptor.
    pub fn release(self) {
        if let ColorKind::Image { staged } = self.kind {
            staged.release();
        }
    }
}

/// Normalizes raw scrape colors into API-facing descriptors.
///
/// Image swatches are resolved through the stager; a swatch that fails to
/// stage degrades to a `code` color rather than failing the product. Output
/// order matches input order. No error escapes this function.
pub async fn normalize_colors(
    stager: &dyn ImageStager,
    reference: &str,
    raw: &[RawColor],
) -> Vec<ColorDescriptor> {
    let mut normalized = Vec::with_capacity(raw.len());
    for (index, color) in raw.iter().enumerate() {
        let descriptor = match color {
            RawColor::Name(name) => {
                ColorDescriptor::code(name.trim().to_string(), String::new(), None)
            }
            RawColor::Swatch(swatch) => {
                normalize_swatch(stager, reference, index, swatch).await
            }
        };
        normalized.push(descriptor);
    }
    normalized
}

async fn normalize_swatch(
    stager: &dyn ImageStager,
    reference: &str,
    index: usize,
    swatch: &RawSwatch,
) -> ColorDescriptor {
    let name = swatch.name.clone().unwrap_or_default();
    let code = swatch.code.clone().unwrap_or_default();
    let numeric_code = swatch.numeric_code.clone();

    let wants_image = match swatch.kind.as_deref().map(str::to_ascii_lowercase) {
        Some(kind) if kind == "image" => true,
        // `hex` is a scrape-side label; the API only speaks `code`.
        Some(kind) if kind == "code" || kind == "hex" => false,
        Some(other) => {
            warn!(
                target = "catalog.colors",
                reference,
                kind = %other,
                "unknown color kind, treating as code"
            );
            false
        }
        None => swatch.image_url.is_some(),
    };

    if wants_image {
        if let Some(url) = swatch.image_url.as_deref() {
            let key = format!("{reference}-color{index}");
            match stager.stage(&key, url).await {
                Ok(staged) => {
                    return ColorDescriptor {
                        name,
                        kind: ColorKind::Image { staged },
                    };
                }
                Err(err) => {
                    warn!(
                        target = "catalog.colors",
                        reference,
                        url = %url,
                        error = %err,
                        "color swatch staging failed, falling back to code"
                    );
                }
            }
        } else {
            warn!(
                target = "catalog.colors",
                reference, "image color without a source url, falling back to code"
            );
        }
    }

    ColorDescriptor::code(name, code, numeric_code)
}
