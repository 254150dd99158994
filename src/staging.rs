use crate::http::{self, build_client};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed with HTTP {0}")]
    Status(u16),
    #[error("download timed out")]
    Timeout,
    #[error("download request failed: {0}")]
    Network(String),
    #[error("could not persist staged file: {0}")]
    Io(#[from] std::io::Error),
}

/// A remote image persisted to the local staging directory so it can be
/// attached to a multipart request.
///
/// The staged file is owned by this value from creation to release: it is
/// attached to exactly one outgoing request and removed deterministically
/// once that request finishes, whatever its outcome. Failure to delete is
/// logged, never raised.
#[derive(Debug)]
pub struct StagedImage {
    pub source_url: String,
    pub local_path: PathBuf,
    pub created_at: DateTime<Utc>,
    released: bool,
}

impl StagedImage {
    pub fn new(source_url: impl Into<String>, local_path: PathBuf) -> Self {
        Self {
            source_url: source_url.into(),
            local_path,
            created_at: Utc::now(),
            released: false,
        }
    }

    pub async fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.local_path).await
    }

    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.jpg".to_string())
    }

    pub fn mime(&self) -> &'static str {
        guess_mime(&self.local_path)
    }

    /// Removes the staged file now. Consumes the value so a file cannot be
    /// attached again after release.
    pub fn release(mut self) {
        self.remove_now();
    }

    fn remove_now(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = std::fs::remove_file(&self.local_path) {
            warn!(
                target = "catalog.staging",
                path = %self.local_path.display(),
                error = %err,
                "failed to remove staged file"
            );
        } else {
            debug!(
                target = "catalog.staging",
                path = %self.local_path.display(),
                "staged file removed"
            );
        }
    }
}

impl Drop for StagedImage {
    fn drop(&mut self) {
        self.remove_now();
    }
}

#[async_trait]
pub trait ImageStager: Send + Sync {
    /// Downloads `source_url` into the staging directory. `key` identifies
    /// the owner (product reference plus image index, or a color key) and
    /// becomes part of the unique filename.
    async fn stage(&self, key: &str, source_url: &str) -> Result<StagedImage, DownloadError>;
}

/// Downloads remote images into a shared staging directory with unique,
/// collision-free filenames.
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn from_env() -> std::io::Result<Self> {
        let dir = std::env::var("STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("catalog-sync-staging"));
        Self::new(dir)
    }

    fn unique_path(&self, key: &str, source_url: &str) -> PathBuf {
        let serial = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}_{serial}.{}",
            sanitize_key(key),
            extension_for(source_url)
        );
        self.dir.join(name)
    }
}

#[async_trait]
impl ImageStager for ImageStore {
    async fn stage(&self, key: &str, source_url: &str) -> Result<StagedImage, DownloadError> {
        let client = build_client(http::identity(0));
        let response = client.get(source_url).send().await.map_err(|err| {
            if err.is_timeout() {
                DownloadError::Timeout
            } else {
                DownloadError::Network(err.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status().as_u16()));
        }

        let bytes = response.bytes().await.map_err(|err| {
            if err.is_timeout() {
                DownloadError::Timeout
            } else {
                DownloadError::Network(err.to_string())
            }
        })?;

        let path = self.unique_path(key, source_url);
        tokio::fs::write(&path, &bytes).await?;
        debug!(
            target = "catalog.staging",
            url = source_url,
            path = %path.display(),
            bytes = bytes.len(),
            "image staged"
        );
        Ok(StagedImage::new(source_url, path))
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_for(source_url: &str) -> &'static str {
    let path = source_url.split(['?', '#']).next().unwrap_or(source_url);
    match path.rsplit('.').next().map(str::to_ascii_lowercase) {
        Some(ext) if ext == "png" => "png",
        Some(ext) if ext == "webp" => "webp",
        Some(ext) if ext == "gif" => "gif",
        Some(ext) if ext == "jpeg" => "jpeg",
        _ => "jpg",
    }
}

pub fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_paths_never_collide_for_the_same_key() {
        let store = ImageStore::new(std::env::temp_dir().join("catalog-sync-test")).unwrap();
        let a = store.unique_path("SP-1-0", "https://x/a.jpg");
        let b = store.unique_path("SP-1-0", "https://x/a.jpg");
        assert_ne!(a, b);
    }

    #[test]
    fn keys_are_sanitized_for_the_filesystem() {
        assert_eq!(sanitize_key("SP-94/690 blue"), "SP-94_690_blue");
    }

    #[test]
    fn extension_ignores_query_strings() {
        assert_eq!(extension_for("https://x/swatch.png?v=2"), "png");
        assert_eq!(extension_for("https://x/photo"), "jpg");
    }

    #[test]
    fn release_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.jpg");
        std::fs::write(&path, b"img").unwrap();
        let staged = StagedImage::new("https://x/a.jpg", path.clone());
        staged.release();
        assert!(!path.exists());
    }

    #[test]
    fn drop_is_a_backstop_for_unreleased_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaked.jpg");
        std::fs::write(&path, b"img").unwrap();
        {
            let _staged = StagedImage::new("https://x/a.jpg", path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(guess_mime(Path::new("a.png")), "image/png");
        assert_eq!(guess_mime(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("a.bin")), "application/octet-stream");
    }
}
