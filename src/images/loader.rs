//! Downloading remote images into the cache directory.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::error::{CacheError, Result};

/// Extension used when the reference does not carry a usable one
pub const DEFAULT_EXTENSION: &str = "jpg";

const PASSTHROUGH_SCHEMES: &[&str] = &["file://", "data:", "content://", "asset://"];

/// Whether a reference already points at something local or inline.
pub fn is_passthrough(reference: &str) -> bool {
    PASSTHROUGH_SCHEMES
        .iter()
        .any(|scheme| reference.starts_with(scheme))
        || Path::new(reference).is_absolute()
}

/// Extension of the reference's last path segment, ignoring query and fragment.
pub fn file_extension(reference: &str) -> String {
    let path = reference
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    // Skip scheme and authority so a bare host is not read as a filename
    let path = match path.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map_or("", |(_, p)| p),
        None => path,
    };
    let segment = path.rsplit('/').next().unwrap_or_default();

    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// What the transport reported for one download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// HTTP status (or equivalent) of the response
    pub status: u16,
    /// Where the body was written
    pub path: PathBuf,
}

impl DownloadOutcome {
    /// 2xx
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Network side of the cache.
///
/// Implementations write the body to `dest` and report the status. A
/// non-success status may come back as `Ok`; the cache checks it.
pub trait Downloader: Send + Sync + 'static {
    /// Fetch `url` into `dest`.
    fn download(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<DownloadOutcome>> + Send;
}

/// `reqwest`-backed downloader
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloader {
    /// Create a downloader with a 30s request timeout.
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    /// Use an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_to(&self, url: &str, part: &Path) -> Result<u16> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::Status(status.as_u16()));
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        tracing::debug!("Downloaded {url} ({written} bytes)");

        Ok(status.as_u16())
    }
}

impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<DownloadOutcome> {
        tracing::debug!("Downloading image: {url}");

        // Body goes to a sibling part file; only a complete body is renamed into place
        let part = part_path(dest);
        match self.fetch_to(url, &part).await {
            Ok(status) => {
                if let Err(e) = tokio::fs::rename(&part, dest).await {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(e.into());
                }
                Ok(DownloadOutcome {
                    status,
                    path: dest.to_path_buf(),
                })
            }
            Err(CacheError::Status(status)) => Ok(DownloadOutcome {
                status,
                path: dest.to_path_buf(),
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
