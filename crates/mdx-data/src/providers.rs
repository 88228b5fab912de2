use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdx_types::{config_error, DataError, MdxResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED};
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::sources::{SourceConfig, SourceKind};

/// Raw body of one source file plus its freshness metadata
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub url: String,
    pub bytes: Vec<u8>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Trait for master file sources (brokerage catalog, local directory, ...)
#[async_trait]
pub trait SourceAdapter: Send + Sync + std::fmt::Debug {
    /// List the URLs of every master CSV currently published
    async fn list_source_files(&self) -> MdxResult<Vec<String>>;

    /// Download one file together with its last-modified metadata
    async fn fetch_file_with_meta(&self, url: &str) -> MdxResult<FetchedFile>;

    /// Download one file
    async fn fetch_file(&self, url: &str) -> MdxResult<Vec<u8>> {
        Ok(self.fetch_file_with_meta(url).await?.bytes)
    }

    /// Get adapter name
    fn name(&self) -> &str;
}

/// Build the adapter described by a source configuration
pub fn source_from_config(config: &SourceConfig) -> MdxResult<Box<dyn SourceAdapter>> {
    match &config.kind {
        SourceKind::Http => Ok(Box::new(HttpSourceAdapter::new(config.clone())?)),
        SourceKind::Local { directory } => Ok(Box::new(LocalSourceAdapter::new(directory))),
    }
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    data: Option<CatalogData>,
}

#[derive(Debug, Deserialize)]
struct CatalogData {
    #[serde(rename = "filesPaths", default)]
    files_paths: Vec<String>,
}

/// HTTP adapter for a brokerage catalog endpoint
#[derive(Debug)]
pub struct HttpSourceAdapter {
    config: SourceConfig,
    client: Client,
}

impl HttpSourceAdapter {
    pub fn new(config: SourceConfig) -> MdxResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| config_error!("Invalid header name '{}': {}", name, e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| config_error!("Invalid value for header '{}': {}", name, e))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| config_error!("Failed to create HTTP client: {}", e))?;

        Ok(Self { config, client })
    }

    /// GET with retry and exponential backoff
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, DataError> {
        let mut attempt = 0;
        let mut delay = self.config.retry_delay_ms;

        loop {
            let error = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => DataError::Fetch {
                    url: url.to_string(),
                    message: format!("HTTP {}", resp.status()),
                },
                Err(e) if e.is_timeout() => DataError::Timeout {
                    url: url.to_string(),
                    seconds: self.config.timeout_secs,
                },
                Err(e) => DataError::Fetch {
                    url: url.to_string(),
                    message: e.to_string(),
                },
            };

            if attempt >= self.config.max_retries {
                return Err(error);
            }

            attempt += 1;
            warn!(
                "{} (attempt {}/{}), retrying in {} ms",
                error, attempt, self.config.max_retries, delay
            );
            sleep(Duration::from_millis(delay)).await;
            delay = delay.saturating_mul(2);
        }
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    async fn list_source_files(&self) -> MdxResult<Vec<String>> {
        let url = self.config.catalog_url();
        info!("Fetching master file list from {}", url);

        let resp = self.get_with_retry(&url).await?;
        let catalog: CatalogResponse = resp.json().await.map_err(|e| DataError::Fetch {
            url: url.clone(),
            message: format!("invalid catalog response: {}", e),
        })?;

        let files = catalog.data.map(|d| d.files_paths).unwrap_or_default();
        debug!("Catalog listed {} files", files.len());
        Ok(files)
    }

    async fn fetch_file_with_meta(&self, url: &str) -> MdxResult<FetchedFile> {
        let resp = self.get_with_retry(url).await?;
        let last_modified = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                DataError::Timeout { url: url.to_string(), seconds: self.config.timeout_secs }
            } else {
                DataError::Fetch { url: url.to_string(), message: e.to_string() }
            }
        })?;

        Ok(FetchedFile {
            url: url.to_string(),
            bytes: bytes.to_vec(),
            last_modified,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Parse an RFC 2822 / IMF-fixdate header value such as `Wed, 21 Oct 2015 07:28:00 GMT`
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Filesystem adapter: every `*.csv` in a directory, ordered by file name
#[derive(Debug)]
pub struct LocalSourceAdapter {
    directory: PathBuf,
}

impl LocalSourceAdapter {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self { directory: directory.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl SourceAdapter for LocalSourceAdapter {
    async fn list_source_files(&self) -> MdxResult<Vec<String>> {
        let to_fetch_error = |e: std::io::Error| DataError::Fetch {
            url: self.directory.display().to_string(),
            message: e.to_string(),
        };
        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(to_fetch_error)?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(to_fetch_error)? {
            let path = entry.path();
            let is_csv = path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if is_csv && entry.file_type().await.map_err(to_fetch_error)?.is_file() {
                files.push(path.display().to_string());
            }
        }
        files.sort();

        info!("Found {} master files in {}", files.len(), self.directory.display());
        Ok(files)
    }

    async fn fetch_file_with_meta(&self, url: &str) -> MdxResult<FetchedFile> {
        let to_fetch_error = |e: std::io::Error| DataError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };
        let bytes = tokio::fs::read(url).await.map_err(to_fetch_error)?;
        let last_modified = tokio::fs::metadata(url)
            .await
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(FetchedFile { url: url.to_string(), bytes, last_modified })
    }

    fn name(&self) -> &str {
        "local"
    }
}
