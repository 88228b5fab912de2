use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Catalog path of the brokerage endpoint that lists master CSV files
pub const DEFAULT_CATALOG_PATH: &str = "/script-details/1.0/masterscrip/file-paths";

/// Where master files come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Catalog endpoint plus per-URL downloads
    Http,
    /// A directory of previously downloaded CSV files
    Local { directory: PathBuf },
}

/// Remote source configuration.
///
/// Credentials are supplied externally as plain headers; the login flow that
/// produces them is not part of this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub base_url: String,
    pub catalog_path: String,
    pub headers: HashMap<String, String>,
    /// Per-request timeout, applied to every attempt
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Initial backoff, doubled after each failed attempt
    pub retry_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Http,
            base_url: String::new(),
            catalog_path: DEFAULT_CATALOG_PATH.to_string(),
            headers: HashMap::new(),
            timeout_secs: 60,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl SourceConfig {
    pub fn http(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn local<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            kind: SourceKind::Local { directory: directory.into() },
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Upper bound on one file fetch including every retry and its backoff
    pub fn fetch_deadline(&self) -> Duration {
        let attempts = u64::from(self.max_retries).saturating_add(1);
        let requests_ms = self.timeout_secs.saturating_mul(1000).saturating_mul(attempts);
        let backoff_ms = self
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(self.max_retries).saturating_sub(1));
        Duration::from_millis(requests_ms.saturating_add(backoff_ms))
    }

    /// Full URL of the catalog endpoint
    pub fn catalog_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.catalog_path.starts_with("http://") || self.catalog_path.starts_with("https://") {
            self.catalog_path.clone()
        } else if self.catalog_path.starts_with('/') {
            format!("{}{}", base, self.catalog_path)
        } else {
            format!("{}/{}", base, self.catalog_path)
        }
    }
}

/// Configuration presets for known brokerage catalogs
pub struct DataSources;

impl DataSources {
    /// Kotak Neo trade API: session headers come from an external login.
    pub fn kotak_neo(base_url: &str, authorization: &str, auth: &str, sid: &str) -> SourceConfig {
        SourceConfig::http(base_url)
            .with_header("Authorization", authorization)
            .with_header("Auth", auth)
            .with_header("Sid", sid)
            .with_header("neo-fin-key", "neotradeapi")
    }

    pub fn csv_directory(path: &str) -> SourceConfig {
        SourceConfig::local(path)
    }
}
