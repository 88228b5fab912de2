//! Pipeline configuration, loadable from a JSON file or `MDX_*` environment variables.

use chrono_tz::Tz;
use mdx_types::{config_error, MdxResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::sources::{SourceConfig, SourceKind};

/// Trading timezone used when no other is configured
pub const DEFAULT_TIMEZONE: &str = "Asia/Kolkata";

/// Persistent store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Symbol-keyed JSON index plus a metadata sidecar
    Json,
    /// SQLite table keyed by symbol
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(StoreBackend::Json),
            "sqlite" | "db" => Ok(StoreBackend::Sqlite),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_backend(StoreBackend::Json)
    }
}

impl StoreConfig {
    /// Default location under the platform data directory
    pub fn for_backend(backend: StoreBackend) -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mdx");
        let file = match backend {
            StoreBackend::Json => "master_index.json",
            StoreBackend::Sqlite => "master.db",
        };
        Self { backend, path: data_dir.join(file) }
    }

    /// Switch backends. A path still at the old backend's default moves to
    /// the new default; an explicitly chosen path is kept.
    pub fn with_backend(self, backend: StoreBackend) -> Self {
        if self.path == Self::for_backend(self.backend).path {
            Self::for_backend(backend)
        } else {
            Self { backend, path: self.path }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterDataConfig {
    pub source: SourceConfig,
    pub store: StoreConfig,
    /// IANA timezone whose calendar date defines freshness
    pub timezone: String,
    pub max_concurrent_downloads: usize,
    /// Raw CSV downloads are copied here when set
    pub archive_dir: Option<PathBuf>,
}

impl Default for MasterDataConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            max_concurrent_downloads: 4,
            archive_dir: None,
        }
    }
}

impl MasterDataConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> MdxResult<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it, for callers that still
    /// apply overrides.
    pub fn read_file<P: AsRef<Path>>(path: P) -> MdxResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error!("Failed to read config {}: {}", path.display(), e))?;
        serde_json::from_str(&raw).map_err(|e| config_error!("Invalid config {}: {}", path.display(), e))
    }

    /// Build from `MDX_*` variables on top of the defaults.
    pub fn from_env() -> MdxResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_vars<F>(lookup: F) -> MdxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::read_vars(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MDX_*` variables without validating the result.
    pub fn read_vars<F>(lookup: F) -> MdxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(base_url) = var("MDX_BASE_URL") {
            config.source.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(path) = var("MDX_CATALOG_PATH") {
            config.source.catalog_path = path;
        }
        for (key, header) in [
            ("MDX_AUTHORIZATION", "Authorization"),
            ("MDX_AUTH", "Auth"),
            ("MDX_SID", "Sid"),
            ("MDX_FIN_KEY", "neo-fin-key"),
        ] {
            if let Some(value) = var(key) {
                config.source.headers.insert(header.to_string(), value);
            }
        }
        if let Some(secs) = var("MDX_TIMEOUT_SECS") {
            config.source.timeout_secs = secs
                .parse()
                .map_err(|_| config_error!("MDX_TIMEOUT_SECS must be an integer, got '{}'", secs))?;
        }
        if let Some(dir) = var("MDX_SOURCE_DIR") {
            config.source.kind = SourceKind::Local { directory: PathBuf::from(dir) };
        }
        if let Some(backend) = var("MDX_STORE_BACKEND") {
            let backend = backend.parse::<StoreBackend>().map_err(|e| config_error!("{}", e))?;
            config.store = config.store.with_backend(backend);
        }
        if let Some(path) = var("MDX_STORE_PATH") {
            config.store.path = PathBuf::from(path);
        }
        if let Some(tz) = var("MDX_TIMEZONE") {
            config.timezone = tz;
        }
        if let Some(dir) = var("MDX_ARCHIVE_DIR") {
            config.archive_dir = Some(PathBuf::from(dir));
        }
        if let Some(n) = var("MDX_MAX_CONCURRENT") {
            config.max_concurrent_downloads = n
                .parse()
                .map_err(|_| config_error!("MDX_MAX_CONCURRENT must be an integer, got '{}'", n))?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> MdxResult<()> {
        self.trading_timezone()?;
        if self.max_concurrent_downloads == 0 {
            return Err(config_error!("max_concurrent_downloads must be at least 1"));
        }
        if self.source.kind == SourceKind::Http && self.source.base_url.trim().is_empty() {
            return Err(config_error!("HTTP source requires a base_url (set MDX_BASE_URL)"));
        }
        Ok(())
    }

    pub fn trading_timezone(&self) -> MdxResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| config_error!("Unknown timezone: {}", self.timezone))
    }
}

/// Command-line overrides layered on a file or environment config
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub backend: Option<StoreBackend>,
    pub store_path: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Apply on top of `config` and validate the merged result.
    pub fn apply(&self, mut config: MasterDataConfig) -> MdxResult<MasterDataConfig> {
        if let Some(backend) = self.backend {
            config.store = config.store.with_backend(backend);
        }
        if let Some(path) = &self.store_path {
            config.store.path = path.clone();
        }
        if let Some(dir) = &self.source_dir {
            config.source.kind = SourceKind::Local { directory: dir.clone() };
        }
        if let Some(dir) = &self.archive_dir {
            config.archive_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }
}
