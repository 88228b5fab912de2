use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdx_types::{CacheEntry, DataError, InstrumentRecord, MdxResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::catalog::SqliteIndexStore;
use crate::config::{StoreBackend, StoreConfig};

/// Current layout of the persisted JSON index
pub const DOCUMENT_VERSION: u32 = 1;

/// Durable home of the last built index.
///
/// One writer (the sync service), any number of readers. `save` must replace
/// the previous entry atomically: a reader sees either the old entry or the new
/// one, never a mix.
#[async_trait]
pub trait IndexStore: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` when nothing has been persisted yet; `StoreRead` when the
    /// artifact exists but cannot be decoded.
    async fn load(&self) -> MdxResult<Option<CacheEntry>>;

    async fn save(&self, entry: &CacheEntry) -> MdxResult<()>;

    async fn clear(&self) -> MdxResult<()>;

    fn name(&self) -> &str;
}

/// Open the backend selected by configuration
pub fn open_store(config: &StoreConfig) -> MdxResult<Arc<dyn IndexStore>> {
    tracing::info!("Opening {:?} store at {}", config.backend, config.path.display());
    match config.backend {
        StoreBackend::Json => Ok(Arc::new(JsonFileStore::new(&config.path))),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteIndexStore::open(&config.path)?)),
    }
}

/// Freshness metadata, kept beside the index so identical inputs produce an
/// identical index file.
#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    version: u32,
    built_at: DateTime<Utc>,
    record_count: usize,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn store_read(path: &Path, message: impl std::fmt::Display) -> DataError {
    DataError::StoreRead { message: format!("{}: {}", path.display(), message) }
}

/// Symbol-keyed JSON map of every record, plus a `<file>.meta.json` sidecar
/// holding the build time. Both are replaced via temp file + rename, index
/// first.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    meta_path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let meta_path = with_suffix(&path, ".meta.json");
        Self { path, meta_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    fn read_optional(path: &Path) -> MdxResult<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_read(path, e).into()),
        }
    }

    fn read_entry(path: &Path, meta_path: &Path) -> MdxResult<Option<CacheEntry>> {
        let (index_bytes, meta_bytes) = match (Self::read_optional(path)?, Self::read_optional(meta_path)?) {
            (None, None) => return Ok(None),
            (Some(index), Some(meta)) => (index, meta),
            (Some(_), None) => return Err(store_read(meta_path, "metadata file is missing").into()),
            (None, Some(_)) => return Err(store_read(path, "index file is missing").into()),
        };

        let meta: IndexMeta = serde_json::from_slice(&meta_bytes).map_err(|e| store_read(meta_path, e))?;
        if meta.version != DOCUMENT_VERSION {
            return Err(store_read(meta_path, format!("unsupported index version {}", meta.version)).into());
        }

        let records: BTreeMap<String, InstrumentRecord> =
            serde_json::from_slice(&index_bytes).map_err(|e| store_read(path, e))?;
        if meta.record_count != records.len() {
            return Err(store_read(
                path,
                format!(
                    "metadata declares {} records but the index holds {}",
                    meta.record_count,
                    records.len()
                ),
            )
            .into());
        }

        Ok(Some(CacheEntry::new(meta.built_at, records.into_values().collect())))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = with_suffix(path, ".tmp");
        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }

    async fn remove_if_present(path: &Path) -> MdxResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DataError::StoreWrite {
                message: format!("{}: {}", path.display(), e),
            }
            .into()),
        }
    }
}

#[async_trait]
impl IndexStore for JsonFileStore {
    async fn load(&self) -> MdxResult<Option<CacheEntry>> {
        let path = self.path.clone();
        let meta_path = self.meta_path.clone();
        tokio::task::spawn_blocking(move || Self::read_entry(&path, &meta_path))
            .await
            .map_err(|e| DataError::StoreRead { message: e.to_string() })?
    }

    async fn save(&self, entry: &CacheEntry) -> MdxResult<()> {
        let by_symbol: BTreeMap<&str, &InstrumentRecord> =
            entry.records.iter().map(|r| (r.symbol.as_str(), r)).collect();
        let meta = IndexMeta {
            version: DOCUMENT_VERSION,
            built_at: entry.timestamp,
            record_count: by_symbol.len(),
        };
        let to_write_error = |e: serde_json::Error| DataError::StoreWrite { message: e.to_string() };
        let index_bytes = serde_json::to_vec(&by_symbol).map_err(to_write_error)?;
        let meta_bytes = serde_json::to_vec(&meta).map_err(to_write_error)?;

        let path = self.path.clone();
        let meta_path = self.meta_path.clone();
        tokio::task::spawn_blocking(move || {
            Self::write_atomic(&path, &index_bytes)?;
            Self::write_atomic(&meta_path, &meta_bytes)
        })
        .await
        .map_err(|e| DataError::StoreWrite { message: e.to_string() })?
        .map_err(|e| DataError::StoreWrite {
            message: format!("{}: {}", self.path.display(), e),
        })?;

        tracing::info!("Saved {} records to {}", meta.record_count, self.path.display());
        Ok(())
    }

    async fn clear(&self) -> MdxResult<()> {
        Self::remove_if_present(&self.meta_path).await?;
        Self::remove_if_present(&self.path).await
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// In-process store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    entry: Mutex<Option<CacheEntry>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(entry: CacheEntry) -> Self {
        Self { entry: Mutex::new(Some(entry)) }
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn load(&self) -> MdxResult<Option<CacheEntry>> {
        Ok(self.entry.lock().clone())
    }

    async fn save(&self, entry: &CacheEntry) -> MdxResult<()> {
        *self.entry.lock() = Some(entry.clone());
        Ok(())
    }

    async fn clear(&self) -> MdxResult<()> {
        *self.entry.lock() = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
