use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use mdx_types::{
    internal_error, DataError, InstrumentRecord, MdxResult, SyncReport, SyncStatus,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{IndexCache, SearchStats};
use crate::config::MasterDataConfig;
use crate::freshness::FreshnessPolicy;
use crate::index::{IndexBuilder, MasterIndex};
use crate::loaders::{order_source_files, FileBatch, MasterFileLoader};
use crate::providers::{source_from_config, SourceAdapter};
use crate::storage::{open_store, IndexStore};

/// Outcome of a finished load or sync, handed to callers that waited on it
type SharedOutcome = Result<Arc<MasterIndex>, String>;

/// Counters and outcomes of finished attempts. Loads and syncs are tracked
/// apart so a forced sync never settles for a store load.
#[derive(Debug, Default)]
struct Completed {
    attempts: u64,
    syncs: u64,
    last: Option<SharedOutcome>,
    last_sync: Option<SharedOutcome>,
}

impl Completed {
    fn record(&mut self, outcome: SharedOutcome, from_sync: bool) {
        self.attempts += 1;
        if from_sync {
            self.syncs += 1;
            self.last_sync = Some(outcome.clone());
        }
        self.last = Some(outcome);
    }

    /// Outcome of any attempt finished after `seen`, if it is still on record
    fn attempt_since(&self, seen: u64) -> Option<SharedOutcome> {
        (self.attempts != seen).then(|| self.last.clone()).flatten()
    }

    fn sync_since(&self, seen: u64) -> Option<SharedOutcome> {
        (self.syncs != seen).then(|| self.last_sync.clone()).flatten()
    }

    fn forget(&mut self) {
        self.last = None;
        self.last_sync = None;
    }
}

fn into_result(outcome: SharedOutcome) -> MdxResult<Arc<MasterIndex>> {
    outcome.map_err(|message| DataError::SyncFailed { message }.into())
}

/// Owns the current index, its status and the single-flight sync guard.
///
/// Every load and sync runs under `sync_lock`. A caller that queued behind a
/// running attempt sees the completion counters move once it gets the lock
/// and returns that attempt's outcome instead of starting another one. When
/// the outcome was since forgotten (the cache was cleared) it runs its own.
#[derive(Debug)]
pub struct MasterDataService {
    config: MasterDataConfig,
    policy: FreshnessPolicy,
    source: Arc<dyn SourceAdapter>,
    store: Arc<dyn IndexStore>,
    loader: MasterFileLoader,
    cache: IndexCache,
    status: watch::Sender<SyncStatus>,
    sync_lock: AsyncMutex<()>,
    completed: Mutex<Completed>,
}

impl MasterDataService {
    /// Build the source adapter and store selected by configuration.
    pub fn from_config(config: MasterDataConfig) -> MdxResult<Self> {
        config.validate()?;
        let source: Arc<dyn SourceAdapter> = Arc::from(source_from_config(&config.source)?);
        let store = open_store(&config.store)?;
        Self::with_components(config, source, store)
    }

    pub fn with_components(
        config: MasterDataConfig,
        source: Arc<dyn SourceAdapter>,
        store: Arc<dyn IndexStore>,
    ) -> MdxResult<Self> {
        let policy = FreshnessPolicy::new(config.trading_timezone()?);
        let (status, _) = watch::channel(SyncStatus::default());

        info!(
            "Master data service using {} source and {} store",
            source.name(),
            store.name()
        );

        Ok(Self {
            config,
            policy,
            source,
            store,
            loader: MasterFileLoader::new(),
            cache: IndexCache::new(),
            status,
            sync_lock: AsyncMutex::new(()),
            completed: Mutex::new(Completed::default()),
        })
    }

    pub fn config(&self) -> &MasterDataConfig {
        &self.config
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// Make sure a fresh index is being served, loading or syncing as needed.
    pub async fn ensure_loaded(&self) -> MdxResult<Arc<MasterIndex>> {
        if let Some(index) = self.fresh_index() {
            return Ok(index);
        }

        let seen = self.completed.lock().attempts;
        let _guard = self.sync_lock.lock().await;
        let finished = self.completed.lock().attempt_since(seen);
        if let Some(outcome) = finished {
            return into_result(outcome);
        }

        match self.cache.current() {
            Some(index) if self.policy.is_fresh_now(index.built_at()) => return Ok(index),
            Some(index) => {
                info!("In-memory index from {} is stale", index.built_at());
                self.update_status(|s| s.mark_stale());
            }
            None => {
                if let Some(index) = self.load_persisted().await {
                    return Ok(index);
                }
            }
        }

        self.run_sync().await
    }

    /// Consult the persisted store only; never touches the source.
    ///
    /// Returns the served index when one is loaded or the store holds a fresh
    /// one, and leaves the status at missing or stale otherwise.
    pub async fn load_from_store(&self) -> Option<Arc<MasterIndex>> {
        let _guard = self.sync_lock.lock().await;
        match self.cache.current() {
            Some(index) => Some(index),
            None => self.load_persisted().await,
        }
    }

    /// Rebuild from the source regardless of freshness.
    pub async fn sync_now(&self) -> MdxResult<Arc<MasterIndex>> {
        let seen = self.completed.lock().syncs;
        let _guard = self.sync_lock.lock().await;
        let finished = self.completed.lock().sync_since(seen);
        if let Some(outcome) = finished {
            return into_result(outcome);
        }
        self.run_sync().await
    }

    /// Start a forced sync on the runtime and return immediately.
    pub fn trigger_background_sync(self: &Arc<Self>) -> JoinHandle<MdxResult<Arc<MasterIndex>>> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service.sync_now().await;
            if let Err(e) = &result {
                warn!("Background sync failed: {}", e);
            }
            result
        })
    }

    /// Prefix search on the last published index; empty until one exists.
    pub fn search(&self, query: &str, limit: usize) -> Vec<InstrumentRecord> {
        self.cache.search(query, limit)
    }

    pub fn get(&self, symbol: &str) -> Option<InstrumentRecord> {
        self.cache.get(symbol)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.cache.is_loaded()
    }

    pub fn current_index(&self) -> Option<Arc<MasterIndex>> {
        self.cache.current()
    }

    pub fn search_stats(&self) -> SearchStats {
        self.cache.get_stats()
    }

    /// Drop the persisted index and the in-memory one.
    pub async fn clear_cache(&self) -> MdxResult<()> {
        let _guard = self.sync_lock.lock().await;
        self.store.clear().await?;
        self.cache.clear();
        self.completed.lock().forget();
        self.update_status(|s| s.cleared());
        info!("Cleared {} store and in-memory index", self.store.name());
        Ok(())
    }

    fn fresh_index(&self) -> Option<Arc<MasterIndex>> {
        self.cache
            .current()
            .filter(|index| self.policy.is_fresh_now(index.built_at()))
    }

    fn update_status<F>(&self, modify: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        self.status.send_modify(|status| {
            modify(status);
            debug!("Status -> {}", status.state);
        });
    }

    fn record_outcome(&self, outcome: &MdxResult<Arc<MasterIndex>>, from_sync: bool) {
        let shared = match outcome {
            Ok(index) => Ok(Arc::clone(index)),
            Err(e) => Err(e.to_string()),
        };
        self.completed.lock().record(shared, from_sync);
    }

    /// Serve the persisted index when it is fresh; otherwise flag it as missing or stale.
    async fn load_persisted(&self) -> Option<Arc<MasterIndex>> {
        self.update_status(|s| s.begin_loading());

        match self.store.load().await {
            Ok(Some(entry)) if self.policy.is_fresh_now(entry.timestamp) => {
                let index = Arc::new(MasterIndex::from_entry(entry));
                self.cache.publish(Arc::clone(&index));
                self.update_status(|s| s.loaded(index.built_at(), index.len()));
                info!(
                    "Loaded {} symbols from {} store (built {})",
                    index.len(),
                    self.store.name(),
                    index.built_at()
                );
                self.record_outcome(&Ok(Arc::clone(&index)), false);
                Some(index)
            }
            Ok(Some(entry)) => {
                info!(
                    "Persisted index from {} is stale (trading date {})",
                    entry.timestamp,
                    self.policy.trading_date(entry.timestamp)
                );
                self.update_status(|s| s.mark_stale());
                None
            }
            Ok(None) => {
                info!("No persisted index found");
                self.update_status(|s| s.mark_missing());
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable persisted index: {}", e);
                self.update_status(|s| s.mark_missing());
                None
            }
        }
    }

    /// Caller must hold `sync_lock`.
    async fn run_sync(&self) -> MdxResult<Arc<MasterIndex>> {
        let started = Instant::now();
        self.update_status(|s| s.begin_sync());
        info!("Master data sync started ({} source)", self.source.name());

        let outcome = match self.build_from_source(started).await {
            Ok((index, report)) => {
                self.cache.publish(Arc::clone(&index));
                info!(
                    "Sync complete: {} symbols from {}/{} files in {} ms",
                    report.records_indexed, report.files_loaded, report.files_listed, report.duration_ms
                );
                self.update_status(|s| s.sync_succeeded(index.built_at(), report));
                Ok(index)
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                let message = e.to_string();
                self.update_status(|s| s.sync_failed(message));
                Err(e)
            }
        };

        self.record_outcome(&outcome, true);
        outcome
    }

    async fn build_from_source(&self, started: Instant) -> MdxResult<(Arc<MasterIndex>, SyncReport)> {
        let files = self.source.list_source_files().await?;
        if files.is_empty() {
            return Err(DataError::NoSourceFiles.into());
        }
        let files = order_source_files(files);
        info!("Processing {} master files", files.len());

        let mut report = SyncReport {
            files_listed: files.len(),
            ..Default::default()
        };

        let results: Vec<MdxResult<(FileBatch, Option<DateTime<Utc>>)>> = stream::iter(files.clone())
            .map(|url| async move { self.fetch_and_parse(&url).await })
            .buffered(self.config.max_concurrent_downloads.max(1))
            .collect()
            .await;

        let capacity = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|(batch, _)| batch.records.len())
            .sum();
        let mut builder = IndexBuilder::with_capacity(capacity);
        for (url, result) in files.iter().zip(results) {
            match result {
                Ok((batch, last_modified)) => {
                    report.files_loaded += 1;
                    report.rows_parsed += batch.stats.rows_parsed;
                    report.rows_rejected += batch.stats.rows_rejected();
                    report.source_last_modified = report.source_last_modified.max(last_modified);
                    builder.extend(batch.records);
                }
                Err(e) => {
                    report.files_failed += 1;
                    warn!("Skipping {}: {}", url, e);
                }
            }
        }

        if builder.is_empty() {
            return Err(DataError::EmptyResult { files_attempted: files.len() }.into());
        }

        report.duplicates_overwritten = builder.duplicates_overwritten();
        if report.duplicates_overwritten > 0 {
            debug!("{} duplicate symbols overwritten by later files", report.duplicates_overwritten);
        }

        let index = Arc::new(builder.build(Utc::now()));
        report.records_indexed = index.len();

        self.store.save(&index.to_entry()).await.map_err(|e| {
            if matches!(e.as_data(), Some(DataError::StoreWrite { .. })) {
                e
            } else {
                DataError::StoreWrite { message: e.to_string() }.into()
            }
        })?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok((index, report))
    }

    async fn fetch_and_parse(&self, url: &str) -> MdxResult<(FileBatch, Option<DateTime<Utc>>)> {
        // Each attempt is bounded by the adapter; this deadline spans every retry.
        let deadline = self.config.source.fetch_deadline();
        let fetched = tokio::time::timeout(deadline, self.source.fetch_file_with_meta(url))
            .await
            .map_err(|_| DataError::Timeout {
                url: url.to_string(),
                seconds: deadline.as_secs(),
            })??;

        if let Some(dir) = &self.config.archive_dir {
            if let Err(e) = archive_raw_file(dir, url, &fetched.bytes).await {
                warn!("Could not archive {}: {}", url, e);
            }
        }

        let last_modified = fetched.last_modified;
        let loader = self.loader.clone();
        let name = url.to_string();
        let batch = tokio::task::spawn_blocking(move || loader.load_bytes(&name, &fetched.bytes))
            .await
            .map_err(|e| internal_error!("CSV parse task failed: {}", e))??;

        Ok((batch, last_modified))
    }
}

/// Copy a downloaded file into the archive directory under its URL file name.
async fn archive_raw_file(dir: &Path, url: &str, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = url
        .split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit(['/', '\\']).next())
        .filter(|name| !name.is_empty())
        .unwrap_or("master.csv");

    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(file_name), bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_archive_uses_url_file_name() {
        let dir = tempfile::tempdir().unwrap();
        archive_raw_file(dir.path(), "https://x/files/nse_cm.csv?v=2", b"a,b\n")
            .await
            .unwrap();
        archive_raw_file(dir.path(), "/tmp/source/mcx_fo.csv", b"c\n").await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("nse_cm.csv")).unwrap(), b"a,b\n");
        assert_eq!(std::fs::read(dir.path().join("mcx_fo.csv")).unwrap(), b"c\n");
    }
}
