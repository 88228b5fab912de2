use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mdx_data::{
    FetchedFile, IndexStore, JsonFileStore, LocalSourceAdapter, MasterDataConfig,
    MasterDataService, MemoryIndexStore, SourceAdapter, SourceConfig, SqliteIndexStore,
    StoreBackend, StoreConfig,
};
use mdx_types::{CacheEntry, DataError, InstrumentRecord, MdxResult, SyncState};

const NSE_CM: &str = "pSymbol,pExchSeg,pTrdSymbol,lLotSize\n\
    2885,nse_cm,RELIANCE-EQ,1\n\
    26000,nse_cm,NIFTY,1\n\
    26009,nse_cm,NIFTYBANK,1\n";

const NSE_FO: &str = "pSymbol,pExchSeg,pTrdSymbol,pOptionType,dStrikePrice;,lLotSize\n\
    35001,nse_fo,NIFTY24DEC24000CE,CE,2400000.000000,75\n\
    35002,nse_fo,NIFTY24DEC24000PE,PE,2400000.000000,75\n";

/// Source double serving fixed CSV bodies
#[derive(Debug, Default)]
struct StaticSource {
    files: Vec<(String, Option<String>)>,
    delays: HashMap<String, Duration>,
    list_delay: Duration,
    list_calls: AtomicUsize,
    fail_listing: AtomicBool,
}

impl StaticSource {
    fn new(files: &[(&str, Option<&str>)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(url, body)| (url.to_string(), body.map(str::to_string)))
                .collect(),
            ..Default::default()
        }
    }

    fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    fn with_fetch_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    async fn list_source_files(&self) -> MdxResult<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.list_delay).await;
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(DataError::Fetch {
                url: "catalog".to_string(),
                message: "HTTP 401".to_string(),
            }
            .into());
        }
        Ok(self.files.iter().map(|(url, _)| url.clone()).collect())
    }

    async fn fetch_file_with_meta(&self, url: &str) -> MdxResult<FetchedFile> {
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        match self.files.iter().find(|(u, _)| u == url) {
            Some((_, Some(body))) => Ok(FetchedFile {
                url: url.to_string(),
                bytes: body.clone().into_bytes(),
                last_modified: None,
            }),
            _ => Err(DataError::Fetch {
                url: url.to_string(),
                message: "HTTP 404".to_string(),
            }
            .into()),
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Store wrapper whose loads take a while
#[derive(Debug)]
struct SlowLoadStore {
    inner: MemoryIndexStore,
    delay: Duration,
}

#[async_trait]
impl IndexStore for SlowLoadStore {
    async fn load(&self) -> MdxResult<Option<CacheEntry>> {
        tokio::time::sleep(self.delay).await;
        self.inner.load().await
    }

    async fn save(&self, entry: &CacheEntry) -> MdxResult<()> {
        self.inner.save(entry).await
    }

    async fn clear(&self) -> MdxResult<()> {
        self.inner.clear().await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

fn test_config() -> MasterDataConfig {
    MasterDataConfig {
        source: SourceConfig::local("/unused").with_timeout_secs(1).with_retries(0, 10),
        ..Default::default()
    }
}

fn service_with(source: Arc<StaticSource>, store: Arc<dyn IndexStore>) -> MasterDataService {
    MasterDataService::with_components(test_config(), source, store).unwrap()
}

fn entry_built_at(timestamp: chrono::DateTime<Utc>) -> CacheEntry {
    let records = vec![
        InstrumentRecord::new("NIFTY", "26000", "nse_cm").unwrap(),
        InstrumentRecord::new("TCS", "11536", "nse_cm").unwrap(),
    ];
    CacheEntry::new(timestamp, records)
}

#[tokio::test]
async fn test_concurrent_callers_share_one_sync() {
    let source = Arc::new(
        StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))])
            .with_list_delay(Duration::from_millis(50)),
    );
    let service = service_with(Arc::clone(&source), Arc::new(MemoryIndexStore::new()));

    let (first, second) = tokio::join!(service.ensure_loaded(), service.ensure_loaded());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(source.list_calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(service.status().state, SyncState::Ready);
}

#[tokio::test]
async fn test_concurrent_failures_share_one_error() {
    let source = Arc::new(StaticSource::new(&[]).with_list_delay(Duration::from_millis(50)));
    let service = service_with(Arc::clone(&source), Arc::new(MemoryIndexStore::new()));

    let (first, second) = tokio::join!(service.ensure_loaded(), service.sync_now());

    assert_eq!(source.list_calls(), 1);
    assert!(first.unwrap_err().to_string().contains("no master files"));
    assert!(second.unwrap_err().to_string().contains("no master files"));
}

#[tokio::test]
async fn test_empty_catalog_is_error_and_stays_missing() {
    let source = Arc::new(StaticSource::new(&[]));
    let service = service_with(source, Arc::new(MemoryIndexStore::new()));

    let err = service.ensure_loaded().await.unwrap_err();
    assert!(matches!(err.as_data(), Some(DataError::NoSourceFiles)));

    let status = service.status();
    assert_eq!(status.state, SyncState::Error);
    assert!(status.is_missing);
    assert!(!status.is_syncing);
    assert!(status.error.unwrap().contains("no master files"));
    assert!(!service.is_ready());
    assert!(service.search("NIF", 10).is_empty());
}

#[tokio::test]
async fn test_yesterdays_cache_is_reported_stale() {
    let yesterday = Utc::now() - chrono::Duration::days(1);
    let store = Arc::new(MemoryIndexStore::with_entry(entry_built_at(yesterday)));
    let source = Arc::new(StaticSource::new(&[]));
    let service = service_with(Arc::clone(&source), store);

    assert!(service.load_from_store().await.is_none());
    let status = service.status();
    assert_eq!(status.state, SyncState::Stale);
    assert!(status.is_stale);
    assert_eq!(source.list_calls(), 0);

    // The rebuild fails here; the stale flag survives and nothing stale is served.
    assert!(service.ensure_loaded().await.is_err());
    assert!(service.status().is_stale);
    assert!(service.search("NIFTY", 5).is_empty());
}

#[tokio::test]
async fn test_fresh_cache_is_served_without_source() {
    let store = Arc::new(MemoryIndexStore::with_entry(entry_built_at(Utc::now())));
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))]));
    let service = service_with(Arc::clone(&source), store);

    let index = service.ensure_loaded().await.unwrap();

    assert_eq!(index.len(), 2);
    assert_eq!(source.list_calls(), 0);
    let status = service.status();
    assert_eq!(status.state, SyncState::Ready);
    assert_eq!(status.symbol_count, 2);
    assert!(!status.is_loading);
    assert_eq!(service.get("tcs").unwrap().token, "11536");
}

#[tokio::test]
async fn test_failed_file_does_not_abort_sync() {
    let source = Arc::new(StaticSource::new(&[
        ("x/nse_cm.csv", Some(NSE_CM)),
        ("x/bse_cm.csv", None),
        ("x/nse_fo.csv", Some(NSE_FO)),
    ]));
    let service = service_with(source, Arc::new(MemoryIndexStore::new()));

    let index = service.ensure_loaded().await.unwrap();
    assert_eq!(index.len(), 5);

    let report = service.status().last_report.unwrap();
    assert_eq!(report.files_listed, 3);
    assert_eq!(report.files_loaded, 2);
    assert_eq!(report.files_failed, 1);
    assert_eq!(report.records_indexed, 5);
}

#[tokio::test]
async fn test_slow_file_times_out_without_failing_sync() {
    let source = Arc::new(
        StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM)), ("x/nse_fo.csv", Some(NSE_FO))])
            .with_fetch_delay("x/nse_fo.csv", Duration::from_secs(5)),
    );
    let service = service_with(source, Arc::new(MemoryIndexStore::new()));

    let index = service.ensure_loaded().await.unwrap();

    assert_eq!(index.len(), 3);
    assert_eq!(service.status().last_report.unwrap().files_failed, 1);
}

#[tokio::test]
async fn test_all_files_failing_is_empty_result() {
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", None), ("x/nse_fo.csv", None)]));
    let service = service_with(source, Arc::new(MemoryIndexStore::new()));

    let err = service.ensure_loaded().await.unwrap_err();
    assert!(matches!(
        err.as_data(),
        Some(DataError::EmptyResult { files_attempted: 2 })
    ));
}

#[tokio::test]
async fn test_later_file_wins_on_duplicate_symbol() {
    // mcx_fo is processed first, so the nse_cm row is the later write.
    let source = Arc::new(StaticSource::new(&[
        ("x/nse_cm.csv", Some("pTrdSymbol,pSymbol\nAAA,1\nBBB,2\n")),
        ("x/mcx_fo.csv", Some("pTrdSymbol,pSymbol\nAAA,9\n")),
    ]));
    let service = service_with(source, Arc::new(MemoryIndexStore::new()));

    service.ensure_loaded().await.unwrap();

    assert_eq!(service.get("AAA").unwrap().token, "1");
    assert_eq!(service.get("BBB").unwrap().token, "2");
    assert_eq!(service.status().last_report.unwrap().duplicates_overwritten, 1);
}

#[tokio::test]
async fn test_store_write_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let store = Arc::new(JsonFileStore::new(blocker.join("master_index.json")));
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))]));
    let service = service_with(source, store);

    let err = service.ensure_loaded().await.unwrap_err();

    assert!(matches!(err.as_data(), Some(DataError::StoreWrite { .. })));
    assert_eq!(service.status().state, SyncState::Error);
    assert!(!service.is_ready());
}

#[tokio::test]
async fn test_search_before_and_after_ready() {
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))]));
    let service = service_with(source, Arc::new(MemoryIndexStore::new()));

    assert!(service.search("NIF", 2).is_empty());

    service.ensure_loaded().await.unwrap();
    let symbols: Vec<String> = service
        .search("nif", 2)
        .into_iter()
        .map(|r| r.symbol)
        .collect();

    assert_eq!(symbols, vec!["NIFTY", "NIFTYBANK"]);
    assert!(service.search("", 10).is_empty());
    assert_eq!(service.search_stats().searches, 3);
}

#[tokio::test]
async fn test_previous_index_survives_failed_resync() {
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))]));
    let service = service_with(Arc::clone(&source), Arc::new(MemoryIndexStore::new()));
    service.ensure_loaded().await.unwrap();

    source.fail_listing.store(true, Ordering::SeqCst);
    assert!(service.sync_now().await.is_err());

    let status = service.status();
    assert_eq!(status.state, SyncState::Error);
    assert!(status.error.unwrap().contains("HTTP 401"));
    assert!(service.is_ready());
    assert_eq!(service.search("RELIANCE", 5).len(), 1);
}

#[tokio::test]
async fn test_background_sync_and_subscription() {
    let source = Arc::new(StaticSource::new(&[("x/nse_fo.csv", Some(NSE_FO))]));
    let service = Arc::new(service_with(Arc::clone(&source), Arc::new(MemoryIndexStore::new())));
    let mut updates = service.subscribe();

    let index = service.trigger_background_sync().await.unwrap().unwrap();
    assert_eq!(index.len(), 2);

    assert!(updates.has_changed().unwrap());
    let latest = updates.borrow_and_update().clone();
    assert_eq!(latest.state, SyncState::Ready);
    assert_eq!(latest.symbol_count, 2);
}

#[tokio::test]
async fn test_clear_cache_drops_everything() {
    let store = Arc::new(MemoryIndexStore::new());
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))]));
    let service = service_with(Arc::clone(&source), store.clone());
    service.ensure_loaded().await.unwrap();

    service.clear_cache().await.unwrap();

    assert!(!service.is_ready());
    assert!(store.load().await.unwrap().is_none());
    let status = service.status();
    assert_eq!(status.state, SyncState::Missing);
    assert!(status.is_missing);

    // Next call rebuilds from the source
    service.ensure_loaded().await.unwrap();
    assert_eq!(source.list_calls(), 2);
}

#[tokio::test]
async fn test_local_directory_sync_with_archive() {
    let source_dir = tempfile::tempdir().unwrap();
    std::fs::write(source_dir.path().join("nse_cm.csv"), NSE_CM).unwrap();
    std::fs::write(source_dir.path().join("nse_fo.csv"), NSE_FO).unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let store_path = work_dir.path().join("master_index.json");

    let mut config = test_config();
    config.archive_dir = Some(work_dir.path().join("raw"));
    let service = MasterDataService::with_components(
        config.clone(),
        Arc::new(LocalSourceAdapter::new(source_dir.path())),
        Arc::new(JsonFileStore::new(&store_path)),
    )
    .unwrap();

    let index = service.ensure_loaded().await.unwrap();
    assert_eq!(index.len(), 5);
    assert!(work_dir.path().join("raw").join("nse_fo.csv").exists());
    assert!(service.status().last_report.unwrap().source_last_modified.is_some());

    // A second process picks up the persisted index without touching the source
    let source = Arc::new(StaticSource::new(&[]));
    let reloaded = MasterDataService::with_components(
        config,
        source.clone(),
        Arc::new(JsonFileStore::new(&store_path)),
    )
    .unwrap();
    let again = reloaded.ensure_loaded().await.unwrap();

    assert_eq!(again.records(), index.records());
    assert_eq!(source.list_calls(), 0);
}

#[tokio::test]
async fn test_caller_queued_behind_clear_rebuilds() {
    let source = Arc::new(
        StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))])
            .with_list_delay(Duration::from_millis(50)),
    );
    let service = service_with(Arc::clone(&source), Arc::new(MemoryIndexStore::new()));

    let (first, cleared, third) = tokio::join!(
        service.ensure_loaded(),
        service.clear_cache(),
        service.ensure_loaded()
    );

    first.unwrap();
    cleared.unwrap();
    assert_eq!(third.unwrap().len(), 3);
    assert_eq!(source.list_calls(), 2);
    assert_eq!(service.status().state, SyncState::Ready);
}

#[tokio::test]
async fn test_forced_sync_queued_behind_store_load_still_runs() {
    let source = Arc::new(StaticSource::new(&[("x/nse_cm.csv", Some(NSE_CM))]));
    let store = Arc::new(SlowLoadStore {
        inner: MemoryIndexStore::with_entry(entry_built_at(Utc::now())),
        delay: Duration::from_millis(50),
    });
    let service = service_with(Arc::clone(&source), store);

    let (loaded, synced) = tokio::join!(service.ensure_loaded(), service.sync_now());

    assert_eq!(loaded.unwrap().len(), 2);
    assert_eq!(synced.unwrap().len(), 3);
    assert_eq!(source.list_calls(), 1);
    assert_eq!(service.current_index().unwrap().len(), 3);
}

#[tokio::test]
async fn test_identical_inputs_write_identical_json_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("master_index.json");
    let source = Arc::new(StaticSource::new(&[
        ("x/nse_cm.csv", Some(NSE_CM)),
        ("x/nse_fo.csv", Some(NSE_FO)),
    ]));
    let service = service_with(Arc::clone(&source), Arc::new(JsonFileStore::new(&path)));

    service.sync_now().await.unwrap();
    let first = std::fs::read(&path).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    service.sync_now().await.unwrap();
    let second = std::fs::read(&path).unwrap();

    assert_eq!(source.list_calls(), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_sqlite_store_serves_next_process() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("master.db");
    let source = Arc::new(StaticSource::new(&[
        ("x/nse_cm.csv", Some(NSE_CM)),
        ("x/nse_fo.csv", Some(NSE_FO)),
    ]));

    let writer = service_with(
        Arc::clone(&source),
        Arc::new(SqliteIndexStore::open(&db_path).unwrap()),
    );
    assert_eq!(writer.ensure_loaded().await.unwrap().len(), 5);

    let reader = service_with(
        Arc::clone(&source),
        Arc::new(SqliteIndexStore::open(&db_path).unwrap()),
    );
    let index = reader.ensure_loaded().await.unwrap();

    assert_eq!(index.len(), 5);
    assert_eq!(source.list_calls(), 1);
    assert_eq!(reader.search("nifty24dec", 5).len(), 2);
    assert_eq!(reader.get("reliance-eq").unwrap().token, "2885");
}

#[tokio::test]
async fn test_slow_first_response_is_retried() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    let catalog = serde_json::json!({
        "data": { "filesPaths": [format!("{}/files/nse_cm.csv", server.uri())] }
    });
    Mock::given(method("GET"))
        .and(path("/script-details/1.0/masterscrip/file-paths"))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalog))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/nse_cm.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(NSE_CM)
                .set_delay(Duration::from_secs(3)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/nse_cm.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NSE_CM))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = MasterDataConfig {
        source: SourceConfig::http(&server.uri())
            .with_timeout_secs(1)
            .with_retries(2, 10),
        store: StoreConfig {
            backend: StoreBackend::Json,
            path: dir.path().join("master_index.json"),
        },
        ..Default::default()
    };
    let service = MasterDataService::from_config(config).unwrap();

    let index = service.sync_now().await.unwrap();
    assert_eq!(index.len(), 3);
    assert_eq!(service.status().last_report.unwrap().files_failed, 0);
}
