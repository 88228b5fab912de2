use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdx_types::{normalize_symbol, CacheEntry, DataError, InstrumentRecord, MdxResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use tracing::warn;

use crate::storage::IndexStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS symbols (
        symbol TEXT PRIMARY KEY,
        token TEXT NOT NULL DEFAULT '',
        exchange TEXT NOT NULL DEFAULT '',
        strike TEXT NOT NULL DEFAULT '',
        option_type TEXT NOT NULL DEFAULT '',
        lot_size TEXT NOT NULL DEFAULT ''
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

const SELECT_COLUMNS: &str = "SELECT symbol, token, exchange, strike, option_type, lot_size FROM symbols";

fn read_error(e: rusqlite::Error) -> DataError {
    DataError::StoreRead { message: e.to_string() }
}

fn write_error(e: rusqlite::Error) -> DataError {
    DataError::StoreWrite { message: e.to_string() }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<InstrumentRecord> {
    Ok(InstrumentRecord {
        symbol: row.get(0)?,
        token: row.get(1)?,
        exchange: row.get(2)?,
        strike_price: row.get(3)?,
        option_type: row.get(4)?,
        lot_size: row.get(5)?,
    })
}

/// SQLite-backed index store, one row per symbol clustered on the symbol key.
///
/// Besides whole-index load/save it answers point lookups and prefix queries
/// straight from the table, for batch tools that never load the full index.
#[derive(Debug, Clone)]
pub struct SqliteIndexStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteIndexStore {
    /// Open or create the database. An unreadable file is moved aside to
    /// `<name>.corrupt` and replaced by an empty database, so the next sync
    /// rebuilds it.
    pub fn open<P: AsRef<Path>>(db_path: P) -> MdxResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DataError::StoreWrite {
                    message: format!("{}: {}", parent.display(), e),
                })?;
            }
        }

        match Self::open_file(db_path) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!("Discarding unreadable index database {}: {}", db_path.display(), e);
                Self::move_aside(db_path)?;
                Self::open_file(db_path)
            }
        }
    }

    fn open_file(db_path: &Path) -> MdxResult<Self> {
        let connection = Connection::open(db_path).map_err(read_error)?;
        Self::with_connection(connection)
    }

    fn move_aside(db_path: &Path) -> MdxResult<()> {
        let mut name = db_path.file_name().unwrap_or_default().to_os_string();
        name.push(".corrupt");
        let target = db_path.with_file_name(name);
        if std::fs::rename(db_path, &target).is_err() {
            std::fs::remove_file(db_path).map_err(|e| DataError::StoreWrite {
                message: format!("{}: {}", db_path.display(), e),
            })?;
        }
        Ok(())
    }

    pub fn open_in_memory() -> MdxResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(read_error)?)
    }

    fn with_connection(connection: Connection) -> MdxResult<Self> {
        connection.execute_batch(SCHEMA).map_err(read_error)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)) })
    }

    fn load_blocking(connection: &Connection) -> MdxResult<Option<CacheEntry>> {
        let built_at: Option<String> = connection
            .query_row("SELECT value FROM cache_meta WHERE key = 'built_at'", [], |row| row.get(0))
            .optional()
            .map_err(read_error)?;
        let built_at = match built_at {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| DataError::StoreRead {
                    message: format!("invalid built_at '{}': {}", raw, e),
                })?
                .with_timezone(&Utc),
            None => return Ok(None),
        };

        let mut stmt = connection
            .prepare(&format!("{} ORDER BY symbol", SELECT_COLUMNS))
            .map_err(read_error)?;
        let records = stmt
            .query_map([], record_from_row)
            .map_err(read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_error)?;

        Ok(Some(CacheEntry::new(built_at, records)))
    }

    fn save_blocking(connection: &mut Connection, entry: &CacheEntry) -> MdxResult<()> {
        let tx = connection.transaction().map_err(write_error)?;
        tx.execute("DELETE FROM symbols", []).map_err(write_error)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO symbols
                     (symbol, token, exchange, strike, option_type, lot_size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(write_error)?;
            for r in &entry.records {
                stmt.execute(params![
                    r.symbol,
                    r.token,
                    r.exchange,
                    r.strike_price,
                    r.option_type,
                    r.lot_size
                ])
                .map_err(write_error)?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO cache_meta (key, value) VALUES ('built_at', ?1), ('record_count', ?2)",
            params![entry.timestamp.to_rfc3339(), entry.len().to_string()],
        )
        .map_err(write_error)?;
        tx.commit().map_err(write_error)?;
        Ok(())
    }

    /// Case-insensitive point lookup against the table
    pub fn get(&self, symbol: &str) -> MdxResult<Option<InstrumentRecord>> {
        let Some(symbol) = normalize_symbol(symbol) else {
            return Ok(None);
        };
        let connection = self.connection.lock();
        let record = connection
            .query_row(
                &format!("{} WHERE symbol = ?1", SELECT_COLUMNS),
                params![symbol],
                record_from_row,
            )
            .optional()
            .map_err(read_error)?;
        Ok(record)
    }

    /// Up to `limit` symbols starting with `prefix`, ascending; a range scan on the key.
    pub fn prefix_search(&self, prefix: &str, limit: usize) -> MdxResult<Vec<InstrumentRecord>> {
        let Some(lower) = normalize_symbol(prefix) else {
            return Ok(Vec::new());
        };
        let upper = format!("{}\u{10FFFF}", lower);

        let connection = self.connection.lock();
        let mut stmt = connection
            .prepare(&format!(
                "{} WHERE symbol >= ?1 AND symbol < ?2 ORDER BY symbol LIMIT ?3",
                SELECT_COLUMNS
            ))
            .map_err(read_error)?;
        let records = stmt
            .query_map(params![lower, upper, limit as i64], record_from_row)
            .map_err(read_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_error)?;
        Ok(records)
    }

    pub fn symbol_count(&self) -> MdxResult<usize> {
        let connection = self.connection.lock();
        let count: i64 = connection
            .query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))
            .map_err(read_error)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn load(&self) -> MdxResult<Option<CacheEntry>> {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || Self::load_blocking(&connection.lock()))
            .await
            .map_err(|e| DataError::StoreRead { message: e.to_string() })?
    }

    async fn save(&self, entry: &CacheEntry) -> MdxResult<()> {
        let connection = Arc::clone(&self.connection);
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || Self::save_blocking(&mut connection.lock(), &entry))
            .await
            .map_err(|e| DataError::StoreWrite { message: e.to_string() })??;
        tracing::info!("Saved symbols to sqlite store");
        Ok(())
    }

    async fn clear(&self) -> MdxResult<()> {
        let connection = self.connection.lock();
        connection
            .execute_batch("BEGIN; DELETE FROM symbols; DELETE FROM cache_meta; COMMIT;")
            .map_err(write_error)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(symbols: &[&str]) -> CacheEntry {
        let records = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| {
                InstrumentRecord::new(s, &i.to_string(), "nse_fo")
                    .unwrap()
                    .with_lot_size("50")
            })
            .collect();
        CacheEntry::new(Utc::now(), records)
    }

    #[tokio::test]
    async fn test_unreadable_database_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let store = crate::storage::open_store(&crate::config::StoreConfig {
            backend: crate::config::StoreBackend::Sqlite,
            path: path.clone(),
        })
        .unwrap();

        assert!(store.load().await.unwrap().is_none());
        assert!(dir.path().join("master.db.corrupt").exists());

        store.save(&entry(&["NIFTY"])).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = SqliteIndexStore::open(dir.path().join("master.db")).unwrap();
        assert!(store.load().await.unwrap().is_none());

        let saved = entry(&["BANKNIFTY", "NIFTY", "RELIANCE"]);
        store.save(&saved).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.records, saved.records);
        assert_eq!(loaded.timestamp.timestamp_micros(), saved.timestamp.timestamp_micros());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        store.save(&entry(&["AAA", "BBB"])).await.unwrap();
        store.save(&entry(&["CCC"])).await.unwrap();

        assert_eq!(store.symbol_count().unwrap(), 1);
        assert!(store.get("AAA").unwrap().is_none());
        assert_eq!(store.get("ccc").unwrap().unwrap().lot_size, "50");
    }

    #[tokio::test]
    async fn test_prefix_query_on_table() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        store
            .save(&entry(&["NIFTY", "NIFTYBANK", "NIFTYIT", "RELIANCE"]))
            .await
            .unwrap();

        let hits = store.prefix_search("nif", 2).unwrap();
        let symbols: Vec<&str> = hits.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["NIFTY", "NIFTYBANK"]);
        assert!(store.prefix_search(" ", 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_empties_store() {
        let store = SqliteIndexStore::open_in_memory().unwrap();
        store.save(&entry(&["TCS"])).await.unwrap();
        store.clear().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
        assert_eq!(store.symbol_count().unwrap(), 0);
    }
}
