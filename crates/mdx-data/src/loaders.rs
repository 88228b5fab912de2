use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use mdx_types::{DataError, InstrumentRecord, MdxResult};

/// Header names accepted for each canonical field, in priority order.
pub const SYMBOL_COLUMNS: &[&str] = &["pTrdSymbol", "tradingsymbol", "trading_symbol", "symbol"];
pub const TOKEN_COLUMNS: &[&str] = &["pSymbol", "pInstToken", "instrument_token", "token"];
pub const EXCHANGE_COLUMNS: &[&str] = &["pExchSeg", "pExch", "exchange"];
pub const STRIKE_COLUMNS: &[&str] = &["dStrikePrice;", "dStrikePrice", "pStrikePrice", "strike"];
pub const OPTION_TYPE_COLUMNS: &[&str] = &["pOptionType", "option_type"];
pub const LOT_SIZE_COLUMNS: &[&str] = &["lLotSize", "pLotSize", "lot_size"];

/// Only the first few rejected rows of a file are logged individually
const MAX_LOGGED_REJECTIONS: u64 = 10;

/// Quoting dialect of a master file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvDialect {
    pub delimiter: u8,
    pub quote: u8,
    /// `""` inside a quoted field is a literal quote
    pub double_quote: bool,
}

impl Default for CsvDialect {
    fn default() -> Self {
        Self { delimiter: b',', quote: b'"', double_quote: true }
    }
}

/// Column names of a file, trimmed and with any UTF-8 BOM removed
#[derive(Debug, Clone, Default)]
pub struct CsvHeaders {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl CsvHeaders {
    fn from_record(record: &StringRecord) -> Self {
        let names: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                h.trim().to_string()
            })
            .collect();

        let mut positions = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            positions.entry(name.clone()).or_insert(i);
        }

        Self { names, positions }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Exact-name lookup
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// First alias that matches a header, ignoring ASCII case
    pub fn find_any(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| {
            self.position(alias).or_else(|| {
                self.names
                    .iter()
                    .position(|name| name.eq_ignore_ascii_case(alias))
            })
        })
    }
}

/// One data row; a view mapping header names to values
#[derive(Debug, Clone)]
pub struct CsvRow {
    headers: Arc<CsvHeaders>,
    record: StringRecord,
}

impl CsvRow {
    pub fn headers(&self) -> &CsvHeaders {
        &self.headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.position(name).and_then(|i| self.record.get(i))
    }

    pub fn get_at(&self, index: usize) -> Option<&str> {
        self.record.get(index)
    }

    /// `(header, value)` pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .names
            .iter()
            .map(String::as_str)
            .zip(self.record.iter())
    }
}

/// Row-level outcome counters for one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows_parsed: u64,
    /// Field count differs from the header
    pub column_mismatch: u64,
    /// Undecodable rows (invalid UTF-8 and similar)
    pub malformed: u64,
    /// Parsed rows the normalizer rejected for lacking a trading symbol
    pub missing_symbol: u64,
}

impl ParseStats {
    pub fn rows_rejected(&self) -> u64 {
        self.column_mismatch + self.malformed + self.missing_symbol
    }
}

/// Single-pass iterator over the rows of one CSV source
pub struct CsvRows<R: Read> {
    source_name: String,
    headers: Arc<CsvHeaders>,
    records: StringRecordsIntoIter<R>,
    stats: ParseStats,
}

impl<R: Read> CsvRows<R> {
    pub fn from_reader(reader: R, source_name: &str) -> MdxResult<Self> {
        Self::with_dialect(reader, source_name, CsvDialect::default())
    }

    pub fn with_dialect(reader: R, source_name: &str, dialect: CsvDialect) -> MdxResult<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(dialect.delimiter)
            .quote(dialect.quote)
            .double_quote(dialect.double_quote)
            .from_reader(reader);

        let header_record = rdr
            .headers()
            .map_err(|e| DataError::Parse {
                source_name: source_name.to_string(),
                message: format!("Failed to read CSV headers: {}", e),
            })?
            .clone();
        let headers = CsvHeaders::from_record(&header_record);
        tracing::debug!("CSV headers for {}: {:?}", source_name, headers.names());

        Ok(Self {
            source_name: source_name.to_string(),
            headers: Arc::new(headers),
            records: rdr.into_records(),
            stats: ParseStats::default(),
        })
    }

    pub fn headers(&self) -> &CsvHeaders {
        &self.headers
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    fn note_rejection(&self, line: Option<u64>, reason: &str) {
        if self.stats.column_mismatch + self.stats.malformed <= MAX_LOGGED_REJECTIONS {
            tracing::debug!(
                "Skipping row at line {} of {}: {}",
                line.unwrap_or_default(),
                self.source_name,
                reason
            );
        }
    }
}

impl<R: Read> Iterator for CsvRows<R> {
    type Item = CsvRow;

    fn next(&mut self) -> Option<CsvRow> {
        loop {
            match self.records.next()? {
                Ok(record) if record.len() == self.headers.len() => {
                    self.stats.rows_parsed += 1;
                    return Some(CsvRow {
                        headers: Arc::clone(&self.headers),
                        record,
                    });
                }
                Ok(record) => {
                    self.stats.column_mismatch += 1;
                    let reason = format!(
                        "expected {} fields, found {}",
                        self.headers.len(),
                        record.len()
                    );
                    self.note_rejection(record.position().map(|p| p.line()), &reason);
                }
                Err(e) => {
                    if let csv::ErrorKind::Io(io) = e.kind() {
                        tracing::warn!("I/O error while reading {}: {}", self.source_name, io);
                        return None;
                    }
                    self.stats.malformed += 1;
                    self.note_rejection(e.position().map(|p| p.line()), &e.to_string());
                }
            }
        }
    }
}

/// Maps rows of one file onto [`InstrumentRecord`]s; column aliases are resolved once.
#[derive(Debug, Clone, Default)]
pub struct RecordNormalizer {
    symbol: Option<usize>,
    token: Option<usize>,
    exchange: Option<usize>,
    strike: Option<usize>,
    option_type: Option<usize>,
    lot_size: Option<usize>,
}

impl RecordNormalizer {
    pub fn for_headers(headers: &CsvHeaders) -> Self {
        Self {
            symbol: headers.find_any(SYMBOL_COLUMNS),
            token: headers.find_any(TOKEN_COLUMNS),
            exchange: headers.find_any(EXCHANGE_COLUMNS),
            strike: headers.find_any(STRIKE_COLUMNS),
            option_type: headers.find_any(OPTION_TYPE_COLUMNS),
            lot_size: headers.find_any(LOT_SIZE_COLUMNS),
        }
    }

    pub fn has_symbol_column(&self) -> bool {
        self.symbol.is_some()
    }

    /// `None` when the row has no trading symbol
    pub fn normalize(&self, row: &CsvRow) -> Option<InstrumentRecord> {
        let field = |idx: Option<usize>| idx.and_then(|i| row.get_at(i)).unwrap_or("");

        let record = InstrumentRecord::new(field(self.symbol), field(self.token), field(self.exchange))?
            .with_strike(field(self.strike))
            .with_option_type(field(self.option_type))
            .with_lot_size(field(self.lot_size));
        Some(record)
    }
}

/// Normalize a single row, resolving columns from its own headers
pub fn normalize(row: &CsvRow) -> Option<InstrumentRecord> {
    RecordNormalizer::for_headers(row.headers()).normalize(row)
}

/// Normalized records of one source file
#[derive(Debug, Clone, Default)]
pub struct FileBatch {
    pub source: String,
    pub records: Vec<InstrumentRecord>,
    pub stats: ParseStats,
}

/// Loader turning raw master files into record batches
#[derive(Debug, Clone, Default)]
pub struct MasterFileLoader {
    dialect: CsvDialect,
}

impl MasterFileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(dialect: CsvDialect) -> Self {
        Self { dialect }
    }

    /// Parse and normalize one file held in memory
    pub fn load_bytes(&self, source_name: &str, bytes: &[u8]) -> MdxResult<FileBatch> {
        let mut rows = CsvRows::with_dialect(bytes, source_name, self.dialect)?;
        let normalizer = RecordNormalizer::for_headers(rows.headers());
        if !normalizer.has_symbol_column() && !rows.headers().is_empty() {
            tracing::warn!("No trading symbol column in {}; every row will be rejected", source_name);
        }

        let mut records = Vec::new();
        let mut missing_symbol = 0u64;
        for row in rows.by_ref() {
            match normalizer.normalize(&row) {
                Some(record) => records.push(record),
                None => missing_symbol += 1,
            }
        }

        let mut stats = rows.stats().clone();
        stats.missing_symbol = missing_symbol;

        if stats.rows_rejected() > 0 {
            tracing::warn!(
                "Rejected {} row(s) in {} ({} column mismatch, {} malformed, {} without symbol)",
                stats.rows_rejected(),
                source_name,
                stats.column_mismatch,
                stats.malformed,
                stats.missing_symbol
            );
        }
        tracing::info!("Loaded {} records from {}", records.len(), source_name);

        Ok(FileBatch { source: source_name.to_string(), records, stats })
    }

    /// Parse and normalize a file on disk
    pub fn load_csv_file<P: AsRef<Path>>(&self, file_path: P) -> MdxResult<FileBatch> {
        let path = file_path.as_ref();
        tracing::info!("Loading master CSV from: {}", path.display());
        let bytes = std::fs::read(path).map_err(|e| DataError::Parse {
            source_name: path.display().to_string(),
            message: format!("Failed to open CSV file: {}", e),
        })?;
        self.load_bytes(&path.display().to_string(), &bytes)
    }
}

/// Stable segment priority: `mcx_fo` files first, then `nse_fo`, then the rest.
pub fn order_source_files(files: Vec<String>) -> Vec<String> {
    fn rank(url: &str) -> u8 {
        let lower = url.to_lowercase();
        if lower.contains("mcx_fo") {
            0
        } else if lower.contains("nse_fo") {
            1
        } else {
            2
        }
    }

    let mut files = files;
    files.sort_by_key(|url| rank(url));
    files
}
