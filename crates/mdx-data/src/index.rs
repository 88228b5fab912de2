use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mdx_types::{normalize_symbol, CacheEntry, InstrumentRecord};
use rayon::prelude::*;

/// Accumulates normalized records keyed by symbol; a later record for the same
/// symbol replaces the earlier one.
#[derive(Debug, Default)]
pub struct IndexBuilder {
    records: HashMap<String, InstrumentRecord>,
    overwritten: usize,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: HashMap::with_capacity(capacity),
            overwritten: 0,
        }
    }

    /// Insert one record. Returns true when it replaced an existing symbol.
    pub fn insert(&mut self, record: InstrumentRecord) -> bool {
        let replaced = self.records.insert(record.symbol.clone(), record).is_some();
        if replaced {
            self.overwritten += 1;
        }
        replaced
    }

    pub fn extend<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = InstrumentRecord>,
    {
        for record in records {
            self.insert(record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn duplicates_overwritten(&self) -> usize {
        self.overwritten
    }

    pub fn build(self, built_at: DateTime<Utc>) -> MasterIndex {
        let mut records: Vec<InstrumentRecord> = self.records.into_values().collect();
        // Symbols are unique keys, so an unstable sort is deterministic here.
        records.par_sort_unstable_by(|a, b| a.symbol.cmp(&b.symbol));
        MasterIndex { records, built_at }
    }
}

/// Immutable, symbol-sorted snapshot of every instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterIndex {
    records: Vec<InstrumentRecord>,
    built_at: DateTime<Utc>,
}

impl MasterIndex {
    pub fn build<I>(records: I, built_at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = InstrumentRecord>,
    {
        let mut builder = IndexBuilder::new();
        builder.extend(records);
        builder.build(built_at)
    }

    /// Rebuild from a persisted entry. Records are re-keyed so an entry written
    /// by another producer still satisfies the ordering and uniqueness rules.
    pub fn from_entry(entry: CacheEntry) -> Self {
        Self::build(entry.records, entry.timestamp)
    }

    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry::new(self.built_at, self.records.clone())
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in ascending symbol order
    pub fn records(&self) -> &[InstrumentRecord] {
        &self.records
    }

    /// Case-insensitive exact lookup
    pub fn get(&self, symbol: &str) -> Option<&InstrumentRecord> {
        let symbol = normalize_symbol(symbol)?;
        self.records
            .binary_search_by(|r| r.symbol.as_str().cmp(symbol.as_str()))
            .ok()
            .map(|i| &self.records[i])
    }

    /// Up to `limit` records whose symbol starts with the uppercased query.
    ///
    /// The result is always a contiguous sub-slice of [`records`](Self::records):
    /// a lower-bound binary search finds the first candidate, and the matching
    /// run ends at the first symbol without the prefix.
    pub fn prefix_search(&self, query: &str, limit: usize) -> &[InstrumentRecord] {
        let prefix = match normalize_symbol(query) {
            Some(p) => p,
            None => return &[],
        };

        let start = self
            .records
            .partition_point(|r| r.symbol.as_str() < prefix.as_str());
        let tail = &self.records[start..];
        let end = tail
            .iter()
            .take(limit)
            .take_while(|r| r.symbol.starts_with(prefix.as_str()))
            .count();

        &tail[..end]
    }
}
