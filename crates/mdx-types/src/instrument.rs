use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One canonical row of instrument master data.
///
/// Serialized with short field names (`s`, `t`, `e`, `st`, `ot`, `ls`) to keep
/// the persisted index small; empty optional fields are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRecord {
    /// Trading symbol, trimmed and uppercased. Sole identity within an index.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Exchange instrument token
    #[serde(rename = "t", default)]
    pub token: String,
    #[serde(rename = "e", default)]
    pub exchange: String,
    #[serde(rename = "st", default, skip_serializing_if = "String::is_empty")]
    pub strike_price: String,
    /// CE/PE for options, empty otherwise
    #[serde(rename = "ot", default, skip_serializing_if = "String::is_empty")]
    pub option_type: String,
    #[serde(rename = "ls", default, skip_serializing_if = "String::is_empty")]
    pub lot_size: String,
}

impl InstrumentRecord {
    /// Create a record, normalizing the symbol. Returns `None` for a blank symbol.
    pub fn new(symbol: &str, token: &str, exchange: &str) -> Option<Self> {
        let symbol = normalize_symbol(symbol)?;
        Some(Self {
            symbol,
            token: token.trim().to_string(),
            exchange: exchange.trim().to_string(),
            strike_price: String::new(),
            option_type: String::new(),
            lot_size: String::new(),
        })
    }

    pub fn with_strike(mut self, strike_price: &str) -> Self {
        self.strike_price = strike_price.trim().to_string();
        self
    }

    pub fn with_option_type(mut self, option_type: &str) -> Self {
        self.option_type = option_type.trim().to_string();
        self
    }

    pub fn with_lot_size(mut self, lot_size: &str) -> Self {
        self.lot_size = lot_size.trim().to_string();
        self
    }

    /// True for CE/PE contracts.
    pub fn is_option(&self) -> bool {
        !self.option_type.is_empty()
    }
}

impl fmt::Display for InstrumentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.exchange, self.symbol, self.token)
    }
}

/// Trim and uppercase a trading symbol; `None` when nothing is left.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// What a persistent store holds: the build timestamp and every record of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub timestamp: DateTime<Utc>,
    pub records: Vec<InstrumentRecord>,
}

impl CacheEntry {
    pub fn new(timestamp: DateTime<Utc>, records: Vec<InstrumentRecord>) -> Self {
        Self { timestamp, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
