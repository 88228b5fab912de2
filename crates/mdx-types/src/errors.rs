use thiserror::Error;

/// Main error type for the master data pipeline
#[derive(Error, Debug)]
pub enum MdxError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while fetching, parsing, indexing or persisting master data.
///
/// Per-row rejections are not errors; they are counted in the parser stats.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Fetch timed out for {url} after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("CSV parse failed for {source_name}: {message}")]
    Parse { source_name: String, message: String },

    #[error("Catalog error: no master files returned")]
    NoSourceFiles,

    #[error("No usable records parsed from {files_attempted} source file(s)")]
    EmptyResult { files_attempted: usize },

    #[error("Store write failed: {message}")]
    StoreWrite { message: String },

    #[error("Store read failed: {message}")]
    StoreRead { message: String },

    #[error("Sync failed: {message}")]
    SyncFailed { message: String },
}

impl MdxError {
    /// The underlying data error, if this is one.
    pub fn as_data(&self) -> Option<&DataError> {
        match self {
            MdxError::Data(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for master data operations
pub type MdxResult<T> = Result<T, MdxError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::MdxError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::MdxError::Config(format!($($arg)*))
    };
}
