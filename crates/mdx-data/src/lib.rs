//! Instrument master data pipeline: fetch the published master CSV files,
//! normalize and index them by trading symbol, persist the index, and serve
//! prefix search while tracking freshness.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod freshness;
pub mod index;
pub mod loaders;
pub mod providers;
pub mod service;
pub mod sources;
pub mod storage;

pub use cache::*;
pub use catalog::*;
pub use config::*;
pub use freshness::*;
pub use index::*;
pub use loaders::*;
pub use providers::*;
pub use service::*;
pub use sources::*;
pub use storage::*;
