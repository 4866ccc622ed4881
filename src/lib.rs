//! runtable Storage Engine
//!
//! Embedded, versioned, columnar table store backing structured metrics,
//! parameters and evaluation rows recorded by machine-learning jobs.
//!
//! ## Architecture
//! - Durability: single write-ahead log + full-state checkpoints; every
//!   batch is durable before it is visible
//! - Tables: key-ordered row index with per-key version chains, tombstones
//!   and time-travel reads
//! - Queries: boolean predicate trees, stable ordering, offset/limit paging
//! - Scans: multi-table key-range merge with a pagination cursor
//!
//! ## Quick start
//!
//! ```no_run
//! use runtable::{Store, StoreConfig, UpdateTableRequest, QueryRequest};
//!
//! # fn main() -> runtable::Result<()> {
//! let store = Store::open(StoreConfig::new("./data"))?;
//!
//! let update: UpdateTableRequest = serde_json::from_value(serde_json::json!({
//!     "tableName": "run42/metrics",
//!     "tableSchema": {
//!         "keyColumn": "step",
//!         "columns": [
//!             {"name": "step", "type": "INT64"},
//!             {"name": "loss", "type": "FLOAT64"}
//!         ]
//!     },
//!     "records": [{"step": 1, "loss": 0.75}]
//! })).unwrap();
//! store.update_table(&update)?;
//!
//! let query: QueryRequest = serde_json::from_value(serde_json::json!({
//!     "tableName": "run42/metrics"
//! })).unwrap();
//! let rows = store.query(&query)?;
//! assert_eq!(rows.records.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod filter;
pub mod query;
pub mod scan;
pub mod store;
pub mod table;
pub mod types;
pub mod wal;

mod api;
mod error;

pub use api::{
    decode_filter, ColumnSpec, FilterSpec, OperandSpec, OrderBySpec, QueryRequest, ScanRequest,
    ScanTableSpec, Store, TableSchemaSpec, UpdateTableRequest, UpdateTableResponse,
};
pub use config::{DurabilityLevel, StoreConfig, QUERY_LIMIT};
pub use error::{Result, StoreError};
pub use filter::{FilterNode, FilterOp, Operand};
pub use query::{OrderBy, QueryOptions, RecordList};
pub use scan::{ScanOptions, ScanTable};
pub use store::{StoreStats, TableStore};
pub use types::{ColumnSchema, ColumnType, Revision, SchemaDesc, TableSchema, Value};
