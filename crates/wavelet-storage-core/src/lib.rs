//! Shared types and the guarded-call combinator used by every storage
//! adapter and the storage facade: namespace/cursor/consistency models, the
//! adapter traits, and `guarded()`, which wraps a delegate call in a
//! breaker check, a timeout race, retries, and metrics/logging.

mod guarded;
mod models;
mod traits;

pub use guarded::{guarded, CallLabels};
pub use models::{CacheLabel, ConsistencyMode, Cursor, Page, Pagination, ReadOptions, StorageRef, WriteOptions};
pub use traits::{BlobAdapter, PutBlob, RecordAdapter, StoredBlob, StreamAdapter, StreamEntry};
