//! Process configuration: the `AppConfig` CLI/env surface the binary parses
//! at startup, and the versioned `StorageConfig` document the storage facade
//! loads to wire up its adapters.

mod app;
mod storage;

pub use app::AppConfig;
pub use storage::{
    AdapterBinding, AdapterRef, CacheConfig, ConsistencyConfig, Namespaces, StorageConfig,
};
