use serde::{Deserialize, Serialize};
use wavelet_errors::Error;

/// Addresses a single record/blob within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef {
    pub namespace: String,
    pub id: String,
}

impl StorageRef {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

/// Options accompanying a write/delete. `concurrency_token` pins the write
/// to a previously observed version; a mismatch surfaces `PreconditionFailed`.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub concurrency_token: Option<String>,
}

/// `{lastId}` cursor, base64-JSON encoded, ordering rows by `id` ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "lastId")]
    pub last_id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, json)
    }

    pub fn decode(raw: &str) -> Result<Self, Error> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw)
            .map_err(|e| Error::validation(format!("malformed cursor: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::validation(format!("malformed cursor: {e}")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Read consistency mode for a storage-facade `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    #[default]
    Strong,
    Eventual,
    CacheOnly,
}

impl std::fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConsistencyMode::Strong => "strong",
            ConsistencyMode::Eventual => "eventual",
            ConsistencyMode::CacheOnly => "cache_only",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub consistency: ConsistencyMode,
    pub bypass_cache: bool,
    pub staleness_budget_ms: Option<i64>,
    pub timeout_ms: Option<u64>,
}

/// How a read was satisfied, attached to responses/metrics as a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLabel {
    Hit,
    Stale,
    Miss,
    Bypassed,
}

impl std::fmt::Display for CacheLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheLabel::Hit => "hit",
            CacheLabel::Stale => "stale",
            CacheLabel::Miss => "miss",
            CacheLabel::Bypassed => "bypassed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor { last_id: "row-42".into() };
        let encoded = cursor.encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded.last_id, "row-42");
    }

    #[test]
    fn malformed_cursor_is_validation_error() {
        let err = Cursor::decode("not-base64!!").unwrap_err();
        assert_eq!(err.code, wavelet_errors::ErrorCode::ValidationFailed);
    }
}
