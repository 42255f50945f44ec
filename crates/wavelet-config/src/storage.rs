use serde::{Deserialize, Serialize};
use wavelet_errors::Error;

const SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// `namespaces` accepts either a single string or a list; both normalize to
/// a `Vec<String>` for matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Namespaces {
    One(String),
    Many(Vec<String>),
}

impl Namespaces {
    pub fn as_slice(&self) -> Vec<&str> {
        match self {
            Namespaces::One(s) => vec![s.as_str()],
            Namespaces::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }

    pub fn matches(&self, namespace: &str) -> bool {
        self.as_slice().iter().any(|n| *n == namespace || *n == "*")
    }
}

/// Exactly one of `adapter` (a named, pre-registered instance) or `factory`
/// (a constructor key the facade resolves against its builder registry)
/// must be present. Enforced by [`AdapterBinding::validate`] rather than by
/// the shape of the type, since JSON offers no native "exactly one of".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterBinding {
    pub namespaces: Namespaces,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub factory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRef<'a> {
    Named(&'a str),
    Factory(&'a str),
}

impl AdapterBinding {
    pub fn resolve(&self) -> Result<AdapterRef<'_>, Error> {
        match (&self.adapter, &self.factory) {
            (Some(name), None) => Ok(AdapterRef::Named(name)),
            (None, Some(key)) => Ok(AdapterRef::Factory(key)),
            (None, None) => Err(Error::validation(
                "adapter binding must set exactly one of `adapter` or `factory`, got neither",
            )),
            (Some(_), Some(_)) => Err(Error::validation(
                "adapter binding must set exactly one of `adapter` or `factory`, got both",
            )),
        }
    }
}

fn default_provider() -> String {
    "in-memory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "maxItems")]
    pub max_items: Option<u64>,
    #[serde(default, rename = "maxBytes")]
    pub max_bytes: Option<u64>,
    #[serde(default, rename = "ttlSeconds")]
    pub ttl_seconds: Option<u64>,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, rename = "providerConfig")]
    pub provider_config: serde_json::Value,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_items: None,
            max_bytes: None,
            ttl_seconds: None,
            provider: default_provider(),
            provider_config: serde_json::Value::Null,
        }
    }
}

fn default_staleness_budget_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default = "default_staleness_budget_ms", rename = "stalenessBudgetMs")]
    pub staleness_budget_ms: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            staleness_budget_ms: default_staleness_budget_ms(),
        }
    }
}

/// The versioned storage configuration document the facade loads at
/// startup. A `schemaVersion` mismatch is a fatal startup error, never a
/// silent fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default, rename = "blobAdapters")]
    pub blob_adapters: Vec<AdapterBinding>,
    #[serde(default, rename = "recordAdapters")]
    pub record_adapters: Vec<AdapterBinding>,
    #[serde(default, rename = "streamAdapters")]
    pub stream_adapters: Vec<AdapterBinding>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub observability: serde_json::Value,
    #[serde(default, rename = "featureFlags")]
    pub feature_flags: serde_json::Value,
}

impl StorageConfig {
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        let cfg: StorageConfig = serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("malformed storage config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(Error::new(
                wavelet_errors::ErrorCode::ValidationFailed,
                format!(
                    "unsupported storage config schemaVersion {} (expected {})",
                    self.schema_version, SUPPORTED_SCHEMA_VERSION
                ),
            ));
        }
        for binding in self
            .blob_adapters
            .iter()
            .chain(self.record_adapters.iter())
            .chain(self.stream_adapters.iter())
        {
            binding.resolve()?;
        }
        Ok(())
    }

    /// Finds the first binding whose namespace pattern matches, in
    /// declaration order, for the given adapter list.
    pub fn find_binding<'a>(
        bindings: &'a [AdapterBinding],
        namespace: &str,
    ) -> Option<&'a AdapterBinding> {
        bindings.iter().find(|b| b.namespaces.matches(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: u32) -> String {
        format!(
            r#"{{
                "schemaVersion": {version},
                "recordAdapters": [
                    {{"namespaces": ["tenant-a", "tenant-b"], "adapter": "postgres-primary"}}
                ],
                "cache": {{"enabled": true, "ttlSeconds": 30}},
                "consistency": {{"stalenessBudgetMs": 50}}
            }}"#
        )
    }

    #[test]
    fn rejects_schema_version_mismatch() {
        let err = StorageConfig::from_json(&sample(2)).unwrap_err();
        assert_eq!(err.code, wavelet_errors::ErrorCode::ValidationFailed);
    }

    #[test]
    fn parses_valid_config_and_matches_namespace() {
        let cfg = StorageConfig::from_json(&sample(1)).unwrap();
        assert_eq!(cfg.consistency.staleness_budget_ms, 50);
        let binding = StorageConfig::find_binding(&cfg.record_adapters, "tenant-a").unwrap();
        assert_eq!(binding.resolve().unwrap(), AdapterRef::Named("postgres-primary"));
    }

    #[test]
    fn binding_with_both_adapter_and_factory_is_rejected() {
        let binding = AdapterBinding {
            namespaces: Namespaces::One("tenant-a".into()),
            adapter: Some("x".into()),
            factory: Some("y".into()),
        };
        assert!(binding.resolve().is_err());
    }
}
