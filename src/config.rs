use std::time::Duration;

use serde::Deserialize;

const DEFAULT_LIST_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_LIST_CACHE_CAPACITY: usize = 1000;

/// Tunables of the [crate::Evaluator].
///
/// Can be deserialized from the host's configuration (`listCacheTtlSecs`, `listCacheCapacity`,
/// `impressionsEnabled`; all optional) or assembled with the builder-style setters.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluatorConfig {
    list_cache_ttl_secs: u64,
    list_cache_capacity: usize,
    impressions_enabled: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            list_cache_ttl_secs: DEFAULT_LIST_CACHE_TTL_SECS,
            list_cache_capacity: DEFAULT_LIST_CACHE_CAPACITY,
            impressions_enabled: true,
        }
    }
}

impl EvaluatorConfig {
    /// How long a list membership answer is reused before the remote service is asked again.
    pub fn list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.list_cache_ttl_secs)
    }

    pub fn list_cache_capacity(&self) -> usize {
        self.list_cache_capacity
    }

    pub fn impressions_enabled(&self) -> bool {
        self.impressions_enabled
    }

    pub fn with_list_cache_ttl(mut self, ttl: Duration) -> Self {
        self.list_cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_list_cache_capacity(mut self, capacity: usize) -> Self {
        self.list_cache_capacity = capacity;
        self
    }

    pub fn with_impressions_enabled(mut self, enabled: bool) -> Self {
        self.impressions_enabled = enabled;
        self
    }
}
