use std::collections::HashMap;

use log::{debug, error, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of the storage keys under which mutually exclusive group winners are recorded.
pub const MEG_STORAGE_KEY_PREFIX: &str = "_vwo_meta_meg_";

/// Storage is an interface for the host's key-value store, used to keep decisions sticky across
/// evaluations.
///
/// Keys are built by the evaluator (see [StoredDecision::storage_key]); values are opaque JSON
/// maps that the evaluator writes and reads back.
pub trait Storage: Send + Sync {
    /// Retrieve the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored decision could not be decoded: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A decision recorded for a (feature, user) pair.
///
/// Rollout and experiment parts are independent: a user can be stuck to a rollout and still be
/// evaluated for experiments.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDecision {
    pub feature_key: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_variation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_variation_id: Option<u64>,
}

impl StoredDecision {
    pub fn storage_key(feature_key: &str, user_id: &str) -> String {
        format!("{}_{}", feature_key, user_id)
    }

    /// The synthetic feature key under which a group's winner is recorded.
    pub fn group_feature_key(group_id: u64) -> String {
        format!("{}{}", MEG_STORAGE_KEY_PREFIX, group_id)
    }

    pub fn has_rollout(&self) -> bool {
        self.rollout_id.is_some() && self.rollout_key.is_some()
    }
}

/// Read the decision stored for `feature_key` and `user_id`. Backend failures and records that
/// fail to decode are logged and treated as absent.
pub(crate) fn load_decision(
    storage: &dyn Storage,
    feature_key: &str,
    user_id: &str,
) -> Option<StoredDecision> {
    let key = StoredDecision::storage_key(feature_key, user_id);
    let value = match storage.get(&key) {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(e) => {
            error!("Failed to read stored decision for {}: {}", key, e);
            return None;
        }
    };

    match serde_json::from_value::<StoredDecision>(value) {
        Ok(decision) => Some(decision),
        Err(e) => {
            warn!(
                "Ignoring stored decision for {}: {}",
                key,
                StorageError::from(e)
            );
            None
        }
    }
}

pub(crate) fn save_decision(storage: &dyn Storage, decision: &StoredDecision) {
    let key = StoredDecision::storage_key(&decision.feature_key, &decision.user_id);
    let value = match serde_json::to_value(decision) {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to encode decision for {}: {}", key, e);
            return;
        }
    };
    match storage.set(&key, value) {
        Ok(()) => debug!("Stored decision for {}", key),
        Err(e) => error!("Failed to store decision for {}: {}", key, e),
    }
}

/// A [Storage] backed by a process-local map. Useful for tests and for hosts without durable
/// storage.
#[derive(Default)]
pub struct InMemoryStorage {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}
