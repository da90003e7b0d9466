use std::collections::BTreeMap;

use metrics::counter;
use tracing::{debug, error};

use sns_trigger_core::{merge, StoredValues};

use crate::{ConflictResolution, CustomDataStorage, StorageError};

/// Conflict retries performed after the first flush attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Result of a conflict-safe flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Local edits are persisted; `attempts` counts flush calls including the successful one.
    Persisted { attempts: u32 },
    /// Every attempt conflicted and the local edits were not persisted.
    Abandoned,
}

impl FlushOutcome {
    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Persisted { .. })
    }
}

/// Writes through a [`CustomDataStorage`] and reconciles concurrent writers.
///
/// A conflicting flush reloads the persisted values, three-way merges them
/// with this writer's edits relative to the values it started from, and tries
/// again.
pub struct ConflictSafeStorage<S> {
    storage: S,
    base: StoredValues,
    local: StoredValues,
    max_retries: u32,
}

impl<S: CustomDataStorage> ConflictSafeStorage<S> {
    pub fn new(storage: S, max_retries: u32) -> Self {
        let base = storage.values().unwrap_or_default();
        Self {
            local: base.clone(),
            base,
            storage,
            max_retries,
        }
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.storage.value(key)
    }

    pub fn values(&self) -> Option<StoredValues> {
        self.storage.values()
    }

    pub async fn put_value(
        &mut self,
        key: &str,
        value: Option<String>,
    ) -> Result<FlushOutcome, StorageError> {
        apply(&mut self.local, key, value.clone());
        self.storage.put_value(key, value);
        self.flush().await
    }

    pub async fn put_values(
        &mut self,
        values: BTreeMap<String, Option<String>>,
    ) -> Result<FlushOutcome, StorageError> {
        for (key, value) in &values {
            apply(&mut self.local, key, value.clone());
        }
        self.storage.put_values(values);
        self.flush().await
    }

    /// Persists pending edits, merging with concurrent writers on conflict.
    pub async fn flush(&mut self) -> Result<FlushOutcome, StorageError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.storage.flush(ConflictResolution::Fail).await {
                Ok(()) => {
                    self.rebase();
                    return Ok(FlushOutcome::Persisted { attempts });
                }
                Err(StorageError::Conflict(scope)) => {
                    counter!("trigger_store_flush_conflicts_total").increment(1);
                    if attempts > self.max_retries {
                        counter!("trigger_store_flush_abandoned_total").increment(1);
                        error!(
                            stage = "storage",
                            %scope,
                            attempts,
                            "failed to flush trigger data after retries, data may be lost"
                        );
                        return Ok(FlushOutcome::Abandoned);
                    }

                    debug!(stage = "storage", %scope, attempts, "merging concurrent trigger data");
                    self.storage.refresh().await?;
                    let remote = self.storage.values().unwrap_or_default();
                    let merged = merge(&self.base, &self.local, &remote);
                    self.storage.put_values(merged);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Consumes the wrapper and returns the inner storage.
    pub fn into_inner(self) -> S {
        self.storage
    }

    // Later merges must diff against what is now persisted, not the original read.
    fn rebase(&mut self) {
        self.base = self.storage.values().unwrap_or_default();
        self.local = self.base.clone();
    }
}

fn apply(values: &mut StoredValues, key: &str, value: Option<String>) {
    match value {
        Some(value) => values.insert(key.to_string(), value),
        None => values.remove(key),
    };
}
