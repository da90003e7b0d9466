use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use sns_trigger_core::StoredValues;

use crate::{CasOutcome, StorageError, TriggerDataRepository};

/// How a flush treats a record that changed since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Return [`StorageError::Conflict`] and keep local edits.
    Fail,
    /// Replace whatever is persisted with the local values.
    Overwrite,
}

/// Key-value storage attached to a single trigger scope.
///
/// Reads and puts operate on an in-memory copy; `flush` persists it and
/// `refresh` reloads the persisted state, dropping unflushed edits.
#[async_trait]
pub trait CustomDataStorage: Send {
    fn value(&self, key: &str) -> Option<String>;

    /// All values, or `None` when nothing is stored.
    fn values(&self) -> Option<StoredValues>;

    /// Sets `key`; `None` removes it.
    fn put_value(&mut self, key: &str, value: Option<String>);

    fn put_values(&mut self, values: BTreeMap<String, Option<String>>);

    async fn flush(&mut self, resolution: ConflictResolution) -> Result<(), StorageError>;

    async fn refresh(&mut self) -> Result<(), StorageError>;
}

/// [`CustomDataStorage`] backed by a `trigger_data` row.
pub struct TriggerDataSession {
    repository: TriggerDataRepository,
    scope: String,
    version: i64,
    values: StoredValues,
    dirty: bool,
}

impl TriggerDataSession {
    /// Loads the current state of `scope`.
    pub async fn open(
        repository: TriggerDataRepository,
        scope: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let mut session = Self {
            repository,
            scope: scope.into(),
            version: 0,
            values: StoredValues::new(),
            dirty: false,
        };
        session.refresh().await?;
        Ok(session)
    }

    /// Version of the persisted row this session is based on; 0 when absent.
    #[cfg(test)]
    pub fn version(&self) -> i64 {
        self.version
    }
}

#[async_trait]
impl CustomDataStorage for TriggerDataSession {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn values(&self) -> Option<StoredValues> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.clone())
        }
    }

    fn put_value(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(value) => self.values.insert(key.to_string(), value),
            None => self.values.remove(key),
        };
        self.dirty = true;
    }

    fn put_values(&mut self, values: BTreeMap<String, Option<String>>) {
        for (key, value) in values {
            self.put_value(&key, value);
        }
    }

    async fn flush(&mut self, resolution: ConflictResolution) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }

        let now = Utc::now();
        match resolution {
            ConflictResolution::Fail => {
                match self
                    .repository
                    .compare_and_swap(&self.scope, self.version, &self.values, now)
                    .await?
                {
                    CasOutcome::Written { version } => self.version = version,
                    CasOutcome::Conflict => {
                        debug!(
                            stage = "storage",
                            scope = %self.scope,
                            version = self.version,
                            "trigger data changed concurrently"
                        );
                        return Err(StorageError::Conflict(self.scope.clone()));
                    }
                }
            }
            ConflictResolution::Overwrite => {
                self.version = self
                    .repository
                    .overwrite(&self.scope, &self.values, now)
                    .await?;
            }
        }

        self.dirty = false;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), StorageError> {
        let row = self.repository.load(&self.scope).await?.unwrap_or_default();
        self.values = row.values;
        self.version = row.version;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{setup_db, values};

    #[tokio::test]
    async fn flush_persists_and_refresh_reloads() {
        let db = setup_db().await;
        let mut session = TriggerDataSession::open(db.trigger_data(), "bt:t1")
            .await
            .expect("open");
        assert!(session.values().is_none());

        session.put_value("topicArn", Some("arn-1".into()));
        session.flush(ConflictResolution::Fail).await.expect("flush");
        assert_eq!(session.version(), 1);

        let reopened = TriggerDataSession::open(db.trigger_data(), "bt:t1")
            .await
            .expect("reopen");
        assert_eq!(reopened.values(), Some(values(&[("topicArn", "arn-1")])));

        session.put_value("topicArn", None);
        session.refresh().await.expect("refresh");
        assert_eq!(session.value("topicArn").as_deref(), Some("arn-1"));
    }

    #[tokio::test]
    async fn stale_session_conflicts_unless_overwriting() {
        let db = setup_db().await;
        let mut first = TriggerDataSession::open(db.trigger_data(), "bt:t1")
            .await
            .expect("open first");
        let mut second = TriggerDataSession::open(db.trigger_data(), "bt:t1")
            .await
            .expect("open second");

        first.put_value("a", Some("1".into()));
        first.flush(ConflictResolution::Fail).await.expect("first flush");

        second.put_value("b", Some("2".into()));
        let err = second
            .flush(ConflictResolution::Fail)
            .await
            .expect_err("stale flush");
        assert!(err.is_conflict());

        second
            .flush(ConflictResolution::Overwrite)
            .await
            .expect("overwrite");
        assert_eq!(second.version(), 2);

        first.refresh().await.expect("refresh");
        assert_eq!(first.values(), Some(values(&[("b", "2")])));
    }
}
