use std::collections::{BTreeMap, BTreeSet};

use crate::types::NotificationRecord;

/// Notifications waiting for the next poll, keyed by message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingMessages {
    records: BTreeMap<String, NotificationRecord>,
}

impl PendingMessages {
    /// Parses the stored representation. `None` and blank text are an empty map.
    pub fn parse(raw: Option<&str>) -> Result<Self, serde_json::Error> {
        match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => Ok(Self::default()),
            Some(raw) => Ok(Self {
                records: serde_json::from_str(raw)?,
            }),
        }
    }

    /// Stored representation; an empty map has none.
    pub fn to_stored(&self) -> Result<Option<String>, serde_json::Error> {
        if self.records.is_empty() {
            return Ok(None);
        }
        serde_json::to_string(&self.records).map(Some)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Inserts `record`, replacing any earlier record with the same id.
    pub fn upsert(&mut self, record: NotificationRecord) {
        self.records.insert(record.message_id.clone(), record);
    }

    pub fn get(&self, message_id: &str) -> Option<&NotificationRecord> {
        self.records.get(message_id)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<NotificationRecord> {
        self.records.remove(message_id)
    }

    pub fn remove_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        for id in ids {
            self.records.remove(id);
        }
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.records.keys().cloned().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.records.values()
    }

    /// Record with the greatest timestamp. Among equal timestamps the last id wins.
    pub fn latest(&self) -> Option<&NotificationRecord> {
        self.records
            .values()
            .max_by(|left, right| left.timestamp.cmp(&right.timestamp))
    }
}

impl FromIterator<NotificationRecord> for PendingMessages {
    fn from_iter<I: IntoIterator<Item = NotificationRecord>>(iter: I) -> Self {
        let mut pending = Self::default();
        for record in iter {
            pending.upsert(record);
        }
        pending
    }
}
