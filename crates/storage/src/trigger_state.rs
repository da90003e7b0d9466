use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{info, warn};

use sns_trigger_core::{
    types::{STORE_MESSAGES, STORE_SUBSCRIPTION_ARN, STORE_TOPIC_ARN, STORE_UNSUBSCRIBE_URL},
    NotificationRecord, PendingMessages, SubscriptionState,
};

use crate::{
    ConflictSafeStorage, CustomDataStorage, Database, FlushOutcome, StorageError,
    TriggerDataSession,
};

/// Errors raised while reading or updating the state of one trigger.
#[derive(Debug, Error)]
pub enum TriggerDataError {
    #[error("Trigger {trigger} isn't subscribed to topic {topic}")]
    NotSubscribed { trigger: String, topic: String },
    #[error("stored messages are corrupt: {0}")]
    Messages(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Typed view over the key-value storage of one trigger instance.
pub struct TriggerState<S> {
    trigger: String,
    storage: ConflictSafeStorage<S>,
}

impl TriggerState<TriggerDataSession> {
    /// Opens the state stored under `scope` in `database`.
    pub async fn open(
        database: &Database,
        scope: &str,
        trigger: impl Into<String>,
        max_retries: u32,
    ) -> Result<Self, StorageError> {
        let session = TriggerDataSession::open(database.trigger_data(), scope).await?;
        Ok(Self::new(
            ConflictSafeStorage::new(session, max_retries),
            trigger,
        ))
    }
}

impl<S: CustomDataStorage> TriggerState<S> {
    pub fn new(storage: ConflictSafeStorage<S>, trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            storage,
        }
    }

    pub fn subscription(&self) -> SubscriptionState {
        SubscriptionState {
            topic_arn: self.storage.value(STORE_TOPIC_ARN),
            subscription_arn: self.storage.value(STORE_SUBSCRIPTION_ARN),
            unsubscribe_url: self.storage.value(STORE_UNSUBSCRIBE_URL),
        }
    }

    /// Records a confirmed subscription.
    pub async fn confirm_subscription(
        &mut self,
        subscription_arn: &str,
        topic_arn: Option<&str>,
    ) -> Result<FlushOutcome, StorageError> {
        let mut values = BTreeMap::new();
        values.insert(
            STORE_SUBSCRIPTION_ARN.to_string(),
            Some(subscription_arn.to_string()),
        );
        values.insert(STORE_TOPIC_ARN.to_string(), topic_arn.map(str::to_string));
        let outcome = self.storage.put_values(values).await?;

        info!(
            stage = "subscription",
            trigger = %self.trigger,
            %subscription_arn,
            topic_arn = topic_arn.unwrap_or_default(),
            "subscription confirmed"
        );
        Ok(outcome)
    }

    /// Drops the subscription together with every pending message.
    pub async fn clear_subscription(&mut self) -> Result<FlushOutcome, StorageError> {
        let values = [
            STORE_SUBSCRIPTION_ARN,
            STORE_TOPIC_ARN,
            STORE_UNSUBSCRIBE_URL,
            STORE_MESSAGES,
        ]
        .into_iter()
        .map(|key| (key.to_string(), None))
        .collect();
        let outcome = self.storage.put_values(values).await?;

        info!(stage = "subscription", trigger = %self.trigger, "subscription removed");
        Ok(outcome)
    }

    /// Stores a notification for the next poll when it belongs to the stored subscription.
    pub async fn register_notification(
        &mut self,
        record: NotificationRecord,
    ) -> Result<FlushOutcome, TriggerDataError> {
        let subscription = self.subscription();
        if !subscription.accepts(record.subscription_arn.as_deref()) {
            let topic = record.topic.clone().unwrap_or_default();
            warn!(
                stage = "storage",
                trigger = %self.trigger,
                %topic,
                message_id = %record.message_id,
                "notification rejected for unknown subscription"
            );
            return Err(TriggerDataError::NotSubscribed {
                trigger: self.trigger.clone(),
                topic,
            });
        }

        let mut pending = self.registered_messages()?;
        let mut values = BTreeMap::new();
        values.insert(
            STORE_UNSUBSCRIBE_URL.to_string(),
            record.unsubscribe_url.clone(),
        );
        pending.upsert(record);
        values.insert(STORE_MESSAGES.to_string(), pending.to_stored()?);

        Ok(self.storage.put_values(values).await?)
    }

    pub fn has_new_notifications(&self) -> bool {
        self.storage.value(STORE_MESSAGES).is_some()
    }

    pub fn registered_messages(&self) -> Result<PendingMessages, TriggerDataError> {
        Ok(PendingMessages::parse(
            self.storage.value(STORE_MESSAGES).as_deref(),
        )?)
    }

    /// Removes `ids` from the pending messages in a single write.
    pub async fn remove_messages(
        &mut self,
        ids: &BTreeSet<String>,
    ) -> Result<FlushOutcome, TriggerDataError> {
        let mut pending = self.registered_messages()?;
        pending.remove_all(ids);
        Ok(self
            .storage
            .put_value(STORE_MESSAGES, pending.to_stored()?)
            .await?)
    }

    pub async fn reset_messages(&mut self) -> Result<FlushOutcome, StorageError> {
        self.storage.put_value(STORE_MESSAGES, None).await
    }
}
