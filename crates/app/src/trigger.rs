use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sns_trigger_core::{parameters::build_parameters, TriggerDescriptor};
use sns_trigger_storage::{
    BuildQueueError, Database, StorageError, TriggerDataError, TriggerDataSession, TriggerState,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::queue::{BuildQueuer, PromotionHandle};
use crate::registry::{Lifecycle, TriggerEntry};

/// Errors raised by trigger lifecycle transitions and drains.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Data(#[from] TriggerDataError),
    #[error("failed to queue build: {0}")]
    Queue(#[from] BuildQueueError),
}

/// Runs lifecycle transitions and build drains against trigger storage.
#[derive(Clone)]
pub struct TriggerService {
    database: Database,
    queuer: Arc<dyn BuildQueuer>,
    flush_max_retries: u32,
}

impl TriggerService {
    pub fn new(database: Database, queuer: Arc<dyn BuildQueuer>, flush_max_retries: u32) -> Self {
        Self {
            database,
            queuer,
            flush_max_retries,
        }
    }

    /// Opens the live storage of `descriptor`.
    pub async fn open_state(
        &self,
        descriptor: &TriggerDescriptor,
    ) -> Result<TriggerState<TriggerDataSession>, StorageError> {
        TriggerState::open(
            &self.database,
            &descriptor.storage_scope(),
            descriptor.name(),
            self.flush_max_retries,
        )
        .await
    }

    /// Restores the data kept while inactive and drops stale messages.
    ///
    /// A live row written while inactive (a confirmation or an unsubscribe)
    /// is newer than the kept copy and wins. The kept copy is always deleted.
    /// Returns `false` when the trigger was already active.
    pub async fn activate(&self, entry: &TriggerEntry) -> Result<bool, TriggerError> {
        let mut lifecycle = entry.lifecycle().lock().await;
        if *lifecycle == Lifecycle::Active {
            return Ok(false);
        }

        let descriptor = entry.descriptor();
        let repository = self.database.trigger_data();
        let live_scope = descriptor.storage_scope();
        let kept_scope = descriptor.inactive_storage_scope();
        if repository.load(&live_scope).await?.is_none() {
            if let Some(kept) = repository.load(&kept_scope).await? {
                repository
                    .overwrite(&live_scope, &kept.values, Utc::now())
                    .await?;
            }
        }
        repository.remove(&kept_scope).await?;

        let mut state = self.open_state(descriptor).await?;
        state.reset_messages().await?;

        *lifecycle = Lifecycle::Active;
        info!(
            stage = "trigger",
            trigger = %descriptor.name(),
            build_type = %descriptor.build_type_id,
            "trigger activated"
        );
        Ok(true)
    }

    /// Moves the live data aside so the subscription survives until the next activation.
    ///
    /// The kept copy is replaced as a whole, or deleted when nothing is live.
    /// Returns `false` when the trigger was already inactive.
    pub async fn deactivate(&self, entry: &TriggerEntry) -> Result<bool, TriggerError> {
        let mut lifecycle = entry.lifecycle().lock().await;
        if *lifecycle == Lifecycle::Inactive {
            return Ok(false);
        }

        let descriptor = entry.descriptor();
        let repository = self.database.trigger_data();
        let live_scope = descriptor.storage_scope();
        let kept_scope = descriptor.inactive_storage_scope();
        match repository.load(&live_scope).await? {
            Some(live) if !live.values.is_empty() => {
                repository
                    .overwrite(&kept_scope, &live.values, Utc::now())
                    .await?;
            }
            _ => {
                repository.remove(&kept_scope).await?;
            }
        }
        repository.remove(&live_scope).await?;

        *lifecycle = Lifecycle::Inactive;
        info!(
            stage = "trigger",
            trigger = %descriptor.name(),
            build_type = %descriptor.build_type_id,
            "trigger deactivated"
        );
        Ok(true)
    }

    /// Queues one build for the pending notifications of an active trigger.
    ///
    /// The build describes the most recent notification; every notification
    /// seen by this drain is removed afterwards.
    pub async fn trigger_build(
        &self,
        entry: &TriggerEntry,
    ) -> Result<Option<PromotionHandle>, TriggerError> {
        let lifecycle = entry.lifecycle().lock().await;
        if *lifecycle != Lifecycle::Active {
            return Ok(None);
        }
        self.drain(entry.descriptor()).await
    }

    async fn drain(
        &self,
        descriptor: &TriggerDescriptor,
    ) -> Result<Option<PromotionHandle>, TriggerError> {
        let mut state = self.open_state(descriptor).await?;
        if !state.has_new_notifications() {
            return Ok(None);
        }

        let pending = state.registered_messages()?;
        let Some(latest) = pending.latest() else {
            return Ok(None);
        };

        let parameters = build_parameters(&descriptor.parameters, latest);
        let promotion = self.queuer.create_promotion(descriptor, parameters).await?;
        self.queuer
            .enqueue(&promotion, &descriptor.triggered_by())
            .await?;

        counter!("builds_queued_total").increment(1);
        info!(
            stage = "trigger",
            trigger = %descriptor.name(),
            build_type = %promotion.build_type_id,
            promotion = %promotion.id,
            branch = %promotion.branch,
            message_id = %latest.message_id,
            drained = pending.len(),
            "build queued"
        );

        let outcome = state.remove_messages(&pending.ids()).await?;
        if !outcome.is_persisted() {
            warn!(
                stage = "trigger",
                trigger = %descriptor.name(),
                "drained messages could not be removed and may queue another build"
            );
        }
        Ok(Some(promotion))
    }
}
