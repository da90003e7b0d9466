use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sns_trigger_core::TriggerDescriptor;
use sns_trigger_storage::{BuildQueueError, BuildQueueRepository, Database, NewPromotion};
use uuid::Uuid;

/// Branch used when a trigger does not name one.
pub const DEFAULT_BRANCH: &str = "";

/// A build promotion created for a trigger but not yet queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionHandle {
    pub id: String,
    pub build_type_id: String,
    pub branch: String,
    pub parameters: BTreeMap<String, String>,
}

/// Hands builds over to the build server queue.
#[async_trait]
pub trait BuildQueuer: Send + Sync {
    async fn create_promotion(
        &self,
        descriptor: &TriggerDescriptor,
        parameters: BTreeMap<String, String>,
    ) -> Result<PromotionHandle, BuildQueueError>;

    async fn enqueue(
        &self,
        promotion: &PromotionHandle,
        triggered_by: &str,
    ) -> Result<(), BuildQueueError>;
}

/// [`BuildQueuer`] that records promotions in the `build_queue` table.
#[derive(Clone)]
pub struct DatabaseBuildQueuer {
    repository: BuildQueueRepository,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl DatabaseBuildQueuer {
    pub fn new(database: &Database) -> Self {
        Self {
            repository: database.build_queue(),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl BuildQueuer for DatabaseBuildQueuer {
    async fn create_promotion(
        &self,
        descriptor: &TriggerDescriptor,
        parameters: BTreeMap<String, String>,
    ) -> Result<PromotionHandle, BuildQueueError> {
        let id = Uuid::new_v4().to_string();
        let branch = descriptor
            .branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());

        self.repository
            .insert_pending(NewPromotion {
                id: &id,
                trigger_id: &descriptor.id,
                build_type_id: &descriptor.build_type_id,
                branch: &branch,
                parameters_json: serde_json::to_string(&parameters)?,
                created_at: (self.clock)(),
            })
            .await?;

        Ok(PromotionHandle {
            id,
            build_type_id: descriptor.build_type_id.clone(),
            branch,
            parameters,
        })
    }

    async fn enqueue(
        &self,
        promotion: &PromotionHandle,
        triggered_by: &str,
    ) -> Result<(), BuildQueueError> {
        self.repository
            .mark_queued(&promotion.id, triggered_by, (self.clock)())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use chrono::TimeZone;

    fn descriptor(branch: Option<&str>) -> TriggerDescriptor {
        TriggerDescriptor {
            id: "TRIGGER_1".into(),
            project_id: "Proj".into(),
            build_type_id: "Proj_Build".into(),
            trigger_uuid: "5c1b0f7e".into(),
            display_name: None,
            branch: branch.map(str::to_string),
            parameters: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn promotion_is_pending_until_enqueued() {
        let db = setup_db().await;
        let fixed = Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap();
        let queuer = DatabaseBuildQueuer::new(&db).with_clock(Arc::new(move || fixed));

        let mut parameters = BTreeMap::new();
        parameters.insert("sns.message.subject".to_string(), "Deploy".to_string());
        let promotion = queuer
            .create_promotion(&descriptor(None), parameters)
            .await
            .expect("create");
        assert_eq!(promotion.branch, DEFAULT_BRANCH);

        let rows = db
            .build_queue()
            .list_for_trigger("Proj_Build", "TRIGGER_1")
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "PENDING");
        assert_eq!(rows[0].parameters_json, r#"{"sns.message.subject":"Deploy"}"#);
        assert_eq!(rows[0].created_at, "2024-04-01T10:00:00.000Z");

        let triggered_by = descriptor(None).triggered_by();
        queuer
            .enqueue(&promotion, &triggered_by)
            .await
            .expect("enqueue");

        let rows = db
            .build_queue()
            .list_for_trigger("Proj_Build", "TRIGGER_1")
            .await
            .expect("list");
        assert_eq!(rows[0].status, "QUEUED");
        assert_eq!(rows[0].triggered_by.as_deref(), Some(triggered_by.as_str()));
    }

    #[tokio::test]
    async fn promotion_uses_descriptor_branch() {
        let db = setup_db().await;
        let queuer = DatabaseBuildQueuer::new(&db);

        let promotion = queuer
            .create_promotion(&descriptor(Some("refs/heads/release")), BTreeMap::new())
            .await
            .expect("create");
        assert_eq!(promotion.branch, "refs/heads/release");
        assert_eq!(promotion.build_type_id, "Proj_Build");
    }
}
