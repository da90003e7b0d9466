use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sns_trigger_aws::{signature::DEFAULT_CACHE_CAPACITY, ReqwestHttpApi, SignatureVerifier};
use sns_trigger_core::{NotificationRecord, TriggerDescriptor};
use sns_trigger_storage::Database;

use crate::queue::DatabaseBuildQueuer;
use crate::registry::{TriggerEntry, TriggerRegistry};
use crate::router::AppState;
use crate::telemetry;
use crate::trigger::TriggerService;

pub const SUBSCRIPTION_ARN: &str = "arn:aws:sns:us-east-1:123456789012:builds:2bcfbf39";
pub const TOPIC_ARN: &str = "arn:aws:sns:us-east-1:123456789012:builds";

pub async fn setup_db() -> Database {
    let db = Database::connect("sqlite::memory:?cache=shared")
        .await
        .expect("connect");
    db.run_migrations().await.expect("migrations");
    db
}

/// State with the certificate host check disabled so fixtures can be served locally.
pub fn test_state(database: Database, registry: TriggerRegistry) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics");
    let http = Arc::new(ReqwestHttpApi::new(Duration::from_secs(5)).expect("client"));
    let verifier = Arc::new(SignatureVerifier::new(
        http.clone(),
        None,
        DEFAULT_CACHE_CAPACITY,
    ));
    let queuer = Arc::new(DatabaseBuildQueuer::new(&database));
    let service = TriggerService::new(database, queuer, 10);
    AppState::new(metrics, registry, service, verifier, http)
}

pub fn descriptor() -> TriggerDescriptor {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "deploy.title".to_string(),
        "Build: ${sns.message.subject}".to_string(),
    );
    TriggerDescriptor {
        id: "TRIGGER_1".into(),
        project_id: "Proj".into(),
        build_type_id: "Proj_Build".into(),
        trigger_uuid: "5c1b0f7e-8a4e-4a8b-9d39-1d3f0e6c2b11".into(),
        display_name: Some("SNS deploy".into()),
        branch: None,
        parameters,
    }
}

pub fn entry() -> TriggerEntry {
    TriggerEntry::new(descriptor(), true)
}

pub fn record(id: &str, subject: &str, timestamp: &str) -> NotificationRecord {
    NotificationRecord {
        message_id: id.into(),
        subscription_arn: Some(SUBSCRIPTION_ARN.into()),
        topic: Some(TOPIC_ARN.into()),
        subject: Some(subject.into()),
        message: Some(format!("body of {id}")),
        timestamp: DateTime::parse_from_rfc3339(timestamp)
            .expect("timestamp")
            .with_timezone(&Utc),
        unsubscribe_url: Some("https://sns.us-east-1.amazonaws.com/?Action=Unsubscribe".into()),
        attributes: BTreeMap::new(),
    }
}
