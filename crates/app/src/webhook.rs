use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use serde_json::Value;
use sns_trigger_aws::{confirm_subscription, SubscriptionError};
use sns_trigger_core::{
    message::{
        payload_str, FIELD_TOPIC_ARN, HEADER_MESSAGE_ID, HEADER_SUBSCRIPTION_ARN,
        HEADER_TOPIC_ARN,
    },
    notification_record, EnvelopeError, EnvelopeHeaders, MessageType, Payload,
};
use sns_trigger_storage::{StorageError, TriggerDataError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::problem::ProblemResponse;
use crate::registry::LookupError;
use crate::router::AppState;

/// Mount point of the webhook; the three path segments follow it.
pub const WEBHOOK_PREFIX: &str = "/app/trigger/sns";

const LABEL_UNKNOWN: &str = "unknown";
const LABEL_IGNORED: &str = "ignored";

/// Reasons a webhook request is answered with 400.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid or Unsupported URL is given: {0}")]
    InvalidPath(String),
    #[error("No ProjectId given in the path")]
    MissingProjectId,
    #[error("No BuildTypeId given in the path")]
    MissingBuildTypeId,
    #[error("No Trigger UUID given in the path")]
    MissingTriggerUuid,
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("request body must be a JSON object: {0}")]
    InvalidJson(String),
    #[error("invalid notification: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Data(#[from] TriggerDataError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EndpointError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath(_)
            | Self::MissingProjectId
            | Self::MissingBuildTypeId
            | Self::MissingTriggerUuid
            | Self::Lookup(_) => "error_snsEndpointResolve",
            Self::InvalidJson(_) => "invalid_json",
            Self::Envelope(_) => "invalid_notification",
            Self::Subscription(_) => "subscription_failed",
            Self::Data(TriggerDataError::NotSubscribed { .. }) => "not_subscribed",
            Self::Data(_) | Self::Storage(_) => "storage_error",
        }
    }
}

impl From<EndpointError> for ProblemResponse {
    fn from(value: EndpointError) -> Self {
        ProblemResponse::new(StatusCode::BAD_REQUEST, value.code(), value.to_string())
    }
}

pub async fn handle(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let mut label = LABEL_UNKNOWN;
    let result = process(&state, &method, &path, &headers, &body, &mut label).await;
    histogram!("webhook_ack_latency_seconds", "type" => label)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => Ok(StatusCode::OK.into_response()),
        Err(err) => {
            warn!(
                stage = "ingress",
                %path,
                message_type = label,
                code = err.code(),
                error = %err,
                "webhook request rejected"
            );
            Err(err.into())
        }
    }
}

async fn process(
    state: &AppState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    label: &mut &'static str,
) -> Result<(), EndpointError> {
    let (project_id, build_type_id, trigger_uuid) = parse_path(path)?;
    let entry = state
        .registry()
        .resolve(project_id, build_type_id, trigger_uuid)?;
    let descriptor = entry.descriptor();

    if *method != Method::POST {
        *label = LABEL_IGNORED;
        debug!(stage = "ingress", %method, trigger = %descriptor.name(), "non-POST request ignored");
        return Ok(());
    }

    let payload = parse_payload(body)?;
    let message_type = MessageType::of(&payload);
    *label = message_type.as_str();
    counter!("sns_ingress_total", "type" => *label).increment(1);

    if !state.verifier().verify(&payload).await {
        counter!("sns_invalid_signature_total", "type" => *label).increment(1);
        return Ok(());
    }

    let envelope = envelope_headers(headers);
    match message_type {
        MessageType::Subscribe => {
            let subscription_arn = confirm_subscription(state.http().as_ref(), &payload).await?;
            let topic_arn = envelope
                .topic_arn
                .as_deref()
                .or_else(|| payload_str(&payload, FIELD_TOPIC_ARN));
            let mut trigger_state = state.service().open_state(descriptor).await?;
            trigger_state
                .confirm_subscription(&subscription_arn, topic_arn)
                .await?;
        }
        MessageType::Unsubscribe => {
            let mut trigger_state = state.service().open_state(descriptor).await?;
            trigger_state.clear_subscription().await?;
        }
        MessageType::Notification => {
            let record = notification_record(&envelope, &payload)?;
            let message_id = record.message_id.clone();
            let mut trigger_state = state.service().open_state(descriptor).await?;
            if let Err(err) = trigger_state.register_notification(record).await {
                if matches!(err, TriggerDataError::NotSubscribed { .. }) {
                    counter!("sns_rejected_total", "reason" => "not_subscribed").increment(1);
                }
                return Err(err.into());
            }
            info!(
                stage = "ingress",
                trigger = %descriptor.name(),
                %message_id,
                "notification registered"
            );
        }
        MessageType::Undefined => {}
    }
    Ok(())
}

fn parse_path(path: &str) -> Result<(&str, &str, &str), EndpointError> {
    let segments: Vec<&str> = path.split('/').collect();
    let [project_id, build_type_id, trigger_uuid] = segments.as_slice() else {
        return Err(EndpointError::InvalidPath(format!("{WEBHOOK_PREFIX}/{path}")));
    };

    let project_id = project_id.trim();
    if project_id.is_empty() {
        return Err(EndpointError::MissingProjectId);
    }
    let build_type_id = build_type_id.trim();
    if build_type_id.is_empty() {
        return Err(EndpointError::MissingBuildTypeId);
    }
    let trigger_uuid = trigger_uuid.trim();
    if trigger_uuid.is_empty() {
        return Err(EndpointError::MissingTriggerUuid);
    }
    Ok((project_id, build_type_id, trigger_uuid))
}

fn parse_payload(body: &[u8]) -> Result<Payload, EndpointError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(payload)) => Ok(payload),
        Ok(_) => Err(EndpointError::InvalidJson("expected an object".into())),
        Err(err) => Err(EndpointError::InvalidJson(err.to_string())),
    }
}

fn envelope_headers(headers: &HeaderMap) -> EnvelopeHeaders {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    EnvelopeHeaders {
        subscription_arn: header(HEADER_SUBSCRIPTION_ARN),
        message_id: header(HEADER_MESSAGE_ID),
        topic_arn: header(HEADER_TOPIC_ARN),
    }
}
