use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{MessageAttribute, NotificationRecord};

pub const FIELD_TYPE: &str = "Type";
pub const FIELD_MESSAGE_ID: &str = "MessageId";
pub const FIELD_TIMESTAMP: &str = "Timestamp";
pub const FIELD_SIGNING_CERT_URL: &str = "SigningCertURL";
pub const FIELD_SIGNATURE: &str = "Signature";
pub const FIELD_SIGNATURE_VERSION: &str = "SignatureVersion";
pub const FIELD_SUBSCRIBE_URL: &str = "SubscribeURL";
pub const FIELD_TOKEN: &str = "Token";
pub const FIELD_TOPIC_ARN: &str = "TopicArn";
pub const FIELD_MESSAGE: &str = "Message";
pub const FIELD_SUBJECT: &str = "Subject";
pub const FIELD_MESSAGE_ATTRIBUTES: &str = "MessageAttributes";
pub const FIELD_UNSUBSCRIBE_URL: &str = "UnsubscribeURL";

pub const HEADER_SUBSCRIPTION_ARN: &str = "x-amz-sns-subscription-arn";
pub const HEADER_MESSAGE_ID: &str = "x-amz-sns-message-id";
pub const HEADER_TOPIC_ARN: &str = "x-amz-sns-topic-arn";

/// Decoded JSON body of an SNS HTTP delivery.
pub type Payload = Map<String, Value>;

/// Kind of SNS delivery, taken from the payload `Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
    Notification,
    Undefined,
}

impl MessageType {
    pub fn classify(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("SubscriptionConfirmation") => Self::Subscribe,
            Some("UnsubscribeConfirmation") => Self::Unsubscribe,
            Some("Notification") => Self::Notification,
            _ => Self::Undefined,
        }
    }

    pub fn of(payload: &Payload) -> Self {
        Self::classify(payload_str(payload, FIELD_TYPE))
    }

    /// Label used for metrics and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Notification => "notification",
            Self::Undefined => "undefined",
        }
    }

    /// Payload fields covered by the signature, in signing order.
    pub fn signed_fields(self) -> &'static [&'static str] {
        match self {
            Self::Notification => &[
                FIELD_MESSAGE,
                FIELD_MESSAGE_ID,
                FIELD_SUBJECT,
                FIELD_TIMESTAMP,
                FIELD_TOPIC_ARN,
                FIELD_TYPE,
            ],
            Self::Subscribe | Self::Unsubscribe => &[
                FIELD_MESSAGE,
                FIELD_MESSAGE_ID,
                FIELD_SUBSCRIBE_URL,
                FIELD_TIMESTAMP,
                FIELD_TOKEN,
                FIELD_TOPIC_ARN,
                FIELD_TYPE,
            ],
            Self::Undefined => &[],
        }
    }
}

/// SNS delivery headers relevant to trigger processing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeHeaders {
    pub subscription_arn: Option<String>,
    pub message_id: Option<String>,
    pub topic_arn: Option<String>,
}

/// Errors raised while turning a notification payload into a [`NotificationRecord`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("invalid message attributes: {0}")]
    InvalidAttributes(#[from] serde_json::Error),
}

/// Returns the string value of `field`, treating blank strings as absent.
pub fn payload_str<'a>(payload: &'a Payload, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
}

/// Builds the pending record for a verified notification.
pub fn notification_record(
    headers: &EnvelopeHeaders,
    payload: &Payload,
) -> Result<NotificationRecord, EnvelopeError> {
    let message_id = non_blank(headers.message_id.as_deref())
        .or_else(|| payload_str(payload, FIELD_MESSAGE_ID))
        .ok_or(EnvelopeError::MissingField(FIELD_MESSAGE_ID))?
        .to_string();

    let topic = non_blank(headers.topic_arn.as_deref())
        .or_else(|| payload_str(payload, FIELD_TOPIC_ARN))
        .map(str::to_string);

    let raw_timestamp =
        payload_str(payload, FIELD_TIMESTAMP).ok_or(EnvelopeError::MissingField(FIELD_TIMESTAMP))?;
    let timestamp = DateTime::parse_from_rfc3339(raw_timestamp)
        .map_err(|source| EnvelopeError::InvalidTimestamp {
            value: raw_timestamp.to_string(),
            source,
        })?
        .with_timezone(&Utc);

    let attributes = match payload.get(FIELD_MESSAGE_ATTRIBUTES) {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(value) => serde_json::from_value::<BTreeMap<String, MessageAttribute>>(value.clone())?,
    };

    Ok(NotificationRecord {
        message_id,
        subscription_arn: non_blank(headers.subscription_arn.as_deref()).map(str::to_string),
        topic,
        subject: payload_text(payload, FIELD_SUBJECT),
        message: payload_text(payload, FIELD_MESSAGE),
        timestamp,
        unsubscribe_url: payload_str(payload, FIELD_UNSUBSCRIBE_URL).map(str::to_string),
        attributes,
    })
}

// Subject and body keep their exact text, including blank strings.
fn payload_text(payload: &Payload, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(str::to_string)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Payload {
        json!({
            "Type": "Notification",
            "MessageId": "22b80b92-fdea-4c2c-8f9d-bdfb0c7bf324",
            "TopicArn": "arn:aws:sns:us-west-2:123456789012:MyTopic",
            "Subject": "Deploy",
            "Message": "Hello world!",
            "Timestamp": "2012-05-02T00:54:06.655Z",
            "SignatureVersion": "1",
            "Signature": "EXAMPLE",
            "SigningCertURL": "https://sns.us-west-2.amazonaws.com/cert.pem",
            "UnsubscribeURL": "https://sns.us-west-2.amazonaws.com/?Action=Unsubscribe",
            "MessageAttributes": {
                "bar": {"Type": "Number", "Value": "3.14"},
                "foo.bar": {"Type": "Binary", "Value": "YmluYXJ5"}
            }
        })
        .as_object()
        .cloned()
        .expect("object")
    }

    fn sample_headers() -> EnvelopeHeaders {
        EnvelopeHeaders {
            subscription_arn: Some("arn:aws:sns:us-west-2:123456789012:MyTopic:sub-1".into()),
            message_id: Some("header-id".into()),
            topic_arn: Some("arn:aws:sns:us-west-2:123456789012:HeaderTopic".into()),
        }
    }

    #[test]
    fn classifies_known_and_unknown_types() {
        assert_eq!(
            MessageType::classify(Some("SubscriptionConfirmation")),
            MessageType::Subscribe
        );
        assert_eq!(
            MessageType::classify(Some(" UnsubscribeConfirmation ")),
            MessageType::Unsubscribe
        );
        assert_eq!(
            MessageType::classify(Some("Notification")),
            MessageType::Notification
        );
        assert_eq!(MessageType::classify(Some("notification")), MessageType::Undefined);
        assert_eq!(MessageType::classify(Some("   ")), MessageType::Undefined);
        assert_eq!(MessageType::classify(None), MessageType::Undefined);
        assert!(MessageType::Undefined.signed_fields().is_empty());
    }

    #[test]
    fn record_prefers_headers_over_payload() {
        let record = notification_record(&sample_headers(), &sample_payload()).expect("record");

        assert_eq!(record.message_id, "header-id");
        assert_eq!(
            record.topic.as_deref(),
            Some("arn:aws:sns:us-west-2:123456789012:HeaderTopic")
        );
        assert_eq!(
            record.subscription_arn.as_deref(),
            Some("arn:aws:sns:us-west-2:123456789012:MyTopic:sub-1")
        );
        assert_eq!(record.subject.as_deref(), Some("Deploy"));
        assert_eq!(record.message.as_deref(), Some("Hello world!"));
        assert_eq!(record.timestamp.to_rfc3339(), "2012-05-02T00:54:06.655+00:00");
        assert_eq!(record.attribute_value("bar"), Some("3.14"));
        assert_eq!(record.attribute_value("foo.bar"), Some("YmluYXJ5"));
        assert!(record.unsubscribe_url.is_some());
    }

    #[test]
    fn record_falls_back_to_payload_identifiers() {
        let record =
            notification_record(&EnvelopeHeaders::default(), &sample_payload()).expect("record");

        assert_eq!(record.message_id, "22b80b92-fdea-4c2c-8f9d-bdfb0c7bf324");
        assert_eq!(
            record.topic.as_deref(),
            Some("arn:aws:sns:us-west-2:123456789012:MyTopic")
        );
        assert!(record.subscription_arn.is_none());
    }

    #[test]
    fn record_rejects_bad_timestamp_and_missing_id() {
        let mut payload = sample_payload();
        payload.insert(FIELD_TIMESTAMP.into(), json!("yesterday"));
        let err = notification_record(&sample_headers(), &payload).expect_err("timestamp");
        assert!(matches!(err, EnvelopeError::InvalidTimestamp { .. }));

        let mut payload = sample_payload();
        payload.remove(FIELD_MESSAGE_ID);
        let err = notification_record(&EnvelopeHeaders::default(), &payload).expect_err("id");
        assert!(matches!(err, EnvelopeError::MissingField(FIELD_MESSAGE_ID)));
    }

    #[test]
    fn record_without_subject_or_attributes() {
        let mut payload = sample_payload();
        payload.insert(FIELD_SUBJECT.into(), Value::Null);
        payload.remove(FIELD_MESSAGE_ATTRIBUTES);

        let record = notification_record(&sample_headers(), &payload).expect("record");
        assert!(record.subject.is_none());
        assert!(record.attributes.is_empty());
    }
}
