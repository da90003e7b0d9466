use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trigger storage key holding the expected subscription ARN.
pub const STORE_SUBSCRIPTION_ARN: &str = "subscriptionArn";
/// Trigger storage key holding the topic ARN of the confirmed subscription.
pub const STORE_TOPIC_ARN: &str = "topicArn";
/// Trigger storage key holding the unsubscribe URL of the latest notification.
pub const STORE_UNSUBSCRIBE_URL: &str = "unsubscribeURL";
/// Trigger storage key holding the serialized pending messages map.
pub const STORE_MESSAGES: &str = "messages";

/// A single SNS notification accepted for a trigger and waiting for the next poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub message_id: String,
    #[serde(default)]
    pub subscription_arn: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub unsubscribe_url: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, MessageAttribute>,
}

impl NotificationRecord {
    /// Returns the string value of the attribute named exactly `name`.
    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|attribute| attribute.value.as_deref())
    }
}

/// SNS message attribute as delivered in the `MessageAttributes` envelope block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

/// Subscription wiring persisted for one trigger instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    pub topic_arn: Option<String>,
    pub subscription_arn: Option<String>,
    pub unsubscribe_url: Option<String>,
}

impl SubscriptionState {
    /// Returns `true` when notifications carrying `arn` belong to the active subscription.
    pub fn accepts(&self, arn: Option<&str>) -> bool {
        match (self.subscription_arn.as_deref(), arn) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// A configured SNS trigger attached to a build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    /// Identifier of the trigger inside its build configuration.
    pub id: String,
    pub project_id: String,
    pub build_type_id: String,
    /// Random identifier that appears in the webhook URL.
    pub trigger_uuid: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Build parameter templates that may reference `sns.message.*` placeholders.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl TriggerDescriptor {
    /// Name used in log lines and error messages.
    pub fn name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.trigger_uuid)
    }

    /// Storage scope for the live trigger state.
    pub fn storage_scope(&self) -> String {
        format!("{}:{}", self.build_type_id, self.id)
    }

    /// Storage scope that keeps subscription data while the trigger is inactive.
    pub fn inactive_storage_scope(&self) -> String {
        format!("{}:{}_sub", self.build_type_id, self.id)
    }

    /// Triggered-by metadata attached to queued builds.
    pub fn triggered_by(&self) -> String {
        format!(
            "##type='sns' triggerId='{}' queueMergingEnabled='false'",
            self.id
        )
    }
}
