//! Domain types and pure logic for SNS-driven build triggers.

pub mod merge;
pub mod message;
pub mod parameters;
pub mod pending;
pub mod types;

pub use merge::{merge, StoredValues};
pub use message::{notification_record, EnvelopeError, EnvelopeHeaders, MessageType, Payload};
pub use pending::PendingMessages;
pub use types::{MessageAttribute, NotificationRecord, SubscriptionState, TriggerDescriptor};
