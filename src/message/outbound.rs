//! Downstream message definitions
//!
//! `OutboundMessage` is the wire representation of a message sent to a
//! device through the relay. It comes in two flavours:
//! - data messages, carrying a string-keyed `data` map
//! - notification messages, which are data messages plus a flat
//!   `notification` map (see `NotificationPayload`)
//!
//! Notes on fields:
//! - `to` / `condition`: the recipient token (or `/topics/..`) and a topic
//!   expression; at least one of them is required
//! - `message_id`: assigned once, by the builder or at the latest on the
//!   first `encode`, and never changed afterwards
//! - `time_to_live`: seconds, `0..=2_419_200`
//!
//! Absent fields are skipped on the wire, so the encoded JSON contains
//! exactly the keys that were set.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::id::{MessageIdGenerator, UuidGenerator};
use super::notification::NotificationPayload;
use crate::utils::error::MessageError;

/// Upper bound for `time_to_live` (four weeks).
pub const MAX_TIME_TO_LIVE: u32 = 2_419_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collapse_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_receipt_requested: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification: Option<Map<String, Value>>,
}

impl OutboundMessage {
    /// Starts a data message.
    pub fn data_builder() -> MessageBuilder {
        MessageBuilder::new(None)
    }

    /// Starts a notification message; it may still carry a `data` map.
    pub fn notification_builder(payload: NotificationPayload) -> MessageBuilder {
        MessageBuilder::new(Some(payload.to_map()))
    }

    pub fn kind(&self) -> MessageKind {
        if self.notification.is_some() {
            MessageKind::Notification
        } else {
            MessageKind::Data
        }
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn collapse_key(&self) -> Option<&str> {
        self.collapse_key.as_deref()
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Whether an iOS client should wake the app. `false` when unset.
    pub fn content_available(&self) -> bool {
        self.content_available.unwrap_or(false)
    }

    pub fn time_to_live(&self) -> Option<u32> {
        self.time_to_live
    }

    pub fn delivery_receipt_requested(&self) -> bool {
        self.delivery_receipt_requested.unwrap_or(false)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.unwrap_or(false)
    }

    pub fn data(&self) -> Option<&BTreeMap<String, String>> {
        self.data.as_ref()
    }

    pub fn notification(&self) -> Option<&Map<String, Value>> {
        self.notification.as_ref()
    }

    /// Redirects the message to another recipient.
    pub fn set_to(&mut self, to: impl Into<String>) {
        self.to = non_empty(to.into());
    }

    /// Assigns an identifier from `generator` if none is set yet and returns
    /// the (possibly pre-existing) identifier.
    pub fn ensure_message_id(&mut self, generator: &dyn MessageIdGenerator) -> &str {
        self.message_id.get_or_insert_with(|| generator.next_id())
    }

    /// Encodes the message as the JSON carried inside the stanza.
    ///
    /// Assigns an identifier on the first call if the message has none; after
    /// that the output is byte-for-byte stable.
    pub fn encode(&mut self) -> Result<String, MessageError> {
        self.ensure_message_id(&UuidGenerator);
        Ok(serde_json::to_string(self)?)
    }

    /// Indented encoding for logs. Does not assign an identifier.
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<unencodable: {e}>"))
    }

    /// Copy of this message without an identifier, so the copy gets its
    /// own on encode.
    pub fn with_fresh_id(&self) -> OutboundMessage {
        OutboundMessage {
            message_id: None,
            ..self.clone()
        }
    }

    /// Copy of this message addressed to `to`, with a fresh identifier.
    pub fn for_recipient(&self, to: impl Into<String>) -> OutboundMessage {
        let mut copy = self.with_fresh_id();
        copy.set_to(to);
        copy
    }
}

/// Builder shared by both message variants.
///
/// `build` validates the target and `time_to_live`, then assigns the message
/// identifier from the configured generator when none was given.
#[derive(Clone)]
pub struct MessageBuilder {
    message: OutboundMessage,
    generator: Arc<dyn MessageIdGenerator>,
}

impl MessageBuilder {
    fn new(notification: Option<Map<String, Value>>) -> Self {
        Self {
            message: OutboundMessage {
                to: None,
                condition: None,
                message_id: None,
                collapse_key: None,
                priority: None,
                content_available: None,
                time_to_live: None,
                delivery_receipt_requested: None,
                dry_run: None,
                data: None,
                notification,
            },
            generator: Arc::new(UuidGenerator),
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.message.to = non_empty(to.into());
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.message.condition = non_empty(condition.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message.message_id = non_empty(id.into());
        self
    }

    pub fn collapse_key(mut self, key: impl Into<String>) -> Self {
        self.message.collapse_key = non_empty(key.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.message.priority = Some(priority);
        self
    }

    pub fn content_available(mut self, flag: bool) -> Self {
        self.message.content_available = Some(flag);
        self
    }

    pub fn time_to_live(mut self, seconds: u32) -> Self {
        self.message.time_to_live = Some(seconds);
        self
    }

    pub fn delivery_receipt_requested(mut self, flag: bool) -> Self {
        self.message.delivery_receipt_requested = Some(flag);
        self
    }

    pub fn dry_run(mut self, flag: bool) -> Self {
        self.message.dry_run = Some(flag);
        self
    }

    /// Replaces the whole data payload.
    pub fn data(mut self, data: BTreeMap<String, String>) -> Self {
        self.message.data = Some(data);
        self
    }

    /// Adds one entry to the data payload.
    pub fn data_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn MessageIdGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn build(self) -> Result<OutboundMessage, MessageError> {
        let MessageBuilder {
            mut message,
            generator,
        } = self;

        if message.to.is_none() && message.condition.is_none() {
            return Err(MessageError::MissingTarget);
        }
        if let Some(ttl) = message.time_to_live {
            if ttl > MAX_TIME_TO_LIVE {
                return Err(MessageError::TimeToLiveOutOfRange(ttl));
            }
        }

        message.ensure_message_id(generator.as_ref());
        Ok(message)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
