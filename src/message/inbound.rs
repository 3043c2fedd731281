//! Inbound message definitions and the classifier
//!
//! Everything the relay pushes to us falls into exactly one `Category`,
//! decided by the `message_type` field of the payload:
//!
//! | `message_type`        | category           | model                              |
//! |-----------------------|--------------------|------------------------------------|
//! | absent                | `Upstream`         | `UpstreamMessage`                  |
//! | `ack`, `nack`         | `DownstreamResponse` | `DownstreamMessageResponse`      |
//! | `receipt`, `control`  | `ReceiptOrControl` | `DeliveryReceiptOrControlMessage`  |
//!
//! Any other value is a classification failure, never a best guess.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::source::MessageSource;
use crate::utils::error::{DispatchError, MessageError};

pub const CONNECTION_DRAINING: &str = "CONNECTION_DRAINING";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Upstream,
    DownstreamResponse,
    ReceiptOrControl,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Upstream => "upstream",
            Category::DownstreamResponse => "downstream response",
            Category::ReceiptOrControl => "receipt/control",
        };
        f.write_str(name)
    }
}

/// A message originated by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub from: String,
    pub category: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl UpstreamMessage {
    /// The ack the relay expects for this message.
    pub fn acknowledgement(&self) -> Result<Acknowledgement, MessageError> {
        if self.from.is_empty() {
            return Err(MessageError::MissingAckField("from"));
        }
        if self.message_id.is_empty() {
            return Err(MessageError::MissingAckField("message_id"));
        }
        Ok(Acknowledgement {
            to: self.from.clone(),
            message_id: self.message_id.clone(),
            message_type: ResponseType::Ack,
        })
    }
}

/// Reply sent back to the relay for every upstream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub to: String,
    pub message_id: String,
    pub message_type: ResponseType,
}

impl Acknowledgement {
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Ack,
    Nack,
}

/// The relay's ack or nack for a message we sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamMessageResponse {
    pub from: String,
    pub message_id: String,
    pub message_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl DownstreamMessageResponse {
    pub fn ack(from: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            message_id: message_id.into(),
            message_type: ResponseType::Ack,
            registration_id: None,
            error: None,
            error_description: None,
        }
    }

    pub fn nack(
        from: impl Into<String>,
        message_id: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            message_type: ResponseType::Nack,
            error,
            ..Self::ack(from, message_id)
        }
    }

    pub fn is_ack(&self) -> bool {
        self.message_type == ResponseType::Ack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CcsMessageType {
    Receipt,
    Control,
}

/// A delivery receipt or a control notice from the relay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceiptOrControlMessage {
    pub message_type: CcsMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_type: Option<String>,
}

impl DeliveryReceiptOrControlMessage {
    pub fn is_receipt(&self) -> bool {
        self.message_type == CcsMessageType::Receipt
    }

    pub fn is_connection_draining(&self) -> bool {
        self.message_type == CcsMessageType::Control
            && self.control_type.as_deref() == Some(CONNECTION_DRAINING)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Upstream(UpstreamMessage),
    Response(DownstreamMessageResponse),
    ReceiptOrControl(DeliveryReceiptOrControlMessage),
}

impl InboundMessage {
    pub fn category(&self) -> Category {
        match self {
            InboundMessage::Upstream(_) => Category::Upstream,
            InboundMessage::Response(_) => Category::DownstreamResponse,
            InboundMessage::ReceiptOrControl(_) => Category::ReceiptOrControl,
        }
    }
}

/// Decides the category of a payload from its `message_type`.
pub fn classify(payload: &Map<String, Value>) -> Result<Category, DispatchError> {
    match payload.get("message_type") {
        None | Some(Value::Null) => Ok(Category::Upstream),
        Some(Value::String(kind)) => match kind.as_str() {
            "ack" | "nack" => Ok(Category::DownstreamResponse),
            "receipt" | "control" => Ok(Category::ReceiptOrControl),
            other => Err(DispatchError::UnknownMessageType(other.to_string())),
        },
        Some(other) => Err(DispatchError::UnknownMessageType(other.to_string())),
    }
}

/// Classifies the cached payload of `source` and deserializes it into the
/// matching model.
pub fn parse(source: &MessageSource) -> Result<InboundMessage, DispatchError> {
    let value = source.as_value()?;
    let category = match value.as_object() {
        Some(map) => classify(map)?,
        None => return Err(DispatchError::UnknownMessageType(value.to_string())),
    };

    let malformed = |source| DispatchError::Malformed { category, source };
    let message = match category {
        Category::Upstream => {
            InboundMessage::Upstream(UpstreamMessage::deserialize(value).map_err(malformed)?)
        }
        Category::DownstreamResponse => InboundMessage::Response(
            DownstreamMessageResponse::deserialize(value).map_err(malformed)?,
        ),
        Category::ReceiptOrControl => InboundMessage::ReceiptOrControl(
            DeliveryReceiptOrControlMessage::deserialize(value).map_err(malformed)?,
        ),
    };
    Ok(message)
}
