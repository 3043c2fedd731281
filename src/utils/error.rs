//! The `error` module defines the error types used within `ccsbridge`.
//!
//! Each layer gets its own enum so callers only match on failures that can
//! actually reach them. Callers of the bridge see `SendError` and
//! `ConnectError`; transport internals stay behind those two.

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::message::{Category, DownstreamMessageResponse, MAX_TIME_TO_LIVE};
use crate::response::ResponseClass;

/// Failures raised by a `Transport` implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// `<stream:error>` sent by the relay before it closes the stream.
    #[error("relay stream error: {0}")]
    Stream(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport closed")]
    Closed,
}

/// Initial connect/login failures. These are never retried by the bridge.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("sender id and server key must both be configured")]
    MissingCredentials,

    #[error("connection is already open")]
    AlreadyOpen,

    #[error("connection was closed and cannot be reopened")]
    Closed,

    #[error("could not connect to the relay: {0}")]
    Connect(#[source] TransportError),

    #[error("could not log in to the relay: {0}")]
    Login(#[source] TransportError),
}

/// Problems extracting the JSON payload embedded in a stanza.
///
/// `Clone` so the cached extraction result can be handed out repeatedly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("stanza carries no `gcm` payload")]
    MissingPayload,

    #[error("stanza is not well-formed XML: {0}")]
    Xml(String),

    #[error("payload is not a JSON object: {0}")]
    Json(String),
}

/// Failures while classifying and routing one inbound stanza.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The `message_type` discriminator has a value the bridge does not know.
    #[error("unknown message_type `{0}`")]
    UnknownMessageType(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    /// A handler registered for this category panicked.
    #[error("{0} handler panicked")]
    HandlerPanicked(Category),

    /// A recognised category whose JSON does not match the typed model.
    #[error("malformed {category} message: {source}")]
    Malformed {
        category: Category,
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchError {
    /// Classification failures and handler panics are logged at error
    /// severity; everything else is a warning.
    pub fn is_classification_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownMessageType(_) | DispatchError::HandlerPanicked(_)
        )
    }
}

/// Problems building or encoding an outbound message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("a message needs a `to` recipient or a `condition`")]
    MissingTarget,

    #[error("time_to_live {0} exceeds the maximum of {max} seconds", max = MAX_TIME_TO_LIVE)]
    TimeToLiveOutOfRange(u32),

    #[error("cannot acknowledge a message without `{0}`")]
    MissingAckField(&'static str),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("a request with message id {0} is already pending")]
    DuplicateId(String),

    #[error("no response for message id {0} before the deadline")]
    TimedOut(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("send queue is full")]
    Saturated,

    #[error("send executor has shut down")]
    Shutdown,
}

/// What the caller of `CcsBridge::send_message` can observe.
#[derive(Debug, Error)]
pub enum SendError {
    /// The relay answered with a nack.
    #[error("relay rejected message {}: {class}", response.message_id)]
    Rejected {
        class: ResponseClass,
        response: DownstreamMessageResponse,
    },

    #[error("no response for message {0} before the deadline")]
    TimedOut(String),

    #[error("connection is not available (state: {0})")]
    NotConnected(ConnectionState),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Correlation(CorrelationError),
}

impl SendError {
    /// Whether resending (with a new message id) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Rejected { class, .. } => class.is_retryable(),
            SendError::TimedOut(_) => true,
            SendError::Executor(ExecutorError::Saturated) => true,
            _ => false,
        }
    }
}

impl From<CorrelationError> for SendError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::TimedOut(id) => SendError::TimedOut(id),
            other => SendError::Correlation(other),
        }
    }
}
