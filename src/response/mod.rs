//! Relay response taxonomy
//!
//! Maps the `message_type`/`error` pair of a `DownstreamMessageResponse`
//! onto a `ResponseClass`, and each class onto what the bridge does with
//! the pending request it answers:
//!
//! | class           | codes                                                   | reaction           |
//! |-----------------|---------------------------------------------------------|--------------------|
//! | `Ack`           | `message_type = ack`                                    | complete           |
//! | `Unrecoverable` | INVALID_JSON, BAD_REGISTRATION, DEVICE_UNREGISTERED, BAD_ACK, unknown codes | complete |
//! | `RateLimited`   | DEVICE_MESSAGE_RATE_EXCEEDED, TOPICS_MESSAGE_RATE_EXCEEDED | complete        |
//! | `Transient`     | SERVICE_UNAVAILABLE, INTERNAL_SERVER_ERROR              | complete           |
//! | `Draining`      | CONNECTION_DRAINING                                     | drain and complete |
//! | `Missing`       | nack without an error code                              | leave pending      |
//!
//! Only `Transient` and `Draining` failures are worth resending, always with
//! a new message id.

use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::message::DownstreamMessageResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidJson,
    BadRegistration,
    DeviceUnregistered,
    BadAck,
    ServiceUnavailable,
    InternalServerError,
    DeviceMessageRateExceeded,
    TopicsMessageRateExceeded,
    ConnectionDraining,
    Other(String),
}

impl ErrorCode {
    pub fn from_wire(code: &str) -> Self {
        match code {
            "INVALID_JSON" => ErrorCode::InvalidJson,
            "BAD_REGISTRATION" => ErrorCode::BadRegistration,
            "DEVICE_UNREGISTERED" => ErrorCode::DeviceUnregistered,
            "BAD_ACK" => ErrorCode::BadAck,
            "SERVICE_UNAVAILABLE" => ErrorCode::ServiceUnavailable,
            "INTERNAL_SERVER_ERROR" => ErrorCode::InternalServerError,
            "DEVICE_MESSAGE_RATE_EXCEEDED" => ErrorCode::DeviceMessageRateExceeded,
            "TOPICS_MESSAGE_RATE_EXCEEDED" => ErrorCode::TopicsMessageRateExceeded,
            "CONNECTION_DRAINING" => ErrorCode::ConnectionDraining,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::BadRegistration => "BAD_REGISTRATION",
            ErrorCode::DeviceUnregistered => "DEVICE_UNREGISTERED",
            ErrorCode::BadAck => "BAD_ACK",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::DeviceMessageRateExceeded => "DEVICE_MESSAGE_RATE_EXCEEDED",
            ErrorCode::TopicsMessageRateExceeded => "TOPICS_MESSAGE_RATE_EXCEEDED",
            ErrorCode::ConnectionDraining => "CONNECTION_DRAINING",
            ErrorCode::Other(code) => code,
        }
    }

    pub fn class(&self) -> ResponseClass {
        match self {
            ErrorCode::InvalidJson
            | ErrorCode::BadRegistration
            | ErrorCode::DeviceUnregistered
            | ErrorCode::BadAck => ResponseClass::Unrecoverable,
            ErrorCode::DeviceMessageRateExceeded | ErrorCode::TopicsMessageRateExceeded => {
                ResponseClass::RateLimited
            }
            ErrorCode::ServiceUnavailable | ErrorCode::InternalServerError => {
                ResponseClass::Transient
            }
            ErrorCode::ConnectionDraining => ResponseClass::Draining,
            ErrorCode::Other(_) => ResponseClass::Unrecoverable,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    Ack,
    Unrecoverable,
    RateLimited,
    Transient,
    Draining,
    /// A nack with no error code at all.
    Missing,
}

impl ResponseClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResponseClass::Transient | ResponseClass::Draining)
    }

    pub fn reaction(&self) -> Reaction {
        match self {
            ResponseClass::Draining => Reaction::DrainAndComplete,
            ResponseClass::Missing => Reaction::LeavePending,
            _ => Reaction::Complete,
        }
    }
}

impl fmt::Display for ResponseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseClass::Ack => "acknowledged",
            ResponseClass::Unrecoverable => "unrecoverable",
            ResponseClass::RateLimited => "rate limited",
            ResponseClass::Transient => "transient server error",
            ResponseClass::Draining => "connection draining",
            ResponseClass::Missing => "nack without error code",
        };
        f.write_str(name)
    }
}

/// What happens to the pending request a response answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Complete,
    /// Complete the request and move the connection to `Draining`.
    DrainAndComplete,
    /// Keep waiting; the request times out on its own.
    LeavePending,
}

/// Class of a response, without logging.
pub fn class_of(response: &DownstreamMessageResponse) -> ResponseClass {
    if response.is_ack() {
        return ResponseClass::Ack;
    }
    match response.error.as_deref() {
        None | Some("") => ResponseClass::Missing,
        Some(code) => ErrorCode::from_wire(code).class(),
    }
}

/// Class of a response as seen when it arrives. Nacks without a code and
/// unknown codes are logged.
pub fn classify(response: &DownstreamMessageResponse) -> ResponseClass {
    let class = class_of(response);
    match (class, response.error.as_deref()) {
        (ResponseClass::Missing, _) => warn!(
            "Nack for message {} carries no error code",
            response.message_id
        ),
        (ResponseClass::Unrecoverable, Some(code)) => {
            if let ErrorCode::Other(unknown) = ErrorCode::from_wire(code) {
                warn!(
                    "Unknown error code {unknown} for message {}, treating as unrecoverable",
                    response.message_id
                );
            }
        }
        _ => {}
    }
    class
}

/// Exponential backoff for resending retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// Total number of sends, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryBackoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.saturating_pow(exponent);
        self.initial
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests;
