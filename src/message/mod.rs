//! The `message` module holds everything that travels inside a stanza's
//! JSON payload.
//!
//! - `outbound`: downstream messages (data and notification variants), their
//!   builders and the wire encoding.
//! - `notification`: the notification descriptor merged into one flat map.
//! - `id`: message identifier generation.
//! - `inbound`: the three categories the relay sends back and the classifier
//!   that tells them apart.
//! - `source`: a read-only, lazily cached view of a received stanza's payload.

pub mod id;
pub mod inbound;
pub mod notification;
pub mod outbound;
pub mod source;

pub use id::{MessageIdGenerator, UuidGenerator};
pub use inbound::{
    Acknowledgement, Category, CcsMessageType, DeliveryReceiptOrControlMessage,
    DownstreamMessageResponse, InboundMessage, ResponseType, UpstreamMessage, classify, parse,
};
pub use notification::NotificationPayload;
pub use outbound::{MAX_TIME_TO_LIVE, MessageBuilder, MessageKind, OutboundMessage, Priority};
pub use source::MessageSource;
