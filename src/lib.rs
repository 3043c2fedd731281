//! # ccsbridge
//!
//! `ccsbridge` relays downstream messages to devices through Firebase Cloud
//! Messaging's connection server (CCS) and turns the relay's asynchronous
//! acks and nacks back into awaitable results.
//!
//! ## Core Modules
//!
//! - `bridge`: `CcsBridge`, the entry point that ties everything below together.
//! - `config`: settings loaded from `config/default` and `CCS_*` variables.
//! - `connection`: connection lifecycle and state machine over a transport.
//! - `correlation`: pending requests keyed by message id, with deadlines.
//! - `dispatch`: routes every inbound stanza to the handler for its category.
//! - `executor`: bounded worker pool that performs the network sends.
//! - `message`: outbound and inbound message models and their JSON encoding.
//! - `response`: nack error codes and what each one means for the sender.
//! - `transport`: the XMPP-over-TLS transport and a scriptable mock.
//! - `utils`: error types and logging setup.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod executor;
pub mod message;
pub mod response;
pub mod transport;
pub mod utils;

pub use bridge::CcsBridge;
