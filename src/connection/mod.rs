//! Connection management
//!
//! `ConnectionManager` owns the relay connection on top of a `Transport`:
//! - builds the transport configuration from the relay settings and
//!   credentials, then connects and logs in
//! - registers the inbound stanza listener, a state listener that maps
//!   transport events onto `ConnectionState`, an outgoing interceptor that
//!   logs every stanza, and the automatic reconnection policy
//! - exposes `send` (awaits the write) and `send_async` (hands it to the
//!   send executor), plus `send_ack`, which also writes while draining
//! - opens a replacement session as soon as the relay starts draining
//!
//! Initial connect/login failures are returned to the caller. Once a session
//! was established, dropped connections are recovered by the transport's
//! reconnection policy and only observed here as state changes.

mod manager;
mod state;

pub use manager::{ConnectionManager, Credentials, StateListener};
pub use state::ConnectionState;
