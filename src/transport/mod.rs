//! The `transport` module is the seam between the bridge and the XMPP
//! connection to the relay.
//!
//! The bridge only ever talks to the `Transport` trait. Two implementations
//! live here:
//! - `xmpp`: an XMPP client stream over TCP with direct TLS, which is how
//!   the relay accepts connections (ports 5235 and 5236)
//! - `mock`: an in-memory transport used by tests and local runs
//!
//! Callbacks registered on a transport are invoked on the transport's own
//! tasks and must not block.

pub mod framing;
pub mod mock;
pub mod reconnect;
pub mod stanza;
pub mod xmpp;

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::error;

use crate::utils::error::TransportError;

pub use mock::MockTransport;
pub use reconnect::ReconnectionPolicy;
pub use stanza::Stanza;
pub use xmpp::XmppTransport;

/// Called for every inbound `<message>` stanza.
pub type StanzaListener = Arc<dyn Fn(Stanza) + Send + Sync>;
/// Called for every connection lifecycle event.
pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
/// Called for every outbound stanza just before it is written.
pub type StanzaInterceptor = Arc<dyn Fn(&Stanza) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Authenticated { resumed: bool },
    ReconnectingIn(Duration),
    ReconnectionSuccessful,
    ReconnectionFailed(String),
    ClosedOnError(String),
    /// A replacement session took over after the relay asked to drain the
    /// old one.
    SessionReplaced,
    Closed,
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub domain: String,
    /// TLS directly on the socket, no STARTTLS.
    pub secure: bool,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    /// `host:port`, for logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// What the connection manager needs from an XMPP connection.
pub trait Transport: Send + Sync + 'static {
    /// Opens the underlying connection.
    fn connect(
        &self,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Authenticates on an open connection and starts delivering stanzas.
    fn login(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_stanza(&self, stanza: Stanza)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn add_incoming_message_listener(&self, listener: StanzaListener);

    fn add_connection_listener(&self, listener: ConnectionListener);

    fn add_outgoing_interceptor(&self, interceptor: StanzaInterceptor);

    fn enable_automatic_reconnection(&self, policy: ReconnectionPolicy);

    /// Opens and logs in a second session next to the current one, then
    /// makes it current and emits `ConnectionEvent::SessionReplaced`. The
    /// old session keeps delivering inbound stanzas until the relay closes
    /// it.
    fn replace_session(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Callback registry shared by the transport implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    incoming: RwLock<Vec<StanzaListener>>,
    connection: RwLock<Vec<ConnectionListener>>,
    outgoing: RwLock<Vec<StanzaInterceptor>>,
}

impl Listeners {
    pub(crate) fn add_incoming(&self, listener: StanzaListener) {
        write(&self.incoming).push(listener);
    }

    pub(crate) fn add_connection(&self, listener: ConnectionListener) {
        write(&self.connection).push(listener);
    }

    pub(crate) fn add_outgoing(&self, interceptor: StanzaInterceptor) {
        write(&self.outgoing).push(interceptor);
    }

    /// A panicking listener is logged and skipped; it never takes the
    /// reading task down with it.
    pub(crate) fn deliver(&self, stanza: Stanza) {
        for listener in snapshot(&self.incoming) {
            let call = AssertUnwindSafe(|| listener(stanza.clone()));
            if panic::catch_unwind(call).is_err() {
                error!("Stanza listener panicked on {}", stanza.xml());
            }
        }
    }

    pub(crate) fn notify(&self, event: &ConnectionEvent) {
        for listener in snapshot(&self.connection) {
            listener(event);
        }
    }

    pub(crate) fn intercept(&self, stanza: &Stanza) {
        for interceptor in snapshot(&self.outgoing) {
            interceptor(stanza);
        }
    }
}

// Callbacks run without the lock held so they may register further listeners.
fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn write<T>(lock: &RwLock<Vec<T>>) -> std::sync::RwLockWriteGuard<'_, Vec<T>> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
