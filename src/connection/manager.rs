use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::state::ConnectionState;
use crate::config::RelaySettings;
use crate::executor::SendExecutor;
use crate::transport::{
    ConnectionEvent, ReconnectionPolicy, Stanza, StanzaListener, Transport, TransportConfig,
};
use crate::utils::error::{ConnectError, ExecutorError, TransportError};

/// Called with `(previous, current)` after every state change.
pub type StateListener = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

/// Sender identity and server key used to log in to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub sender_id: String,
    pub server_key: String,
}

impl Credentials {
    pub fn new(sender_id: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            server_key: server_key.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.sender_id.trim().is_empty() && !self.server_key.trim().is_empty()
    }

    /// `<sender_id>@<endpoint>`
    pub fn username(&self, endpoint: &str) -> String {
        format!("{}@{endpoint}", self.sender_id)
    }
}

/// Owns the relay connection and its state.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    executor: Arc<SendExecutor>,
    policy: ReconnectionPolicy,
    reconnect_wait: Duration,
    state: watch::Sender<ConnectionState>,
    listeners: RwLock<Vec<StateListener>>,
    wired: AtomicBool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        executor: Arc<SendExecutor>,
        policy: ReconnectionPolicy,
        reconnect_wait: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            executor,
            policy,
            reconnect_wait,
            state: watch::Sender::new(ConnectionState::Disconnected),
            listeners: RwLock::new(Vec::new()),
            wired: AtomicBool::new(false),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn on_state_change(&self, listener: StateListener) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Waits until the state equals `target`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state == target).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Connects and logs in. Failures are returned as-is and never retried
    /// here; automatic reconnection only applies once a session was
    /// established.
    pub async fn connect(
        self: &Arc<Self>,
        credentials: &Credentials,
        relay: &RelaySettings,
        dispatcher: StanzaListener,
    ) -> Result<(), ConnectError> {
        match self.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Closed => return Err(ConnectError::Closed),
            _ => return Err(ConnectError::AlreadyOpen),
        }
        if !credentials.is_complete() {
            return Err(ConnectError::MissingCredentials);
        }

        if !self.wired.swap(true, Ordering::SeqCst) {
            self.wire_transport(dispatcher);
        }

        let config = transport_config(credentials, relay);
        info!(
            "Connecting to {} as {}",
            config.endpoint(),
            config.username
        );
        self.transition(ConnectionState::Connecting);

        if let Err(e) = self.transport.connect(&config).await {
            error!("Connection to relay failed: {e}");
            self.transition(ConnectionState::Disconnected);
            return Err(ConnectError::Connect(e));
        }
        self.advance_to(ConnectionState::Connected);

        if let Err(e) = self.transport.login().await {
            error!("Login to relay failed: {e}");
            if let Err(e) = self.transport.disconnect().await {
                warn!("Error while disconnecting after failed login: {e}");
            }
            self.transition(ConnectionState::Disconnected);
            return Err(ConnectError::Login(e));
        }
        self.advance_to(ConnectionState::Authenticated);
        Ok(())
    }

    /// Writes one JSON payload to the relay.
    ///
    /// While the connection is being re-established (or draining) this waits
    /// up to the configured reconnect wait for an authenticated session.
    pub async fn send(&self, json: &str) -> Result<(), TransportError> {
        self.await_authenticated().await?;
        self.transport.send_stanza(Stanza::wrap_json(json)).await
    }

    /// Hands the write to the send executor and returns immediately. Write
    /// failures are logged.
    pub fn send_async(self: &Arc<Self>, json: String) -> Result<(), ExecutorError> {
        let manager = self.clone();
        self.executor.submit(async move {
            if let Err(e) = manager.send(&json).await {
                error!("Failed to send {json}: {e}");
            }
        })
    }

    /// Writes an ack for an upstream message.
    ///
    /// Unlike `send`, this also writes while `Draining`: the relay keeps
    /// delivering upstream messages on the draining connection and redelivers
    /// any it does not see acked.
    pub async fn send_ack(&self, json: &str) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Draining {
            self.await_authenticated().await?;
        }
        self.transport.send_stanza(Stanza::wrap_json(json)).await
    }

    /// `send_ack` on the send executor.
    pub fn send_ack_async(self: &Arc<Self>, json: String) -> Result<(), ExecutorError> {
        let manager = self.clone();
        self.executor.submit(async move {
            if let Err(e) = manager.send_ack(&json).await {
                error!("Failed to send ack {json}: {e}");
            }
        })
    }

    /// The relay asked us to move to a new connection. In-flight requests
    /// stay tracked and acks still go out on the draining connection. A
    /// replacement session is opened right away; new sends wait for it.
    pub fn enter_draining(self: &Arc<Self>) {
        if !self.transition(ConnectionState::Draining) {
            return;
        }
        warn!("Relay is draining this connection; opening a replacement session");

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.transport.replace_session().await {
                warn!("Could not open a replacement session: {e}");
            }
        });
    }

    pub async fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.transition(ConnectionState::Closed);
        if let Err(e) = self.transport.disconnect().await {
            warn!("Error while disconnecting: {e}");
        }
    }

    async fn await_authenticated(&self) -> Result<(), TransportError> {
        let state = self.state();
        if state == ConnectionState::Authenticated {
            return Ok(());
        }
        if !state.is_transitional() {
            debug!("Refusing to send while {state}");
            return Err(TransportError::NotConnected);
        }

        debug!("Send waiting for an authenticated connection (currently {state})");
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(self.reconnect_wait, async {
            rx.wait_for(|s| !s.is_transitional())
                .await
                .map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(ConnectionState::Authenticated)) => Ok(()),
            Ok(Ok(_)) | Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Timeout("an authenticated connection")),
        }
    }

    fn wire_transport(self: &Arc<Self>, dispatcher: StanzaListener) {
        self.transport.add_incoming_message_listener(dispatcher);

        let weak: Weak<Self> = Arc::downgrade(self);
        self.transport
            .add_connection_listener(Arc::new(move |event: &ConnectionEvent| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_connection_event(event);
                }
            }));

        self.transport
            .add_outgoing_interceptor(Arc::new(|stanza: &Stanza| {
                info!("Sent: {}", stanza.xml());
            }));

        self.transport.enable_automatic_reconnection(self.policy);
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                info!("Connection established");
                self.advance_to(ConnectionState::Connected);
            }
            ConnectionEvent::Authenticated { resumed } => {
                info!("Authenticated (resumed: {resumed})");
                self.advance_to(ConnectionState::Authenticated);
            }
            ConnectionEvent::ReconnectingIn(delay) => {
                info!("Reconnecting in {}s", delay.as_secs());
                self.transition(ConnectionState::Reconnecting);
            }
            ConnectionEvent::ReconnectionSuccessful => {
                info!("Reconnection successful");
                self.advance_to(ConnectionState::Authenticated);
            }
            ConnectionEvent::ReconnectionFailed(reason) => {
                warn!("Reconnection failed: {reason}");
            }
            ConnectionEvent::ClosedOnError(reason) => {
                warn!("Connection closed on error: {reason}");
                self.transition(ConnectionState::Reconnecting);
            }
            ConnectionEvent::SessionReplaced => {
                info!("Replacement session is ready");
                self.advance_to(ConnectionState::Authenticated);
            }
            ConnectionEvent::Closed => {
                info!("Connection closed");
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    /// Walks forward through the intermediate states up to `target`.
    fn advance_to(&self, target: ConnectionState) {
        let path: &[ConnectionState] = match target {
            ConnectionState::Connected => &[ConnectionState::Connecting, ConnectionState::Connected],
            ConnectionState::Authenticated => &[
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Authenticated,
            ],
            _ => &[],
        };
        for step in path {
            let current = self.state();
            if current == target {
                return;
            }
            if current.can_transition_to(*step) {
                self.transition(*step);
            }
        }
        if self.state() != target {
            self.transition(target);
        }
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            previous = *current;
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            *current = next;
            true
        });

        if changed {
            info!("Connection state {previous} -> {next}");
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for listener in listeners {
                listener(previous, next);
            }
        } else if previous != next {
            debug!("Ignoring connection state change {previous} -> {next}");
        }
        changed
    }
}

pub(crate) fn transport_config(credentials: &Credentials, relay: &RelaySettings) -> TransportConfig {
    TransportConfig {
        host: relay.host.clone(),
        port: relay.port(),
        domain: relay.domain.clone(),
        secure: relay.secure,
        username: credentials.username(&relay.endpoint),
        password: credentials.server_key.clone(),
        connect_timeout: Duration::from_millis(relay.connect_timeout_ms),
    }
}
