//! In-memory transport.
//!
//! Records every stanza written to it and lets the caller push inbound
//! stanzas and connection events as if they came from the relay. Each
//! failure switch makes the matching operation return an error until it is
//! cleared.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{
    ConnectionEvent, ConnectionListener, Listeners, ReconnectionPolicy, Stanza, StanzaInterceptor,
    StanzaListener, Transport, TransportConfig,
};
use crate::utils::error::TransportError;

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    listeners: Listeners,
    sent: Mutex<Vec<Stanza>>,
    sent_notify: Notify,
    config: Mutex<Option<TransportConfig>>,
    policy: Mutex<Option<ReconnectionPolicy>>,
    failures: Mutex<Failures>,
    connected: AtomicBool,
    connects: AtomicUsize,
    replacements: AtomicUsize,
}

#[derive(Default)]
struct Failures {
    connect: Option<String>,
    login: Option<String>,
    send: Option<String>,
    replace: Option<String>,
    disconnect: Option<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(&self, reason: Option<&str>) {
        lock(&self.inner.failures).connect = reason.map(String::from);
    }

    pub fn fail_login(&self, reason: Option<&str>) {
        lock(&self.inner.failures).login = reason.map(String::from);
    }

    pub fn fail_sends(&self, reason: Option<&str>) {
        lock(&self.inner.failures).send = reason.map(String::from);
    }

    pub fn fail_replacement(&self, reason: Option<&str>) {
        lock(&self.inner.failures).replace = reason.map(String::from);
    }

    /// Makes `disconnect` report an error. The mock still ends up
    /// disconnected.
    pub fn fail_disconnect(&self, reason: Option<&str>) {
        lock(&self.inner.failures).disconnect = reason.map(String::from);
    }

    /// Pushes a stanza to the incoming listeners.
    pub fn deliver(&self, stanza: Stanza) {
        self.inner.listeners.deliver(stanza);
    }

    /// Wraps `json` in a stanza and pushes it to the incoming listeners.
    pub fn deliver_json(&self, json: &str) {
        self.deliver(Stanza::wrap_json(json));
    }

    /// Pushes a connection event to the connection listeners.
    pub fn emit(&self, event: ConnectionEvent) {
        self.inner.listeners.notify(&event);
    }

    pub fn sent(&self) -> Vec<Stanza> {
        lock(&self.inner.sent).clone()
    }

    /// JSON payloads of the sent stanzas, in order.
    pub fn sent_json(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|stanza| stanza.extract_json().ok())
            .collect()
    }

    pub fn clear_sent(&self) {
        lock(&self.inner.sent).clear();
    }

    /// Waits until at least `count` stanzas were sent or `timeout` elapsed,
    /// and returns the JSON payloads sent so far.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.sent_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let sent = self.sent_json();
            if sent.len() >= count {
                return sent;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.sent_json();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// How many times a replacement session was requested.
    pub fn replacement_count(&self) -> usize {
        self.inner.replacements.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<TransportConfig> {
        lock(&self.inner.config).clone()
    }

    pub fn reconnection_policy(&self) -> Option<ReconnectionPolicy> {
        *lock(&self.inner.policy)
    }
}

impl Transport for MockTransport {
    async fn connect(&self, config: &TransportConfig) -> Result<(), TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.config) = Some(config.clone());

        if let Some(reason) = lock(&self.inner.failures).connect.clone() {
            return Err(TransportError::Connect {
                endpoint: config.endpoint(),
                reason,
            });
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.listeners.notify(&ConnectionEvent::Connected);
        Ok(())
    }

    async fn login(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(reason) = lock(&self.inner.failures).login.clone() {
            return Err(TransportError::Authentication(reason));
        }
        self.inner
            .listeners
            .notify(&ConnectionEvent::Authenticated { resumed: false });
        Ok(())
    }

    async fn send_stanza(&self, stanza: Stanza) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(reason) = lock(&self.inner.failures).send.clone() {
            return Err(TransportError::Send(reason));
        }

        self.inner.listeners.intercept(&stanza);
        lock(&self.inner.sent).push(stanza);
        self.inner.sent_notify.notify_waiters();
        Ok(())
    }

    fn add_incoming_message_listener(&self, listener: StanzaListener) {
        self.inner.listeners.add_incoming(listener);
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.inner.listeners.add_connection(listener);
    }

    fn add_outgoing_interceptor(&self, interceptor: StanzaInterceptor) {
        self.inner.listeners.add_outgoing(interceptor);
    }

    fn enable_automatic_reconnection(&self, policy: ReconnectionPolicy) {
        *lock(&self.inner.policy) = Some(policy);
    }

    async fn replace_session(&self) -> Result<(), TransportError> {
        self.inner.replacements.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(reason) = lock(&self.inner.failures).replace.clone() {
            let endpoint = lock(&self.inner.config)
                .as_ref()
                .map(TransportConfig::endpoint)
                .unwrap_or_default();
            return Err(TransportError::Connect { endpoint, reason });
        }
        self.inner
            .listeners
            .notify(&ConnectionEvent::SessionReplaced);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            debug!("mock transport disconnected");
            self.inner.listeners.notify(&ConnectionEvent::Closed);
        }
        match lock(&self.inner.failures).disconnect.clone() {
            Some(reason) => Err(TransportError::Io(std::io::Error::other(reason))),
            None => Ok(()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
