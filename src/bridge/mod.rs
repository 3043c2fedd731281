//! The bridge
//!
//! `CcsBridge` wires the pieces together and is what an HTTP handler (or
//! the CLI) talks to:
//!
//! ```text
//! send_message -> encode -> PendingRequests::register -> SendExecutor
//!              -> ConnectionManager::send -> Transport
//! upstream message -> ConnectionManager::send_ack (also while draining)
//! Transport -> StanzaDispatcher -> response handler -> PendingRequests::resolve
//! ```
//!
//! Inbound categories are handled as follows:
//! - responses are classified; the pending request is completed unless the
//!   nack carries no error code, and a draining nack also moves the
//!   connection to `Draining`
//! - upstream messages go to the caller's handler and are then acked
//! - receipts go to the caller's handler; a `CONNECTION_DRAINING` control
//!   moves the connection to `Draining`
//!
//! Handlers passed to the bridge observe traffic; correlation, acking and
//! draining always happen regardless of what they do, even if they panic.

use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::connection::{ConnectionManager, ConnectionState, StateListener};
use crate::correlation::{PendingRequests, ResponseHandle};
use crate::dispatch::{Handlers, StanzaDispatcher, call_guarded};
use crate::executor::SendExecutor;
use crate::message::{
    CcsMessageType, DeliveryReceiptOrControlMessage, DownstreamMessageResponse, MessageSource,
    OutboundMessage, UpstreamMessage, UuidGenerator,
};
use crate::response::{Reaction, ResponseClass, RetryBackoff, class_of, classify};
use crate::transport::{ReconnectionPolicy, Transport};
use crate::utils::error::{ConnectError, SendError};

/// Outcome of one recipient of a broadcast.
pub type BroadcastResult = (String, Result<DownstreamMessageResponse, SendError>);

pub struct CcsBridge<T: Transport> {
    settings: Settings,
    manager: Arc<ConnectionManager<T>>,
    executor: Arc<SendExecutor>,
    pending: Arc<PendingRequests>,
    dispatcher: Arc<StanzaDispatcher>,
}

impl<T: Transport> CcsBridge<T> {
    /// Bridge with handlers that log every inbound message. Must run inside
    /// a tokio runtime.
    pub fn new(transport: T, settings: Settings) -> Self {
        Self::with_handlers(transport, settings, Handlers::logging())
    }

    pub fn with_handlers(transport: T, settings: Settings, handlers: Handlers) -> Self {
        let executor = Arc::new(SendExecutor::new(
            settings.executor.workers,
            settings.executor.queue_capacity,
        ));
        let manager = ConnectionManager::new(
            transport,
            executor.clone(),
            ReconnectionPolicy::RandomIncreasingDelay,
            settings.correlation.reconnect_wait(),
        );
        let pending = PendingRequests::new(settings.correlation.response_timeout());
        let dispatcher = StanzaDispatcher::new(wire_handlers(
            handlers,
            Arc::downgrade(&manager),
            pending.clone(),
        ));

        Self {
            settings,
            manager,
            executor,
            pending,
            dispatcher,
        }
    }

    /// Connects and logs in with the configured credentials.
    pub async fn open(&self) -> Result<(), ConnectError> {
        let credentials = self.settings.relay.credentials();
        self.manager
            .connect(&credentials, &self.settings.relay, self.dispatcher.listener())
            .await
    }

    /// Disconnects and waits for queued sends to finish. Terminal.
    pub async fn close(&self) {
        self.manager.close().await;
        self.executor.shutdown().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn on_state_change(&self, listener: StateListener) {
        self.manager.on_state_change(listener);
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.manager
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Number of requests still waiting for the relay's answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queues `message` and returns the handle that resolves with the
    /// relay's raw response.
    pub fn submit(&self, mut message: OutboundMessage) -> Result<ResponseHandle, SendError> {
        let state = self.manager.state();
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return Err(SendError::NotConnected(state));
        }

        let message_id = message.ensure_message_id(&UuidGenerator).to_string();
        let json = message.encode()?;
        debug!("Sending message:\n{}", message.pretty());

        let handle = self.pending.register(&message_id, None)?;
        if let Err(e) = self.manager.send_async(json) {
            self.pending.cancel(&message_id);
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Sends `message` and waits for the relay's ack. A nack comes back as
    /// `SendError::Rejected` carrying its class.
    pub async fn send_message(
        &self,
        message: OutboundMessage,
    ) -> Result<DownstreamMessageResponse, SendError> {
        let response = self.submit(message)?.wait().await?;
        match class_of(&response) {
            ResponseClass::Ack => Ok(response),
            class => Err(SendError::Rejected { class, response }),
        }
    }

    /// Sends a copy of `message` to every recipient, each with its own
    /// message id. One recipient failing does not affect the others.
    pub async fn send_broadcast(
        &self,
        message: &OutboundMessage,
        recipients: &[String],
    ) -> Vec<BroadcastResult> {
        let sends = recipients.iter().map(|recipient| async move {
            let result = self.send_message(message.for_recipient(recipient.clone())).await;
            if let Err(e) = &result {
                warn!("Broadcast to {recipient} failed: {e}");
            }
            (recipient.clone(), result)
        });
        join_all(sends).await
    }

    /// Like `send_message`, resending retryable failures with a fresh message
    /// id after an exponentially growing delay.
    pub async fn send_with_retry(
        &self,
        message: OutboundMessage,
        backoff: RetryBackoff,
    ) -> Result<DownstreamMessageResponse, SendError> {
        let mut attempt = 1;
        let mut next = message.clone();
        loop {
            match self.send_message(next).await {
                Err(e) if e.is_retryable() && attempt < backoff.max_attempts => {
                    let delay = backoff.delay_after(attempt);
                    warn!(
                        "Attempt {attempt} failed ({e}), retrying in {}ms",
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                    next = message.with_fresh_id();
                }
                outcome => return outcome,
            }
        }
    }
}

/// Wraps the caller's handlers with correlation, acking and draining.
fn wire_handlers<T: Transport>(
    user: Handlers,
    manager: Weak<ConnectionManager<T>>,
    pending: Arc<PendingRequests>,
) -> Handlers {
    let Handlers {
        upstream,
        response,
        receipt_or_control,
    } = user;

    let response_manager = manager.clone();
    let control_manager = manager.clone();
    let upstream_manager = manager;

    Handlers::default()
        .on_response(
            move |msg: &DownstreamMessageResponse, source: &MessageSource| {
                if let Some(observer) = &response {
                    if !call_guarded(observer, msg, source) {
                        error!("Response handler panicked on {}", msg.message_id);
                    }
                }
                let class = classify(msg);
                match class.reaction() {
                    Reaction::Complete => {
                        pending.resolve(&msg.message_id, msg.clone());
                    }
                    Reaction::DrainAndComplete => {
                        if let Some(manager) = response_manager.upgrade() {
                            manager.enter_draining();
                        }
                        pending.resolve(&msg.message_id, msg.clone());
                    }
                    Reaction::LeavePending => {
                        debug!("Leaving {} pending until it times out", msg.message_id);
                    }
                }
            },
        )
        .on_upstream(move |msg: &UpstreamMessage, source: &MessageSource| {
            if let Some(handler) = &upstream {
                if !call_guarded(handler, msg, source) {
                    error!("Upstream handler panicked on {}", msg.message_id);
                }
            }
            let Some(manager) = upstream_manager.upgrade() else {
                return;
            };
            let ack = match msg.acknowledgement().and_then(|ack| ack.encode()) {
                Ok(json) => json,
                Err(e) => {
                    error!("Cannot acknowledge upstream message: {e}");
                    return;
                }
            };
            if let Err(e) = manager.send_ack_async(ack) {
                error!("Failed to queue ack for {}: {e}", msg.message_id);
            }
        })
        .on_receipt_or_control(
            move |msg: &DeliveryReceiptOrControlMessage, source: &MessageSource| {
                if let Some(handler) = &receipt_or_control {
                    if !call_guarded(handler, msg, source) {
                        error!("Receipt/control handler panicked on {:?}", msg.message_id);
                    }
                }
                if msg.is_connection_draining() {
                    if let Some(manager) = control_manager.upgrade() {
                        manager.enter_draining();
                    }
                } else if msg.message_type == CcsMessageType::Control {
                    warn!("Unknown control type {:?}, ignoring", msg.control_type);
                }
            },
        )
}

#[cfg(test)]
mod tests;
