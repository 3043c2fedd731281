//! Stanza dispatch
//!
//! `StanzaDispatcher` is the single entry point the transport calls for every
//! inbound `<message>`. It extracts the payload once, classifies it, and
//! hands the typed message plus the cached source to the handler registered
//! for that category.
//!
//! Failure handling per stanza:
//! - unknown `message_type`: logged at error, stanza dropped
//! - malformed payload for a known category: logged at warn, handler skipped
//! - no handler registered: dropped silently (debug log only)
//! - handler panicked: caught and logged at error
//!
//! None of these affect the connection.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use crate::message::{
    Category, DeliveryReceiptOrControlMessage, DownstreamMessageResponse, InboundMessage,
    MessageSource, UpstreamMessage, parse,
};
use crate::transport::{Stanza, StanzaListener};
use crate::utils::error::DispatchError;

/// Callback for one inbound category.
pub type Handler<M> = Arc<dyn Fn(&M, &MessageSource) + Send + Sync>;

/// One optional handler per category.
#[derive(Clone, Default)]
pub struct Handlers {
    pub upstream: Option<Handler<UpstreamMessage>>,
    pub response: Option<Handler<DownstreamMessageResponse>>,
    pub receipt_or_control: Option<Handler<DeliveryReceiptOrControlMessage>>,
}

impl Handlers {
    /// Handlers that only log what they receive.
    pub fn logging() -> Self {
        Self {
            upstream: Some(Arc::new(|msg: &UpstreamMessage, _: &MessageSource| {
                info!(
                    "Upstream message {} from {} ({}): {:?}",
                    msg.message_id, msg.from, msg.category, msg.data
                );
            })),
            response: Some(Arc::new(
                |msg: &DownstreamMessageResponse, _: &MessageSource| {
                    if msg.is_ack() {
                        info!("Ack for message {} from {}", msg.message_id, msg.from);
                    } else {
                        info!(
                            "Nack for message {} from {}: {} ({})",
                            msg.message_id,
                            msg.from,
                            msg.error.as_deref().unwrap_or("no error code"),
                            msg.error_description.as_deref().unwrap_or("")
                        );
                    }
                },
            )),
            receipt_or_control: Some(Arc::new(
                |msg: &DeliveryReceiptOrControlMessage, _: &MessageSource| {
                    info!(
                        "{:?} message {:?} from {:?}, control type {:?}",
                        msg.message_type, msg.message_id, msg.from, msg.control_type
                    );
                },
            )),
        }
    }

    pub fn on_upstream(
        mut self,
        handler: impl Fn(&UpstreamMessage, &MessageSource) + Send + Sync + 'static,
    ) -> Self {
        self.upstream = Some(Arc::new(handler));
        self
    }

    pub fn on_response(
        mut self,
        handler: impl Fn(&DownstreamMessageResponse, &MessageSource) + Send + Sync + 'static,
    ) -> Self {
        self.response = Some(Arc::new(handler));
        self
    }

    pub fn on_receipt_or_control(
        mut self,
        handler: impl Fn(&DeliveryReceiptOrControlMessage, &MessageSource) + Send + Sync + 'static,
    ) -> Self {
        self.receipt_or_control = Some(Arc::new(handler));
        self
    }
}

pub struct StanzaDispatcher {
    handlers: RwLock<Handlers>,
}

impl StanzaDispatcher {
    pub fn new(handlers: Handlers) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(handlers),
        })
    }

    /// Replaces every handler at once.
    pub fn set_handlers(&self, handlers: Handlers) {
        *self.handlers.write().unwrap_or_else(|e| e.into_inner()) = handlers;
    }

    /// Classifies one stanza and runs the matching handler. Returns the
    /// category it was routed to.
    pub fn on_stanza(&self, stanza: Stanza) -> Result<Category, DispatchError> {
        debug!("Received: {}", stanza.xml());
        let source = MessageSource::new(stanza);
        let message = parse(&source)?;
        let category = message.category();

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let completed = match &message {
            InboundMessage::Upstream(msg) => {
                handlers.upstream.map(|h| call_guarded(&h, msg, &source))
            }
            InboundMessage::Response(msg) => {
                handlers.response.map(|h| call_guarded(&h, msg, &source))
            }
            InboundMessage::ReceiptOrControl(msg) => handlers
                .receipt_or_control
                .map(|h| call_guarded(&h, msg, &source)),
        };
        match completed {
            Some(true) => Ok(category),
            Some(false) => Err(DispatchError::HandlerPanicked(category)),
            None => {
                debug!("No handler for {category} message, dropping it");
                Ok(category)
            }
        }
    }

    /// Adapter registered with the transport. Dispatch failures are logged
    /// and never propagate into the transport.
    pub fn listener(self: &Arc<Self>) -> StanzaListener {
        let dispatcher = self.clone();
        Arc::new(move |stanza: Stanza| {
            if let Err(e) = dispatcher.on_stanza(stanza) {
                if e.is_classification_failure() {
                    error!("Dropping stanza: {e}");
                } else {
                    warn!("Skipping stanza: {e}");
                }
            }
        })
    }
}

/// Runs one handler. Returns `false` if it panicked.
pub(crate) fn call_guarded<M>(handler: &Handler<M>, msg: &M, source: &MessageSource) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| handler(msg, source))).is_ok()
}

#[cfg(test)]
mod tests;
