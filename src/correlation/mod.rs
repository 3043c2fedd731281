//! Request/response correlation
//!
//! Every downstream message is registered here under its message id before
//! it is written to the wire. The relay's ack or nack is matched back by
//! that id and completes the caller's `ResponseHandle` exactly once.
//!
//! Each entry owns a reaper task that removes it when its deadline passes,
//! whether or not anybody awaits the handle. Entries carry a token so a
//! reaper never removes a later registration of the same id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::DownstreamMessageResponse;
use crate::utils::error::CorrelationError;

struct Entry {
    token: u64,
    created_at: DateTime<Utc>,
    slot: oneshot::Sender<DownstreamMessageResponse>,
    reaper: JoinHandle<()>,
}

pub struct PendingRequests {
    entries: Mutex<HashMap<String, Entry>>,
    next_token: AtomicU64,
    default_timeout: Duration,
}

impl PendingRequests {
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Starts tracking `message_id`. Must run inside a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        message_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle, CorrelationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut entries = self.lock();
        if entries.contains_key(message_id) {
            return Err(CorrelationError::DuplicateId(message_id.to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        let reaper = {
            let table = Arc::downgrade(self);
            let id = message_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(table) = table.upgrade() {
                    table.expire(&id, token);
                }
            })
        };

        entries.insert(
            message_id.to_string(),
            Entry {
                token,
                created_at: Utc::now(),
                slot,
                reaper,
            },
        );

        Ok(ResponseHandle {
            message_id: message_id.to_string(),
            rx,
        })
    }

    /// Completes the request registered under `message_id`. Returns `false`
    /// when nothing is pending for it (late, duplicate or unknown response).
    pub fn resolve(&self, message_id: &str, response: DownstreamMessageResponse) -> bool {
        let Some(entry) = self.lock().remove(message_id) else {
            warn!("Received response for unknown message_id: {message_id}");
            return false;
        };
        entry.reaper.abort();

        let elapsed = Utc::now() - entry.created_at;
        debug!(
            "Response for {message_id} after {}ms",
            elapsed.num_milliseconds()
        );
        if entry.slot.send(response).is_err() {
            debug!("Caller stopped waiting for {message_id}");
        }
        true
    }

    /// Drops the request without completing it, e.g. when the write failed.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.lock().remove(message_id) {
            Some(entry) => {
                entry.reaper.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn expire(&self, message_id: &str, token: u64) {
        let mut entries = self.lock();
        if entries.get(message_id).is_some_and(|e| e.token == token) {
            if let Some(entry) = entries.remove(message_id) {
                let elapsed = Utc::now() - entry.created_at;
                warn!(
                    "No response for {message_id} after {}ms, giving up",
                    elapsed.num_milliseconds()
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The caller's side of one pending request.
#[derive(Debug)]
pub struct ResponseHandle {
    message_id: String,
    rx: oneshot::Receiver<DownstreamMessageResponse>,
}

impl ResponseHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Resolves with the relay's response, or `TimedOut` once the entry
    /// expired or was cancelled.
    pub async fn wait(self) -> Result<DownstreamMessageResponse, CorrelationError> {
        self.rx
            .await
            .map_err(|_| CorrelationError::TimedOut(self.message_id))
    }
}
