//! Shared inbound queue for queue-fed transports.
//!
//! The MQTT listener is the only thing reading the wire; everything it
//! decodes lands here. The queue is owned by whoever composes the connectors
//! and passed in explicitly. There is no process-wide singleton.
//!
//! Delivery uses a broadcast channel: every receiver observes every request
//! in arrival order, so one waiter inspecting a message never steals it from
//! another. "Is anybody waiting for this?" is answered by the claim table:
//! active unicast/broadcast waits register their session id for as long as
//! they run, and the dispatcher only forwards traffic nobody claims.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

use homelink_core::Request;

/// Default buffering per receiver before a slow one starts lagging.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Concurrent inbound queue shared by all queue-fed connectors in one
/// process.
pub struct InboundQueue {
    tx: broadcast::Sender<Request>,
    claims: DashMap<u64, usize>,
}

impl InboundQueue {
    /// Create a queue buffering up to `capacity` requests per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            claims: DashMap::new(),
        }
    }

    /// Push one decoded inbound request. Returns `false` when no receiver is
    /// currently subscribed (the request is dropped, matching the protocol's
    /// no-persistence rule).
    pub fn push(&self, req: Request) -> bool {
        self.tx.send(req).is_ok()
    }

    /// Open a new view of the stream. Only requests pushed after this call
    /// are observed.
    pub fn subscribe(&self) -> InboundReceiver {
        InboundReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Register an active wait for `session_id`; the claim lasts until the
    /// returned guard drops. Concurrent waits on the same id stack.
    pub fn claim(self: &Arc<Self>, session_id: u64) -> SessionClaim {
        *self.claims.entry(session_id).or_insert(0) += 1;
        SessionClaim {
            queue: Arc::clone(self),
            session_id,
        }
    }

    /// Whether some wait currently claims `session_id`.
    pub fn is_claimed(&self, session_id: u64) -> bool {
        self.claims.get(&session_id).is_some_and(|c| *c > 0)
    }

    fn release(&self, session_id: u64) {
        if let Some(mut count) = self.claims.get_mut(&session_id) {
            *count = count.saturating_sub(1);
        }
        self.claims.remove_if(&session_id, |_, count| *count == 0);
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// One receiver's view of the inbound stream.
pub struct InboundReceiver {
    rx: broadcast::Receiver<Request>,
}

impl InboundReceiver {
    /// Receive the next inbound request; `None` once the queue is gone.
    ///
    /// A receiver that fell behind resynchronizes at the oldest retained
    /// request instead of failing.
    pub async fn recv(&mut self) -> Option<Request> {
        loop {
            match self.rx.recv().await {
                Ok(req) => return Some(req),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "inbound receiver lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// RAII registration of an active correlation wait.
pub struct SessionClaim {
    queue: Arc<InboundQueue>,
    session_id: u64,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.queue.release(self.session_id);
    }
}
