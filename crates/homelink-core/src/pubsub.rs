//! Publisher/subscriber base for inbound request fan-out.
//!
//! Connectors (and the dispatcher) push received [`Request`]s to registered
//! handlers without knowing who they are. Subscribers are capabilities, not a
//! class hierarchy: anything exposing [`Subscriber::receive`] can register.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::{Error, Result};
use crate::request::Request;

/// A party interested in inbound requests.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs when delivery to this subscriber fails.
    fn name(&self) -> &str;

    /// Handle one inbound request.
    async fn receive(&self, req: Request) -> anyhow::Result<()>;
}

/// Ordered, duplicate-free fan-out over registered [`Subscriber`]s.
///
/// Delivery happens synchronously in registration order. Publishing works on
/// a snapshot of the list, so subscribing or unsubscribing while a publish is
/// in flight is safe; the change applies to the next publish.
#[derive(Default)]
pub struct Publisher {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

// Identity by allocation, not by vtable: comparing fat pointers is not
// reliable across codegen units.
fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Publisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Adding one that is already registered is a
    /// no-op; registration order is delivery order.
    pub fn subscribe(&self, client: Arc<dyn Subscriber>) {
        let mut subs = self.subscribers.write();
        if !subs.iter().any(|s| same_subscriber(s, &client)) {
            subs.push(client);
        }
    }

    /// Remove a registered subscriber.
    ///
    /// Returns [`Error::UnknownSubscriber`] if it was never registered;
    /// other subscribers are unaffected either way.
    pub fn unsubscribe(&self, client: &Arc<dyn Subscriber>) -> Result<()> {
        let mut subs = self.subscribers.write();
        match subs.iter().position(|s| same_subscriber(s, client)) {
            Some(idx) => {
                subs.remove(idx);
                Ok(())
            }
            None => Err(Error::UnknownSubscriber(client.name().to_string())),
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver a request to every current subscriber, in registration order.
    ///
    /// A subscriber that fails is logged and skipped; the remaining
    /// subscribers still receive the request.
    pub async fn publish(&self, req: Request) {
        let snapshot: Vec<Arc<dyn Subscriber>> = self.subscribers.read().clone();
        for sub in snapshot {
            if let Err(e) = sub.receive(req.clone()).await {
                warn!(subscriber = sub.name(), error = %e, "subscriber failed to handle request");
            }
        }
    }
}
