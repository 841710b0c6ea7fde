//! Hand-off of unclaimed inbound traffic to the rest of the system.
//!
//! The dispatcher is the long-running loop between a transport's inbound
//! queue and the orchestrator: it blocks on "next inbound request" and
//! forwards everything no correlation wait has claimed. It runs concurrently
//! with, and independently of, the unicast/broadcast read loops.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;

use homelink_core::{Publisher, Request, Subscriber};

use crate::inbound::InboundQueue;

/// The orchestrator surface this layer dispatches into. Opaque here: what a
/// request *means* is someone else's business.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound request that no pending call claimed.
    async fn handle_request(&self, req: Request);
}

/// Adapter exposing a [`RequestHandler`] as a [`Subscriber`], so an
/// orchestrator can also register on a connector's fan-out.
pub struct HandlerSubscriber {
    name: String,
    handler: Arc<dyn RequestHandler>,
}

impl HandlerSubscriber {
    /// Wrap `handler` under the given subscriber name.
    pub fn new(name: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            handler,
        })
    }
}

#[async_trait]
impl Subscriber for HandlerSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, req: Request) -> anyhow::Result<()> {
        self.handler.handle_request(req).await;
        Ok(())
    }
}

/// Run the dispatch loop for `queue`.
///
/// Every inbound request whose session id is not claimed by an active wait
/// goes to `handler` and is fanned out to `publisher`; claimed traffic is
/// left to its waiter. The task ends when the queue closes.
pub fn spawn_dispatcher(
    queue: Arc<InboundQueue>,
    publisher: Arc<Publisher>,
    handler: Arc<dyn RequestHandler>,
) -> JoinHandle<()> {
    let mut rx = queue.subscribe();
    tokio::spawn(async move {
        info!("launching inbound dispatcher");
        while let Some(req) = rx.recv().await {
            if queue.is_claimed(req.session_id()) {
                continue;
            }
            handler.handle_request(req.clone()).await;
            publisher.publish(req).await;
        }
        info!("inbound queue closed, dispatcher stopping");
    })
}
