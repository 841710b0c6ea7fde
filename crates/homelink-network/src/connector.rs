//! Transport-agnostic connector contract.
//!
//! Both transports implement [`NetworkConnector`]: write a request, then keep
//! reading inbound traffic under a deadline until the correlation predicate
//! matches. The deadline is budgeted over short bounded reads (at most
//! [`MAX_POLL_SLICE`] each) because embedded transports cannot be trusted
//! with one long blocking read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use homelink_core::paths::BROADCAST_RESPONSE_PATH;
use homelink_core::{Publisher, Request, Subscriber};

use crate::error::{NetworkError, Result};
use crate::inbound::{InboundQueue, InboundReceiver};

/// Default timeout for unicast requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(6);

/// Default timeout for broadcast collection.
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for one blocking read inside a wait loop.
pub const MAX_POLL_SLICE: Duration = Duration::from_secs(2);

/// How long the next blocking read may take given the remaining budget.
pub(crate) fn poll_slice(remaining: Duration) -> Duration {
    remaining.min(MAX_POLL_SLICE)
}

/// Does `res` answer the pending unicast request `req`?
///
/// The sender check keeps a connector from matching its own echoed traffic.
pub(crate) fn matches_unicast(req: &Request, res: &Request) -> bool {
    res.session_id() == req.session_id() && res.sender() != req.sender()
}

/// Does `res` answer the pending broadcast `req`?
pub(crate) fn matches_broadcast(req: &Request, res: &Request) -> bool {
    res.path() == BROADCAST_RESPONSE_PATH && res.session_id() == req.session_id()
}

/// What came out of a unicast request.
///
/// "Nobody answered" is a valid outcome, not an error; transport faults are
/// the only error path of [`NetworkConnector::send_request`].
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Whether the peer acknowledged the operation; `None` when unknown
    /// (no response, or a response without an ack marker).
    pub ack: Option<bool>,
    /// Human-readable outcome detail.
    pub status_msg: String,
    /// The matched response, if one arrived.
    pub response: Option<Request>,
}

impl RequestOutcome {
    /// The timeout outcome.
    pub fn no_response() -> Self {
        Self {
            ack: None,
            status_msg: "no response received".to_string(),
            response: None,
        }
    }

    /// The peer crashed while we were waiting.
    pub fn remote_fault(detail: &str) -> Self {
        Self {
            ack: None,
            status_msg: format!("remote client crashed: {detail}"),
            response: None,
        }
    }

    /// Outcome for a matched response.
    pub fn from_response(res: Request) -> Self {
        let ack = res.ack();
        let status_msg = res
            .status_msg()
            .unwrap_or("no status message received")
            .to_string();
        Self {
            ack,
            status_msg,
            response: Some(res),
        }
    }
}

/// Contract every transport implements.
#[async_trait]
pub trait NetworkConnector: Send + Sync {
    /// Short transport identifier for logs ("serial", "mqtt").
    fn connector_type(&self) -> &str;

    /// Own identity string used as `sender` on outbound traffic.
    fn own_id(&self) -> &str;

    /// Whether the underlying channel is believed usable.
    fn is_connected(&self) -> bool;

    /// Register a subscriber for inbound traffic not claimed by a pending
    /// call.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber>);

    /// Remove a registered subscriber; errors if it was never registered.
    fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> homelink_core::Result<()>;

    /// Send `req` and wait up to `timeout` for the response matching its
    /// session id.
    async fn send_request(&self, req: &Request, timeout: Duration) -> Result<RequestOutcome>;

    /// Send `req` and collect responses arriving on the broadcast response
    /// path for its session id.
    ///
    /// Returns once `responses_awaited` matches arrived (`0` = collect until
    /// `timeout`), in arrival order, duplicates included.
    async fn send_broadcast(
        &self,
        req: &Request,
        timeout: Duration,
        responses_awaited: usize,
    ) -> Result<Vec<Request>>;
}

/// Poll a queue subscription until the unicast correlation for `req` matches
/// or the deadline passes.
///
/// Frames that fail the predicate and that no active wait claims are handed
/// to `publisher`, so subscribers on a queue-fed connector see the same side
/// traffic they would on a serial port. Claimed frames belong to another
/// waiter and are left alone; every receiver has its own view of the stream.
pub async fn await_unicast(
    rx: &mut InboundReceiver,
    queue: &InboundQueue,
    publisher: &Publisher,
    req: &Request,
    timeout: Duration,
) -> Result<RequestOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(RequestOutcome::no_response());
        }
        match tokio::time::timeout(poll_slice(remaining), rx.recv()).await {
            Ok(Some(res)) if matches_unicast(req, &res) => {
                return Ok(RequestOutcome::from_response(res));
            }
            Ok(Some(res)) => {
                if !queue.is_claimed(res.session_id()) {
                    publisher.publish(res).await;
                }
            }
            Ok(None) => return Err(NetworkError::Transport("inbound queue closed".to_string())),
            Err(_) => {}
        }
    }
}

/// Poll a queue subscription collecting broadcast responses for `req`.
///
/// Unclaimed non-matching traffic goes to `publisher`, as in
/// [`await_unicast`].
pub async fn await_broadcast(
    rx: &mut InboundReceiver,
    queue: &InboundQueue,
    publisher: &Publisher,
    req: &Request,
    timeout: Duration,
    responses_awaited: usize,
) -> Result<Vec<Request>> {
    let mut responses = Vec::new();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(responses);
        }
        match tokio::time::timeout(poll_slice(remaining), rx.recv()).await {
            Ok(Some(res)) if matches_broadcast(req, &res) => {
                responses.push(res);
                if responses_awaited > 0 && responses.len() >= responses_awaited {
                    return Ok(responses);
                }
            }
            Ok(Some(res)) => {
                if !queue.is_claimed(res.session_id()) {
                    publisher.publish(res).await;
                }
            }
            Ok(None) => return Err(NetworkError::Transport("inbound queue closed".to_string())),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(path: &str, session_id: u64, sender: &str) -> Request {
        Request::new(path, session_id, sender, None, json!({})).unwrap()
    }

    #[test]
    fn test_poll_slice_caps_at_two_seconds() {
        assert_eq!(poll_slice(Duration::from_secs(10)), MAX_POLL_SLICE);
        assert_eq!(
            poll_slice(Duration::from_millis(300)),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_unicast_predicate() {
        let out = req("smarthome/config/write", 42, "bridge");
        assert!(matches_unicast(&out, &req("smarthome/config/write", 42, "chip1")));
        // wrong session
        assert!(!matches_unicast(&out, &req("smarthome/config/write", 43, "chip1")));
        // own echo
        assert!(!matches_unicast(&out, &req("smarthome/config/write", 42, "bridge")));
    }

    #[test]
    fn test_broadcast_predicate() {
        let out = req("smarthome/broadcast/req", 7, "bridge");
        assert!(matches_broadcast(&out, &req("smarthome/broadcast/res", 7, "chip1")));
        assert!(!matches_broadcast(&out, &req("smarthome/broadcast/res", 8, "chip1")));
        assert!(!matches_broadcast(&out, &req("smarthome/other", 7, "chip1")));
    }

    #[test]
    fn test_outcome_constructors() {
        let none = RequestOutcome::no_response();
        assert_eq!(none.ack, None);
        assert_eq!(none.status_msg, "no response received");
        assert!(none.response.is_none());

        let fault = RequestOutcome::remote_fault("Backtrace: 0x40");
        assert_eq!(fault.ack, None);
        assert!(fault.status_msg.contains("Backtrace: 0x40"));

        let res = Request::new(
            "smarthome/config/write",
            42,
            "chip1",
            Some("bridge".to_string()),
            json!({"ack": true}),
        )
        .unwrap();
        let matched = RequestOutcome::from_response(res);
        assert_eq!(matched.ack, Some(true));
        assert_eq!(matched.status_msg, "no status message received");
        assert!(matched.response.is_some());
    }
}
