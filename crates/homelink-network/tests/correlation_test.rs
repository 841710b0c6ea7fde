//! Correlation and dispatch behavior over the shared inbound queue.
//!
//! These suites drive the queue directly with scripted traffic instead of a
//! live broker: the wait loops only ever see the queue, so the transport
//! behind it is irrelevant to what is verified here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use homelink_core::{Publisher, Request, Subscriber};
use homelink_network::{
    await_broadcast, await_unicast, spawn_dispatcher, HandlerSubscriber, InboundQueue,
    RequestHandler,
};

fn request(path: &str, session_id: u64, sender: &str) -> Request {
    Request::new(path, session_id, sender, None, json!({})).unwrap()
}

fn response(session_id: u64, sender: &str, ack: bool) -> Request {
    Request::new(
        "smarthome/config/write",
        session_id,
        sender,
        Some("bridge".to_string()),
        json!({"ack": ack}),
    )
    .unwrap()
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<Request>>,
}

impl RecordingHandler {
    async fn session_ids(&self) -> Vec<u64> {
        self.seen.lock().await.iter().map(|r| r.session_id()).collect()
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    async fn handle_request(&self, req: Request) {
        self.seen.lock().await.push(req);
    }
}

#[derive(Default)]
struct RecordingSubscriber {
    seen: Mutex<Vec<Request>>,
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn receive(&self, req: Request) -> anyhow::Result<()> {
        self.seen.lock().await.push(req);
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_unicast_waits_get_their_own_sessions() {
    let queue = Arc::new(InboundQueue::default());

    let req_a = request("smarthome/config/write", 1, "bridge");
    let req_b = request("smarthome/config/write", 2, "bridge");

    let mut rx_a = queue.subscribe();
    let mut rx_b = queue.subscribe();
    let wait_a = tokio::spawn({
        let req = req_a.clone();
        let queue = Arc::clone(&queue);
        async move {
            let publisher = Publisher::new();
            await_unicast(&mut rx_a, &queue, &publisher, &req, Duration::from_secs(5)).await
        }
    });
    let wait_b = tokio::spawn({
        let req = req_b.clone();
        let queue = Arc::clone(&queue);
        async move {
            let publisher = Publisher::new();
            await_unicast(&mut rx_b, &queue, &publisher, &req, Duration::from_secs(5)).await
        }
    });

    // Give both waits time to start polling, then answer in reverse order.
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.push(response(2, "chip2", true));
    queue.push(response(1, "chip1", false));

    let outcome_a = wait_a.await.unwrap().unwrap();
    let outcome_b = wait_b.await.unwrap().unwrap();

    assert_eq!(outcome_a.ack, Some(false));
    assert_eq!(outcome_a.response.as_ref().unwrap().sender(), "chip1");
    assert_eq!(outcome_b.ack, Some(true));
    assert_eq!(outcome_b.response.as_ref().unwrap().sender(), "chip2");
}

#[tokio::test]
async fn test_unicast_ignores_own_echo() {
    let queue = Arc::new(InboundQueue::default());
    let req = request("smarthome/config/write", 9, "bridge");

    let mut rx = queue.subscribe();
    let wait = tokio::spawn({
        let req = req.clone();
        let queue = Arc::clone(&queue);
        async move {
            let publisher = Publisher::new();
            await_unicast(&mut rx, &queue, &publisher, &req, Duration::from_secs(5)).await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    // echoed broadcast of our own request must not satisfy the wait
    queue.push(request("smarthome/config/write", 9, "bridge"));
    queue.push(response(9, "chip1", true));

    let outcome = wait.await.unwrap().unwrap();
    assert_eq!(outcome.response.unwrap().sender(), "chip1");
}

#[tokio::test]
async fn test_wait_fans_out_unclaimed_traffic_only() {
    let queue = Arc::new(InboundQueue::default());
    let recorder = Arc::new(RecordingSubscriber::default());
    let publisher = Publisher::new();
    publisher.subscribe(recorder.clone());

    let req = request("smarthome/config/write", 1, "bridge");
    let other_claim = queue.claim(5);

    let mut rx = queue.subscribe();
    let wait = tokio::spawn({
        let req = req.clone();
        let queue = Arc::clone(&queue);
        async move { await_unicast(&mut rx, &queue, &publisher, &req, Duration::from_secs(5)).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    // claimed by another wait: left to that waiter
    queue.push(response(5, "chip5", true));
    // unclaimed side traffic: fanned out to subscribers
    queue.push(request("smarthome/heartbeat", 999, "chip2"));
    queue.push(response(1, "chip1", true));

    let outcome = wait.await.unwrap().unwrap();
    assert_eq!(outcome.ack, Some(true));

    let seen = recorder.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].session_id(), 999);
    drop(other_claim);
}

#[tokio::test(start_paused = true)]
async fn test_unicast_times_out_in_about_the_timeout() {
    let queue = Arc::new(InboundQueue::default());
    let publisher = Publisher::new();
    let req = request("smarthome/config/write", 3, "bridge");
    let mut rx = queue.subscribe();

    let started = tokio::time::Instant::now();
    let outcome = await_unicast(&mut rx, &queue, &publisher, &req, Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(outcome.ack, None);
    assert_eq!(outcome.status_msg, "no response received");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "overslept: {elapsed:?}");
}

#[tokio::test]
async fn test_broadcast_returns_once_awaited_count_arrives() {
    let queue = Arc::new(InboundQueue::default());
    let req = request("smarthome/broadcast/req", 7, "bridge");

    let mut rx = queue.subscribe();
    let wait = tokio::spawn({
        let req = req.clone();
        let queue = Arc::clone(&queue);
        async move {
            let publisher = Publisher::new();
            await_broadcast(&mut rx, &queue, &publisher, &req, Duration::from_secs(30), 2).await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.push(request("smarthome/broadcast/res", 7, "chip1"));
    queue.push(request("smarthome/broadcast/res", 7, "chip2"));
    // a third answer arrives too late to be collected
    queue.push(request("smarthome/broadcast/res", 7, "chip3"));

    let responses = wait.await.unwrap().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].sender(), "chip1");
    assert_eq!(responses[1].sender(), "chip2");
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_with_zero_awaited_collects_until_timeout() {
    let queue = Arc::new(InboundQueue::default());
    let req = request("smarthome/broadcast/req", 8, "bridge");

    let mut rx = queue.subscribe();
    let wait = tokio::spawn({
        let req = req.clone();
        let queue = Arc::clone(&queue);
        async move {
            let publisher = Publisher::new();
            await_broadcast(&mut rx, &queue, &publisher, &req, Duration::from_secs(2), 0).await
        }
    });

    tokio::task::yield_now().await;
    queue.push(request("smarthome/broadcast/res", 8, "chip1"));
    queue.push(request("smarthome/broadcast/res", 8, "chip2"));
    // wrong session and wrong path are not collected
    queue.push(request("smarthome/broadcast/res", 9, "chip3"));
    queue.push(request("smarthome/other", 8, "chip4"));
    // duplicate sender is kept, not deduplicated
    queue.push(request("smarthome/broadcast/res", 8, "chip1"));

    let started = tokio::time::Instant::now();
    let responses = wait.await.unwrap().unwrap();
    assert!(started.elapsed() <= Duration::from_secs(3));

    let senders: Vec<&str> = responses.iter().map(|r| r.sender()).collect();
    assert_eq!(senders, vec!["chip1", "chip2", "chip1"]);
}

#[tokio::test]
async fn test_dispatcher_forwards_only_unclaimed_traffic() {
    let queue = Arc::new(InboundQueue::default());
    let publisher = Arc::new(Publisher::new());
    let handler = Arc::new(RecordingHandler::default());
    let recorder = Arc::new(RecordingSubscriber::default());
    publisher.subscribe(recorder.clone());

    let dispatcher = spawn_dispatcher(queue.clone(), publisher, handler.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let claim = queue.claim(42);
    queue.push(request("smarthome/config/write", 42, "chip1"));
    queue.push(request("smarthome/heartbeat", 7, "chip2"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.session_ids().await, vec![7]);
    assert_eq!(recorder.seen.lock().await.len(), 1);

    // once the wait is over, the same session is ordinary traffic again
    drop(claim);
    queue.push(request("smarthome/config/write", 42, "chip1"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.session_ids().await, vec![7, 42]);
    dispatcher.abort();
}

#[tokio::test]
async fn test_handler_subscriber_adapter() {
    let handler = Arc::new(RecordingHandler::default());
    let publisher = Publisher::new();
    publisher.subscribe(HandlerSubscriber::new("orchestrator", handler.clone()));

    publisher.publish(request("smarthome/sync", 5, "chip1")).await;

    assert_eq!(handler.session_ids().await, vec![5]);
}
