//! Dispatcher Integration Tests
//!
//! These tests drive a [`Dispatcher`] over an in-memory transport that
//! records sent frames and lets the test inject inbound messages:
//! - Responses are matched by id regardless of arrival order
//! - Timeouts clean up and late responses become unsolicited
//! - Device errors and transport failures surface as the right error
//! - A send that never completes still times out

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rrlink_client::{DeviceSession, Dispatcher, DispatcherConfig, MessageSink, Subscription, Transport};
use rrlink_common::protocol::{ErrorKind, Message, MessageBody, Protocol, Request, Response, Result, RrError};
use rrlink_common::transport::FrameCodec;
use serde_json::json;
use tokio::sync::mpsc;

const KEY: &str = "mock-local-key-1";

/// What the mock transport does with a sent frame.
#[derive(Clone, Copy)]
enum SendMode {
    Deliver,
    Fail,
    Stall,
}

/// Transport that hands sent frames to the test and lets it push inbound messages.
struct MockTransport {
    codec: FrameCodec,
    sinks: Arc<Mutex<Vec<MessageSink>>>,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    send_mode: SendMode,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        match self.send_mode {
            SendMode::Deliver => {
                let _ = self.sent.send(frame.to_vec());
                Ok(())
            }
            SendMode::Fail => Err(RrError::TransportFailure("mock send failure".into())),
            SendMode::Stall => std::future::pending().await,
        }
    }

    async fn subscribe(&self, sink: MessageSink) -> Result<Subscription> {
        self.sinks.lock().unwrap().push(sink);
        Ok(Subscription::detached())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Test-side handle of the mock device.
struct MockDevice {
    codec: FrameCodec,
    sinks: Arc<Mutex<Vec<MessageSink>>>,
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockDevice {
    /// Waits for the next request the dispatcher sends.
    async fn next_request(&mut self) -> Request {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("no request sent")
            .expect("transport dropped");
        let output = self.codec.decode_stream(&frame);
        assert!(output.remaining.is_empty());
        match output.messages.into_iter().next().unwrap().unwrap().body {
            MessageBody::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    fn push(&self, item: Result<Message>) {
        let sinks = self.sinks.lock().unwrap();
        let sink = sinks.first().expect("dispatcher not subscribed");
        sink.try_send(item).unwrap();
    }

    fn respond(&self, response: Response) {
        let id = response.id;
        self.push(Ok(Message::response(id, response)));
    }
}

fn mock_pair(send_mode: SendMode) -> (MockTransport, MockDevice) {
    let sinks = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = MockTransport {
        codec: FrameCodec::new(KEY),
        sinks: Arc::clone(&sinks),
        sent: tx,
        send_mode,
    };
    let device = MockDevice {
        codec: FrameCodec::new(KEY),
        sinks,
        sent: rx,
    };
    (transport, device)
}

async fn dispatcher(config: DispatcherConfig) -> (Arc<Dispatcher>, MockDevice) {
    let (transport, device) = mock_pair(SendMode::Deliver);
    let session = DeviceSession::new("duid-1", Arc::new(transport));
    let dispatcher = Dispatcher::connect(session, config).await.unwrap();
    (Arc::new(dispatcher), device)
}

// ============================================================================
// Correlation Tests
// ============================================================================

#[tokio::test]
async fn test_single_call_round_trip() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_status", json!(null), None).await })
    };

    let request = device.next_request().await;
    assert_eq!(request.method, "get_status");
    assert_eq!(request.params, json!([]));
    device.respond(Response::success(request.id, json!([{"state": 8}])));

    let result = call.await.unwrap().unwrap();
    assert_eq!(result, json!([{"state": 8}]));
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn test_reverse_order_responses_reach_their_callers() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let methods = ["get_status", "get_consumable", "get_clean_summary"];
    let mut calls = Vec::new();
    for method in methods {
        let dispatcher = Arc::clone(&dispatcher);
        calls.push(tokio::spawn(async move {
            dispatcher.call(method, json!([]), None).await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..methods.len() {
        requests.push(device.next_request().await);
    }

    let mut ids: Vec<u32> = requests.iter().map(|r| r.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "request ids must be distinct");

    for request in requests.iter().rev() {
        device.respond(Response::success(request.id, json!(request.method)));
    }

    for (call, method) in calls.into_iter().zip(methods) {
        assert_eq!(call.await.unwrap().unwrap(), json!(method));
    }
}

#[tokio::test]
async fn test_device_error_body() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("app_start", json!([]), None).await })
    };

    let request = device.next_request().await;
    device.respond(Response::error(request.id, json!({"code": -10005, "message": "busy"})));

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
    assert!(err.to_string().contains("busy"));
}

// ============================================================================
// Timeout Tests
// ============================================================================

#[tokio::test]
async fn test_timeout_then_late_response_is_unsolicited() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;
    let (sink, mut unsolicited) = mpsc::channel(8);
    dispatcher.set_unsolicited_sink(Some(sink));

    let started = tokio::time::Instant::now();
    let timeout = Duration::from_millis(100);
    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_map_v1", json!([]), Some(timeout)).await })
    };

    let request = device.next_request().await;
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RrError::Timeout(100)));
    assert!(started.elapsed() >= timeout);
    assert_eq!(dispatcher.pending_count(), 0);

    device.respond(Response::success(request.id, json!(["late"])));
    let late = tokio::time::timeout(Duration::from_secs(2), unsolicited.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(late.id(), Some(request.id));

    // The session keeps working after a timeout
    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_status", json!([]), None).await })
    };
    let request = device.next_request().await;
    device.respond(Response::success(request.id, json!(["ok"])));
    assert_eq!(call.await.unwrap().unwrap(), json!(["ok"]));
}

#[tokio::test]
async fn test_abandoned_call_is_cleaned_up() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_status", json!([]), None).await })
    };
    device.next_request().await;
    assert_eq!(dispatcher.pending_count(), 1);

    call.abort();
    let _ = call.await;
    assert_eq!(dispatcher.pending_count(), 0);
}

// ============================================================================
// Unsolicited and Failure Tests
// ============================================================================

#[tokio::test]
async fn test_push_goes_to_unsolicited_sink() {
    let (dispatcher, device) = dispatcher(DispatcherConfig::default()).await;
    let (sink, mut unsolicited) = mpsc::channel(8);
    dispatcher.set_unsolicited_sink(Some(sink));

    device.push(Ok(Message::raw(9, Protocol::Other(301), vec![1, 2, 3])));
    device.respond(Response::success(4242, json!("nobody asked")));

    let first = unsolicited.recv().await.unwrap();
    assert_eq!(first.protocol, Protocol::Other(301));
    let second = unsolicited.recv().await.unwrap();
    assert_eq!(second.id(), Some(4242));
}

#[tokio::test]
async fn test_corrupt_frame_does_not_fail_pending_call() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_status", json!([]), None).await })
    };
    let request = device.next_request().await;

    device.push(Err(RrError::FrameCorrupt("crc mismatch".into())));
    device.respond(Response::success(request.id, json!(["ok"])));
    assert_eq!(call.await.unwrap().unwrap(), json!(["ok"]));
}

#[tokio::test]
async fn test_transport_failure_fails_pending_calls() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_status", json!([]), None).await })
    };
    device.next_request().await;

    device.push(Err(RrError::TransportFailure("connection closed by device".into())));
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
}

#[tokio::test]
async fn test_send_failure_is_reported() {
    let (transport, _device) = mock_pair(SendMode::Fail);
    let session = DeviceSession::new("duid-1", Arc::new(transport));
    let dispatcher = Dispatcher::connect(session, DispatcherConfig::default()).await.unwrap();

    let err = dispatcher.call("get_status", json!([]), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn test_stalled_send_times_out() {
    let (transport, _device) = mock_pair(SendMode::Stall);
    let session = DeviceSession::new("duid-1", Arc::new(transport));
    let dispatcher = Dispatcher::connect(session, DispatcherConfig::default()).await.unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.call("get_status", json!([]), Some(Duration::from_millis(100))),
    )
    .await
    .expect("call outlived its timeout");

    assert!(matches!(outcome, Err(RrError::Timeout(100))));
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn test_close_fails_outstanding_and_later_calls() {
    let (dispatcher, mut device) = dispatcher(DispatcherConfig::default()).await;

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.call("get_status", json!([]), None).await })
    };
    device.next_request().await;

    dispatcher.close().await.unwrap();
    assert!(dispatcher.is_closed());

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);

    let err = dispatcher.call("get_status", json!([]), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
}

#[tokio::test]
async fn test_default_timeout_from_config() {
    let config = DispatcherConfig::new().with_default_timeout(Duration::from_millis(30));
    let (dispatcher, _device) = dispatcher(config).await;

    let err = dispatcher.call("get_status", json!([]), None).await.unwrap_err();
    assert!(matches!(err, RrError::Timeout(30)));
}
