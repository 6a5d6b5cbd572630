//! Device Transports
//!
//! A [`Transport`] moves encoded frames between the controller and one
//! device. Inbound frames are decoded by the transport and handed to every
//! subscriber through an `mpsc` channel the subscriber provides.
//!
//! # Implementations
//!
//! - **[`BrokerTransport`]**: per-device topics on a shared [`MqttSession`]
//! - **[`LocalTransport`]**: direct TCP socket on the local network
//!
//! Both report a dead connection as [`RrError::TransportFailure`] on the
//! subscriber channels.

pub mod broker;
pub mod local;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rrlink_common::protocol::{Message, Result, RrError};
use rrlink_common::transport::FrameCodec;
use tokio::sync::mpsc;

pub use broker::{BrokerParams, BrokerTransport, MqttSession, RawPublish, RawSink};
pub use local::{LocalConfig, LocalTransport};

/// Channel receiving decoded inbound messages (or per-frame errors).
pub type MessageSink = mpsc::Sender<Result<Message>>;

/// A bidirectional frame channel to one device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the channel. Calling it on an open transport is a no-op.
    async fn open(&self) -> Result<()>;

    /// Sends one encoded frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Registers a sink for inbound messages.
    async fn subscribe(&self, sink: MessageSink) -> Result<Subscription>;

    async fn close(&self) -> Result<()>;

    /// Codec used for frames on this channel.
    fn codec(&self) -> &FrameCodec;

    fn is_connected(&self) -> bool;
}

/// Handle returned by [`Transport::subscribe`].
///
/// Unsubscribing is idempotent; dropping the handle unsubscribes too.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn detached() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Default)]
struct SubscriberSet {
    next_id: u64,
    sinks: HashMap<u64, MessageSink>,
}

/// Fan-out of inbound messages to every registered sink.
///
/// Delivery waits for room in each sink, so a slow subscriber slows the
/// reader instead of losing messages. Closed sinks are removed.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    inner: Arc<Mutex<SubscriberSet>>,
}

impl Subscribers {
    pub(crate) fn add(&self, sink: MessageSink) -> Subscription {
        let id = {
            let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            set.next_id += 1;
            let id = set.next_id;
            set.sinks.insert(id, sink);
            id
        };

        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            let mut set = inner.lock().unwrap_or_else(PoisonError::into_inner);
            set.sinks.remove(&id);
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sinks
            .len()
    }

    pub(crate) async fn deliver(&self, item: Result<Message>) {
        let sinks: Vec<(u64, MessageSink)> = {
            let set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            set.sinks
                .iter()
                .map(|(id, sink)| (*id, sink.clone()))
                .collect()
        };

        let mut closed = Vec::new();
        for (id, sink) in sinks {
            let copy = match &item {
                Ok(message) => Ok(message.clone()),
                Err(err) => Err(replicate(err)),
            };
            if sink.send(copy).await.is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            for id in closed {
                set.sinks.remove(&id);
            }
        }
    }
}

/// Copies an error for fan-out; categories survive, payloads become text.
fn replicate(err: &RrError) -> RrError {
    match err {
        RrError::FrameCorrupt(msg) => RrError::FrameCorrupt(msg.clone()),
        RrError::TransportFailure(msg) => RrError::TransportFailure(msg.clone()),
        RrError::Timeout(ms) => RrError::Timeout(*ms),
        other => RrError::TransportFailure(other.to_string()),
    }
}

/// Maps socket errors onto the crate error taxonomy.
pub(crate) fn map_io_error(err: std::io::Error, context: &str) -> RrError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            RrError::TransportFailure(format!("{}: connection lost", context))
        }
        _ => RrError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rrlink_common::protocol::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribers_fan_out_and_prune() {
        let subscribers = Subscribers::default();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let _sub_a = subscribers.add(tx_a);
        let _sub_b = subscribers.add(tx_b);
        drop(rx_b);

        subscribers
            .deliver(Err(RrError::FrameCorrupt("bad crc".into())))
            .await;

        let err = rx_a.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FrameCorrupt);
        assert_eq!(subscribers.len(), 1);
    }

    #[tokio::test]
    async fn test_full_sink_waits_instead_of_dropping() {
        let subscribers = Subscribers::default();
        let (tx, mut rx) = mpsc::channel(1);
        let _sub = subscribers.add(tx);

        let sender = subscribers.clone();
        let producer = tokio::spawn(async move {
            for _ in 0..10 {
                sender.deliver(Err(RrError::Timeout(1))).await;
            }
        });

        let mut received = 0;
        while received < 10 {
            rx.recv().await.unwrap().unwrap_err();
            received += 1;
        }
        producer.await.unwrap();
        assert_eq!(received, 10);
    }

    #[test]
    fn test_dropped_subscription_removes_sink() {
        let subscribers = Subscribers::default();
        let (tx, _rx) = mpsc::channel(1);
        let sub = subscribers.add(tx);
        assert_eq!(subscribers.len(), 1);
        drop(sub);
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_map_io_error() {
        let err = map_io_error(
            std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            "reading frame",
        );
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
    }
}
