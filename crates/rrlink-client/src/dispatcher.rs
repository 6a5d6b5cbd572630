//! Command Dispatcher
//!
//! Multiplexes concurrent commands to one device over a [`Transport`] that
//! answers asynchronously and in any order.
//!
//! # Algorithm
//!
//! 1. Allocate a request id from the [`DeviceSession`] (never one that is
//!    still outstanding)
//! 2. Register a pending entry holding a oneshot sender and the deadline
//! 3. Encode and send the frame
//! 4. Wait on the oneshot
//!
//! Steps 3 and 4 share one deadline (`tokio::time::timeout_at`), so a send
//! that never completes still ends in [`RrError::Timeout`].
//!
//! A router task reads the transport's inbound channel and completes the
//! pending entry whose id matches each response. Anything else (pushes,
//! late or unknown responses) goes to the unsolicited sink, or is dropped
//! when none is set. A drop guard removes the pending entry when the call
//! finishes, fails, times out or is abandoned.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rrlink_client::{Dispatcher, DispatcherConfig, DeviceSession};
//! use rrlink_client::transport::{LocalConfig, LocalTransport};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(LocalTransport::new("192.168.1.20", "local-key", LocalConfig::default()));
//! let session = DeviceSession::new("device-duid", transport);
//! let dispatcher = Dispatcher::connect(session, DispatcherConfig::default()).await?;
//!
//! let status = dispatcher.call("get_status", json!([]), None).await?;
//! println!("{}", status);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rrlink_common::protocol::{
    ErrorKind, Message, MessageBody, RequestId, Response, Result, RpcParams, RrError,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::session::DeviceSession;
use crate::transport::Subscription;

/// Default time to wait for a device response (10 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the inbound message channel
const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// Channel receiving device pushes and unmatched responses.
pub type UnsolicitedSink = mpsc::Sender<Message>;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout applied when [`Dispatcher::call`] gets `None`
    pub default_timeout: Duration,
    /// Capacity of the channel between transport and router
    pub inbound_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }
}

struct PendingRequest {
    token: u64,
    deadline: Instant,
    tx: oneshot::Sender<Result<Response>>,
}

/// Outstanding requests keyed by id.
///
/// The lock is only held for map operations, never across an await.
#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
    next_token: AtomicU64,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes the entry for `response.id`. Returns the response back
    /// when nobody is waiting for it any more.
    fn complete(&self, response: Response) -> Option<Response> {
        let entry = self.lock().remove(&response.id);
        match entry {
            Some(entry) if Instant::now() <= entry.deadline => {
                entry.tx.send(Ok(response)).err().and_then(|r| r.ok())
            }
            _ => Some(response),
        }
    }

    fn remove(&self, id: RequestId, token: u64) {
        let mut entries = self.lock();
        if entries.get(&id).is_some_and(|e| e.token == token) {
            entries.remove(&id);
        }
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            tracing::warn!("failing {} pending request(s): {}", drained.len(), reason);
        }
        for entry in drained {
            let _ = entry
                .tx
                .send(Err(RrError::TransportFailure(reason.to_string())));
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes its pending entry when the call ends, however it ends.
struct PendingGuard {
    table: Arc<PendingTable>,
    id: RequestId,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(self.id, self.token);
    }
}

/// Correlates commands and responses for one device.
pub struct Dispatcher {
    session: Arc<DeviceSession>,
    config: DispatcherConfig,
    pending: Arc<PendingTable>,
    unsolicited: Arc<Mutex<Option<UnsolicitedSink>>>,
    subscription: Subscription,
    router: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Opens the session's transport and starts routing its inbound messages.
    pub async fn connect(session: DeviceSession, config: DispatcherConfig) -> Result<Self> {
        let session = Arc::new(session);
        let transport = Arc::clone(session.transport());
        transport.open().await?;

        let (tx, rx) = mpsc::channel(config.inbound_capacity);
        let subscription = transport.subscribe(tx).await?;

        let pending = Arc::new(PendingTable::default());
        let unsolicited = Arc::new(Mutex::new(None));
        let router = tokio::spawn(route_inbound(
            rx,
            Arc::clone(&pending),
            Arc::clone(&unsolicited),
        ));

        tracing::info!("dispatcher started for device {}", session.duid());
        Ok(Self {
            session,
            config,
            pending,
            unsolicited,
            subscription,
            router: Mutex::new(Some(router)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Sends `method` with `params` and waits for the matching response.
    ///
    /// # Arguments
    ///
    /// * `method` - Device command name
    /// * `params` - Command parameters (`null` is sent as `[]`)
    /// * `timeout` - Overrides [`DispatcherConfig::default_timeout`]
    ///
    /// # Returns
    ///
    /// The `result` value of the response
    ///
    /// # Errors
    ///
    /// - [`RrError::Timeout`] if no response arrives in time
    /// - [`RrError::TransportFailure`] if the channel fails or the
    ///   dispatcher is closed
    /// - [`RrError::DeviceError`] if the device answers with an error
    pub async fn call(
        &self,
        method: &str,
        params: RpcParams,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RrError::TransportFailure("dispatcher is closed".to_string()));
        }

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let (rx, guard) = self.register(deadline);
        let id = guard.id;

        let frame = self.session.encode_request(id, method, params)?;
        tracing::debug!("-> {} id={} ({} bytes)", method, id, frame.len());
        let sent = tokio::time::timeout_at(deadline, self.session.transport().send(&frame)).await;
        match sent {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!("{} id={} send did not finish within {:?}", method, id, timeout);
                return Err(RrError::Timeout(timeout.as_millis() as u64));
            }
        }

        let outcome = tokio::time::timeout_at(deadline, rx).await;
        drop(guard);

        let response = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(RrError::TransportFailure(
                    "dispatcher stopped before a response arrived".to_string(),
                ))
            }
            Err(_) => {
                tracing::debug!("{} id={} timed out after {:?}", method, id, timeout);
                return Err(RrError::Timeout(timeout.as_millis() as u64));
            }
        };

        tracing::debug!("<- {} id={}", method, id);
        match response.error {
            Some(error) => Err(RrError::DeviceError(error.to_string())),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    fn register(&self, deadline: Instant) -> (oneshot::Receiver<Result<Response>>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        let token = self.pending.next_token.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.pending.lock();
        let id = self.session.allocate_id(|id| entries.contains_key(&id));
        entries.insert(
            id,
            PendingRequest {
                token,
                deadline,
                tx,
            },
        );
        drop(entries);

        let guard = PendingGuard {
            table: Arc::clone(&self.pending),
            id,
            token,
        };
        (rx, guard)
    }

    /// Sets (or clears) the sink for pushes and unmatched responses.
    pub fn set_unsolicited_sink(&self, sink: Option<UnsolicitedSink>) {
        *self.unsolicited.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the transport and fails every outstanding call with
    /// [`RrError::TransportFailure`].
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.subscription.unsubscribe();
        let result = self.session.transport().close().await;
        self.pending.fail_all("dispatcher closed");
        self.abort_router();

        tracing::info!("dispatcher closed for device {}", self.session.duid());
        result
    }

    fn abort_router(&self) {
        let handle = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.abort_router();
    }
}

async fn route_inbound(
    mut rx: mpsc::Receiver<Result<Message>>,
    pending: Arc<PendingTable>,
    unsolicited: Arc<Mutex<Option<UnsolicitedSink>>>,
) {
    while let Some(item) = rx.recv().await {
        let message = match item {
            Ok(message) => message,
            Err(e) if e.kind() == ErrorKind::TransportFailure => {
                pending.fail_all(&e.to_string());
                continue;
            }
            Err(e) => {
                tracing::warn!("discarding inbound frame: {}", e);
                continue;
            }
        };

        let leftover = match message.body {
            MessageBody::Response(response) => match pending.complete(response) {
                None => continue,
                Some(response) => Message {
                    body: MessageBody::Response(response),
                    ..message
                },
            },
            _ => message,
        };

        forward_unsolicited(&unsolicited, leftover);
    }

    pending.fail_all("transport channel closed");
}

fn forward_unsolicited(unsolicited: &Mutex<Option<UnsolicitedSink>>, message: Message) {
    let sink = unsolicited
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    match sink {
        Some(sink) => {
            if let Err(e) = sink.try_send(message) {
                tracing::warn!("unsolicited message dropped: {}", e);
            }
        }
        None => tracing::debug!(
            "no unsolicited sink, dropping message seq={} protocol={}",
            message.seq,
            message.protocol.code()
        ),
    }
}
