//! Cloud broker transport.
//!
//! One [`MqttSession`] holds the TLS connection to the broker and a
//! background task driving the MQTT event loop. Each device gets a
//! [`BrokerTransport`] publishing on `rr/m/i/{u}/{username}/{duid}` and
//! listening on `rr/m/o/{u}/{username}/{duid}`; any number of devices share
//! the session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rrlink_common::protocol::{Result, RrError};
use rrlink_common::transport::{FrameCodec, Framing};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use rumqttc::Transport as MqttTransport;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::{MessageSink, Subscribers, Subscription, Transport};

/// Default MQTT keep-alive interval (60 seconds)
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Pause before the event loop retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the client request queue.
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// Capacity of the per-device payload channel.
const PAYLOAD_CHANNEL_CAPACITY: usize = 64;

/// One publish handed to a raw subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPublish {
    pub payload: Vec<u8>,
    /// Publishes dropped for this subscriber since the previous delivery
    /// because its channel was full
    pub dropped: u64,
}

/// Channel receiving raw publishes for one topic.
pub type RawSink = mpsc::Sender<RawPublish>;

/// Connection parameters for the cloud broker.
#[derive(Clone)]
pub struct BrokerParams {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    password: String,
    /// Account routing id (`u`), part of every device topic
    pub user_id: String,
    pub keep_alive: Duration,
    pub client_id: Option<String>,
}

impl BrokerParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            tls: true,
            username: username.into(),
            password: password.into(),
            user_id: user_id.into(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            client_id: None,
        }
    }

    /// Builds parameters from a broker URL such as `ssl://mqtt.example.com:8883`.
    ///
    /// `ssl://` and `mqtts://` enable TLS, `tcp://` and `mqtt://` disable it.
    pub fn from_url(
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Self> {
        let (tls, rest) = match url.split_once("://") {
            Some(("ssl", rest)) | Some(("mqtts", rest)) => (true, rest),
            Some(("tcp", rest)) | Some(("mqtt", rest)) => (false, rest),
            Some((scheme, _)) => {
                return Err(RrError::InvalidRequest(format!(
                    "unsupported broker scheme '{}'",
                    scheme
                )))
            }
            None => (true, url),
        };

        let (host, port) = match rest.trim_end_matches('/').rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    RrError::InvalidRequest(format!("invalid broker port '{}': {}", port, e))
                })?;
                (host.to_string(), port)
            }
            None => (rest.to_string(), if tls { 8883 } else { 1883 }),
        };

        Ok(Self::new(host, port, username, password, user_id).with_tls(tls))
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Topic the controller publishes requests for `duid` on.
    pub fn request_topic(&self, duid: &str) -> String {
        format!("rr/m/i/{}/{}/{}", self.user_id, self.username, duid)
    }

    /// Topic the device publishes responses and pushes on.
    pub fn response_topic(&self, duid: &str) -> String {
        format!("rr/m/o/{}/{}/{}", self.user_id, self.username, duid)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("rrlink-{:08x}", rand::random::<u32>()));

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(self.username.clone(), self.password.clone());
        if self.tls {
            options.set_transport(MqttTransport::tls_with_default_config());
        }
        options
    }
}

impl fmt::Debug for BrokerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &"*****")
            .field("user_id", &self.user_id)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

struct Route {
    sink: RawSink,
    dropped: u64,
}

#[derive(Default)]
struct TopicRoutes {
    next_id: u64,
    topics: HashMap<String, HashMap<u64, Route>>,
}

impl TopicRoutes {
    /// Adds a sink for `topic`. Returns its id and whether it is the
    /// topic's first sink.
    fn insert(&mut self, topic: &str, sink: RawSink) -> (u64, bool) {
        self.next_id += 1;
        let id = self.next_id;
        let sinks = self.topics.entry(topic.to_string()).or_default();
        sinks.insert(id, Route { sink, dropped: 0 });
        (id, sinks.len() == 1)
    }

    /// Removes sink `id`. Returns true when `topic` has no sinks left.
    fn remove(&mut self, topic: &str, id: u64) -> bool {
        let Some(sinks) = self.topics.get_mut(topic) else {
            return false;
        };
        if sinks.remove(&id).is_none() {
            return false;
        }
        if sinks.is_empty() {
            self.topics.remove(topic);
            return true;
        }
        false
    }

    fn topic_names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Hands `payload` to every sink without waiting. A full sink loses the
    /// payload and is told how many it lost with its next delivery.
    fn route(&mut self, topic: &str, payload: &[u8]) {
        let Some(sinks) = self.topics.get_mut(topic) else {
            tracing::debug!("publish on unrouted topic {}", topic);
            return;
        };

        sinks.retain(|id, route| {
            let publish = RawPublish {
                payload: payload.to_vec(),
                dropped: route.dropped,
            };
            match route.sink.try_send(publish) {
                Ok(()) => {
                    route.dropped = 0;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    route.dropped += 1;
                    tracing::warn!("subscriber {} on {} is full, payload dropped", id, topic);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Subscription that removes route `id` and unsubscribes from the broker
/// once the topic has no sinks left.
fn route_subscription(
    routes: Arc<Mutex<TopicRoutes>>,
    client: AsyncClient,
    topic: String,
    id: u64,
) -> Subscription {
    Subscription::new(move || {
        let last = routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&topic, id);
        if last {
            if let Err(e) = client.try_unsubscribe(topic.clone()) {
                tracing::warn!("unsubscribe from {} failed: {}", topic, e);
            }
        }
    })
}

/// Requests every routed topic again. Returns how many were requested.
fn resubscribe(client: &AsyncClient, routes: &Mutex<TopicRoutes>) -> usize {
    let topics = routes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .topic_names();

    let mut requested = 0;
    for topic in topics {
        match client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
            Ok(()) => requested += 1,
            Err(e) => tracing::warn!("resubscribe to {} failed: {}", topic, e),
        }
    }
    requested
}

/// Decodes one publish and hands the result to `subscribers`.
///
/// Each publish carries whole frames, so bytes left over are reported as
/// [`RrError::FrameCorrupt`]. Publishes lost upstream are reported the
/// same way before the payload itself.
async fn deliver_publish(codec: &FrameCodec, publish: RawPublish, subscribers: &Subscribers) {
    if publish.dropped > 0 {
        subscribers
            .deliver(Err(RrError::FrameCorrupt(format!(
                "{} publish(es) dropped, payload channel full",
                publish.dropped
            ))))
            .await;
    }

    let output = codec.decode_stream(&publish.payload);
    for item in output.messages {
        subscribers.deliver(item).await;
    }
    if !output.remaining.is_empty() {
        subscribers
            .deliver(Err(RrError::FrameCorrupt(format!(
                "publish ended inside a frame ({} bytes pending)",
                output.remaining.len()
            ))))
            .await;
    }
}

/// A persistent connection to the cloud broker.
pub struct MqttSession {
    client: AsyncClient,
    params: BrokerParams,
    routes: Arc<Mutex<TopicRoutes>>,
    connected: watch::Receiver<bool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Starts the session. The connection is established in the background;
    /// use [`wait_connected`](Self::wait_connected) to wait for it.
    pub fn connect(params: BrokerParams) -> Arc<Self> {
        let (client, event_loop) = AsyncClient::new(params.mqtt_options(), REQUEST_QUEUE_CAPACITY);
        let routes = Arc::new(Mutex::new(TopicRoutes::default()));
        let (connected_tx, connected_rx) = watch::channel(false);

        tracing::info!("connecting to broker {}:{}", params.host, params.port);
        let handle = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            Arc::clone(&routes),
            connected_tx,
        ));

        Arc::new(Self {
            client,
            params,
            routes,
            connected: connected_rx,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    pub fn params(&self) -> &BrokerParams {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Waits until the broker has acknowledged the connection.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut connected = self.connected.clone();
        let outcome = tokio::time::timeout(timeout, connected.wait_for(|c| *c))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RrError::TransportFailure(
                "broker event loop stopped".to_string(),
            )),
            Err(_) => Err(RrError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Delivers every raw payload published on `topic` to `sink`.
    pub async fn subscribe_raw(&self, topic: &str, sink: RawSink) -> Result<Subscription> {
        let (id, first) = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic, sink);

        if first {
            if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
                self.remove_route(topic, id);
                return Err(RrError::TransportFailure(format!(
                    "subscribe to {} failed: {}",
                    topic, e
                )));
            }
            tracing::debug!("subscribed to {}", topic);
        }

        Ok(route_subscription(
            Arc::clone(&self.routes),
            self.client.clone(),
            topic.to_string(),
            id,
        ))
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| RrError::TransportFailure(format!("publish to {} failed: {}", topic, e)))
    }

    pub async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!("disconnect request not delivered: {}", e);
        }
        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::info!("disconnected from broker {}", self.params.host);
        Ok(())
    }

    fn remove_route(&self, topic: &str, id: u64) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic, id);
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    routes: Arc<Mutex<TopicRoutes>>,
    connected: watch::Sender<bool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("broker connection established");
                connected.send_replace(true);

                // Clean sessions forget subscriptions across reconnects
                let requested = resubscribe(&client, &routes);
                tracing::debug!("resubscribed to {} topic(s)", requested);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
                routes.route(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.send_replace(false);
            }
            Ok(_) => {}
            Err(e) => {
                connected.send_replace(false);
                tracing::warn!("broker connection error: {}, retrying in {:?}", e, RECONNECT_DELAY);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Device channel over a shared [`MqttSession`].
pub struct BrokerTransport {
    session: Arc<MqttSession>,
    duid: String,
    codec: FrameCodec,
    subscribers: Subscribers,
    inbound: Mutex<Option<(Subscription, JoinHandle<()>)>>,
}

impl BrokerTransport {
    pub fn new(session: Arc<MqttSession>, duid: impl Into<String>, local_key: impl Into<String>) -> Self {
        Self {
            session,
            duid: duid.into(),
            codec: FrameCodec::new(local_key).with_framing(Framing::Bare),
            subscribers: Subscribers::default(),
            inbound: Mutex::new(None),
        }
    }

    pub fn duid(&self) -> &str {
        &self.duid
    }

    fn take_inbound(&self) -> Option<(Subscription, JoinHandle<()>)> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn open(&self) -> Result<()> {
        if self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<RawPublish>(PAYLOAD_CHANNEL_CAPACITY);
        let topic = self.session.params().response_topic(&self.duid);
        let subscription = self.session.subscribe_raw(&topic, tx).await?;

        let codec = self.codec.clone();
        let subscribers = self.subscribers.clone();
        let handle = tokio::spawn(async move {
            while let Some(publish) = rx.recv().await {
                deliver_publish(&codec, publish, &subscribers).await;
            }
            subscribers
                .deliver(Err(RrError::TransportFailure(
                    "broker subscription ended".to_string(),
                )))
                .await;
        });

        let previous = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((subscription, handle));
        if let Some((subscription, handle)) = previous {
            subscription.unsubscribe();
            handle.abort();
        }

        tracing::info!("listening for device {} on {}", self.duid, topic);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let topic = self.session.params().request_topic(&self.duid);
        self.session.publish(&topic, frame).await?;
        tracing::debug!("published {} bytes to {}", frame.len(), topic);
        Ok(())
    }

    async fn subscribe(&self, sink: MessageSink) -> Result<Subscription> {
        Ok(self.subscribers.add(sink))
    }

    async fn close(&self) -> Result<()> {
        if let Some((subscription, handle)) = self.take_inbound() {
            subscription.unsubscribe();
            handle.abort();
            tracing::info!("stopped listening for device {}", self.duid);
        }
        Ok(())
    }

    fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        if let Some((subscription, handle)) = self.take_inbound() {
            subscription.unsubscribe();
            handle.abort();
        }
    }
}
