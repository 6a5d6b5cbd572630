use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rrlink_common::protocol::{Result, RrError};
use rrlink_common::transport::{FrameCodec, FrameDecoder, Framing};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::{map_io_error, MessageSink, Subscribers, Subscription, Transport};

/// Port devices listen on for local connections.
pub const DEFAULT_LOCAL_PORT: u16 = 58867;

/// Default timeout for establishing the socket (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 4096;

/// Settings for [`LocalTransport`].
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub port: u16,
    pub connect_timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOCAL_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl LocalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Direct TCP channel to a device on the local network.
///
/// # Wire Protocol
///
/// Every frame is preceded by its length as a big-endian `u32`:
///
/// ```text
/// [4-byte length] [frame]
/// ```
///
/// A background reader task feeds whatever chunks the socket yields into a
/// [`FrameDecoder`]; a trailing partial frame waits for the next read. EOF
/// or a read error ends the task and every subscriber receives
/// [`RrError::TransportFailure`].
///
/// # Example
///
/// ```no_run
/// use rrlink_client::transport::{LocalConfig, LocalTransport, Transport};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = LocalTransport::new("192.168.1.20", "device-local-key", LocalConfig::default());
/// transport.open().await?;
/// # Ok(())
/// # }
/// ```
pub struct LocalTransport {
    host: String,
    config: LocalConfig,
    codec: FrameCodec,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
}

impl LocalTransport {
    pub fn new(host: impl Into<String>, local_key: impl Into<String>, config: LocalConfig) -> Self {
        Self {
            host: host.into(),
            config,
            codec: FrameCodec::new(local_key).with_framing(Framing::LengthPrefixed),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            subscribers: Subscribers::default(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Address the transport connects to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.config.port)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.addr();
        let connect = TcpStream::connect(addr.as_str());

        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| RrError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(RrError::Connection(format!(
                "Failed to connect to {}: {}",
                addr, e
            ))),
            Err(_) => Err(RrError::Timeout(self.config.connect_timeout.as_millis() as u64)),
        }
    }

    fn abort_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.abort_reader();
        let stream = self.connect().await?;
        let (read_half, write_half) = stream.into_split();

        self.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(read_loop(
            read_half,
            FrameDecoder::new(self.codec.clone()),
            self.subscribers.clone(),
            Arc::clone(&self.connected),
        ));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *writer = Some(write_half);

        tracing::info!("connected to device at {}", self.addr());
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = match writer.as_mut() {
            Some(stream) if self.connected.load(Ordering::SeqCst) => stream,
            _ => {
                return Err(RrError::TransportFailure(format!(
                    "not connected to {}",
                    self.addr()
                )))
            }
        };

        stream
            .write_all(frame)
            .await
            .map_err(|e| map_io_error(e, "writing frame"))?;
        stream
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing stream"))?;

        tracing::debug!("sent {} bytes to {}", frame.len(), self.addr());
        Ok(())
    }

    async fn subscribe(&self, sink: MessageSink) -> Result<Subscription> {
        Ok(self.subscribers.add(sink))
    }

    async fn close(&self) -> Result<()> {
        self.abort_reader();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut stream) = self.writer.lock().await.take() {
            // The peer may already be gone
            let _ = stream.shutdown().await;
            tracing::info!("closed connection to {}", self.addr());
        }
        Ok(())
    }

    fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

async fn read_loop(
    mut stream: OwnedReadHalf,
    mut decoder: FrameDecoder,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match stream.read(&mut buf).await {
            Ok(0) => break "connection closed by device".to_string(),
            Ok(n) => {
                for item in decoder.decode_stream(&buf[..n]) {
                    if let Ok(message) = &item {
                        tracing::debug!(
                            "received frame seq={} protocol={}",
                            message.seq,
                            message.protocol.code()
                        );
                    }
                    subscribers.deliver(item).await;
                }
            }
            Err(e) => break map_io_error(e, "reading frame").to_string(),
        }
    };

    connected.store(false, Ordering::SeqCst);
    if let Some(err) = decoder.finish() {
        subscribers.deliver(Err(err)).await;
    }
    tracing::warn!("local connection ended: {}", reason);
    subscribers
        .deliver(Err(RrError::TransportFailure(reason)))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LocalConfig::default();
        assert_eq!(config.port, 58867);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_codec_is_length_prefixed() {
        let transport = LocalTransport::new("127.0.0.1", "key", LocalConfig::new().with_port(1));
        assert_eq!(transport.codec().framing(), Framing::LengthPrefixed);
        assert_eq!(transport.addr(), "127.0.0.1:1");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let transport = LocalTransport::new("127.0.0.1", "key", LocalConfig::default());
        let err = transport.send(b"frame").await.unwrap_err();
        assert!(matches!(err, RrError::TransportFailure(_)));
    }
}
