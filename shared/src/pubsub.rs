//! Publish/subscribe sockets
//!
//! One-way, best-effort fan-out. Frames carry `topic + ' ' + json` inside
//! the usual length-prefixed framing. There is no replay and no delivery
//! guarantee: a subscriber that cannot keep up is dropped, and anything
//! published before a subscriber connects is simply missed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec::{self, FrameDecoder};
use crate::error::{LinkError, LinkResult};

/// Per-subscriber buffer; a full buffer marks the subscriber as too slow
const SUBSCRIBER_BUFFER: usize = 64;

/// Publisher side: binds a port and fans frames out to every subscriber
pub struct PubSocket {
    port: u16,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Bytes>>>>,
    accept_task: JoinHandle<()>,
}

impl PubSocket {
    pub async fn bind(ip: &str, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind((ip, port)).await?;
        Self::from_listener(listener)
    }

    /// Bind the first free port in `[min_port, max_port]`
    pub async fn bind_range(ip: &str, min_port: u16, max_port: u16) -> std::io::Result<Self> {
        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free port in {min_port}-{max_port}"),
        );
        for port in min_port..=max_port {
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => return Self::from_listener(listener),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn from_listener(listener: TcpListener) -> std::io::Result<Self> {
        let port = listener.local_addr()?.port();
        let subscribers: Arc<Mutex<Vec<mpsc::Sender<Bytes>>>> = Arc::new(Mutex::new(Vec::new()));
        let subs = subscribers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, peer)) => {
                        let (tx, mut rx) = mpsc::channel::<Bytes>(SUBSCRIBER_BUFFER);
                        subs.lock().await.push(tx);
                        tokio::spawn(async move {
                            while let Some(frame) = rx.recv().await {
                                if stream.write_all(&frame).await.is_err() {
                                    debug!(%peer, "subscriber went away");
                                    return;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(Self {
            port,
            subscribers,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Publish one message; slow and dead subscribers are pruned here
    pub async fn publish(&self, topic: &str, msg: &Value) -> LinkResult<()> {
        let body = format!("{topic} {msg}");
        let frame = codec::encode(body.as_bytes())?;
        let mut subs = self.subscribers.lock().await;
        subs.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, "dropping subscriber that cannot keep up");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    /// Number of currently attached subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Subscriber side: connects to a publisher and filters by topic prefix
pub struct SubSocket {
    stream: TcpStream,
    decoder: FrameDecoder,
    topics: Vec<String>,
}

impl SubSocket {
    pub async fn connect(ip: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((ip, port)).await?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            topics: Vec::new(),
        })
    }

    /// Accept messages whose topic starts with `topic`
    pub fn subscribe(&mut self, topic: impl Into<String>) {
        let topic = topic.into();
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        self.topics.retain(|t| t != topic);
    }

    /// Wait for the next message matching a subscription
    pub async fn recv(&mut self) -> LinkResult<(String, Value)> {
        let mut buf = [0u8; 4096];
        loop {
            while let Some(body) = self.decoder.decode_next()? {
                if let Some(parsed) = self.parse(&body)? {
                    return Ok(parsed);
                }
            }
            match self.stream.read(&mut buf).await {
                Ok(0) => {
                    return Err(LinkError::Invalid("publisher closed the connection".into()))
                }
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `recv` with a deadline; `Ok(None)` on timeout
    pub async fn recv_timeout(&mut self, wait: Duration) -> LinkResult<Option<(String, Value)>> {
        match timeout(wait, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn parse(&self, body: &[u8]) -> LinkResult<Option<(String, Value)>> {
        let text = std::str::from_utf8(body)
            .map_err(|_| LinkError::Invalid("non-utf8 publication".into()))?;
        let (topic, json) = text
            .split_once(' ')
            .ok_or_else(|| LinkError::Invalid("publication without topic separator".into()))?;
        if !self.topics.iter().any(|t| topic.starts_with(t.as_str())) {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(json)
            .map_err(|e| LinkError::Invalid(format!("malformed publication body: {e}")))?;
        Ok(Some((topic.to_string(), value)))
    }
}
