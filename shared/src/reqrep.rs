//! Request/reply sockets
//!
//! `RequestSocket` is the client side: strictly one outstanding request,
//! serialized by a mutex, with a short receive timeout. A timeout tears the
//! connection down, reconnects, and surfaces `NoAnswer`; the effect of the
//! timed-out request is unknown and the caller reconciles by querying state.
//! The socket can run an embedded heartbeat task that keeps the peer's
//! staleness bookkeeping alive while the owner is quiet.
//!
//! `ReplySocket` is the server side: it accepts any number of connections,
//! enforces request-then-reply per connection, and funnels all requests into
//! a single queue so the owner can dispatch from one loop. `recv_timeout`
//! lets that loop poll background conditions between requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

use crate::codec::{self, FrameDecoder};
use crate::envelope::{fcn_of, parse_reply, Reply};
use crate::error::{LinkError, LinkResult};
use crate::{now_ms, timing};

struct Connection {
    stream: Option<TcpStream>,
    decoder: FrameDecoder,
}

/// Client side of the request/reply link
#[derive(Clone)]
pub struct RequestSocket {
    ip: String,
    port: u16,
    label: String,
    timeout: Duration,
    conn: Arc<Mutex<Connection>>,
    last_activity_ms: Arc<AtomicU64>,
    heartbeat: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RequestSocket {
    /// Create a socket for the given peer; the connection is made lazily
    pub fn new(ip: impl Into<String>, port: u16, label: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port,
            label: label.into(),
            timeout: Duration::from_millis(timing::REQUEST_TIMEOUT_MS),
            conn: Arc::new(Mutex::new(Connection {
                stream: None,
                decoder: FrameDecoder::new(),
            })),
            last_activity_ms: Arc::new(AtomicU64::new(now_ms())),
            heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn no_answer(&self, msg: &Value) -> LinkError {
        LinkError::NoAnswer {
            fcn: fcn_of(msg).unwrap_or("?").to_string(),
            ip: self.ip.clone(),
            port: self.port,
        }
    }

    /// Send one request and wait for its reply body
    ///
    /// On timeout the connection is re-established and `NoAnswer` is
    /// returned. Never retried here: only the caller knows whether the
    /// request is safe to repeat.
    pub async fn send_and_receive(&self, msg: &Value) -> LinkResult<Value> {
        let mut conn = self.conn.lock().await;

        let result = self.exchange(&mut conn, msg).await;
        if result.is_err() {
            // Drop the stream and reconnect so the next request starts clean
            conn.stream = None;
            conn.decoder = FrameDecoder::new();
            if let Ok(Ok(stream)) =
                timeout(self.timeout, TcpStream::connect((self.ip.as_str(), self.port))).await
            {
                conn.stream = Some(stream);
            }
        }
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
        result
    }

    /// Send a request and unwrap the reply: ack payload or `Nack` error
    pub async fn request(&self, msg: Value) -> LinkResult<Map<String, Value>> {
        let reply = self.send_and_receive(&msg).await?;
        parse_reply(reply)?.into_result()
    }

    async fn exchange(&self, conn: &mut Connection, msg: &Value) -> LinkResult<Value> {
        if conn.stream.is_none() {
            match timeout(self.timeout, TcpStream::connect((self.ip.as_str(), self.port))).await {
                Ok(Ok(stream)) => conn.stream = Some(stream),
                Ok(Err(e)) => {
                    debug!(label = %self.label, "connect to {}:{} failed: {e}", self.ip, self.port);
                    return Err(self.no_answer(msg));
                }
                Err(_) => return Err(self.no_answer(msg)),
            }
        }
        let stream = conn
            .stream
            .as_mut()
            .ok_or_else(|| self.no_answer(msg))?;

        let frame = codec::encode_json(msg)?;
        let deadline = Instant::now() + self.timeout;

        match timeout(self.timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(label = %self.label, "write failed: {e}");
                return Err(self.no_answer(msg));
            }
            Err(_) => return Err(self.no_answer(msg)),
        }

        let mut buf = [0u8; 4096];
        loop {
            if let Some(value) = conn.decoder.decode_next_json()? {
                return Ok(value);
            }
            let stream = conn
                .stream
                .as_mut()
                .ok_or_else(|| self.no_answer(msg))?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.no_answer(msg));
            }
            match timeout(remaining, stream.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(self.no_answer(msg)),
                Ok(Ok(n)) => conn.decoder.extend(&buf[..n]),
                Ok(Err(e)) => {
                    debug!(label = %self.label, "read failed: {e}");
                    return Err(self.no_answer(msg));
                }
                Err(_) => return Err(self.no_answer(msg)),
            }
        }
    }

    /// Spawn the embedded heartbeat task
    ///
    /// Whenever the socket has been idle for one timeout interval, it sends
    /// `{"fcn": "heart_beat", "id": .., "tick": n}` with a monotonically
    /// increasing tick. Misses escalate from warning to error after
    /// `timing::HEARTBEAT_ATTEMPTS` in a row; the link is never torn down
    /// from here.
    pub async fn start_heartbeat(&self, id: impl Into<String>) {
        let socket = self.clone();
        let id = id.into();
        let handle = tokio::spawn(async move {
            let mut tick: u64 = 0;
            let mut misses: u32 = 0;
            loop {
                tokio::time::sleep(socket.timeout).await;
                let idle_ms =
                    now_ms().saturating_sub(socket.last_activity_ms.load(Ordering::Relaxed));
                if idle_ms < socket.timeout.as_millis() as u64 {
                    continue;
                }
                tick += 1;
                let msg = json!({"fcn": "heart_beat", "id": id, "tick": tick});
                let acked = match socket.send_and_receive(&msg).await {
                    Ok(reply) => parse_reply(reply).map(|r| r.is_ack()).unwrap_or(false),
                    Err(_) => false,
                };
                if acked {
                    misses = 0;
                } else {
                    misses += 1;
                    if misses < timing::HEARTBEAT_ATTEMPTS {
                        warn!(label = %socket.label, "missed heartbeat (attempt #{misses})");
                    } else {
                        error!(label = %socket.label, "lost heartbeat contact with peer");
                    }
                }
            }
        });
        if let Some(old) = self.heartbeat.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Stop the heartbeat and drop the connection
    pub async fn close(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }
        let mut conn = self.conn.lock().await;
        conn.stream = None;
        conn.decoder = FrameDecoder::new();
    }
}

/// One request waiting for its reply
pub struct Incoming {
    message: Value,
    peer: SocketAddr,
    reply_tx: oneshot::Sender<Value>,
}

impl Incoming {
    pub fn message(&self) -> &Value {
        &self.message
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Answer the request; dropping an `Incoming` unanswered closes the
    /// connection instead
    pub fn respond(self, reply: &Reply) {
        match serde_json::to_value(reply) {
            Ok(value) => {
                if self.reply_tx.send(value).is_err() {
                    debug!(peer = %self.peer, "peer went away before the reply was sent");
                }
            }
            Err(e) => error!("failed to serialize reply: {e}"),
        }
    }
}

/// Server side of the request/reply link
pub struct ReplySocket {
    port: u16,
    rx: mpsc::Receiver<Incoming>,
    accept_task: JoinHandle<()>,
}

impl ReplySocket {
    /// Bind a fixed port
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
        let (tx, rx) = mpsc::channel(64);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(stream, peer, tx.clone()));
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
            rx,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next request
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }

    /// Wait for the next request, returning `None` on timeout so the owner
    /// can run its background checks
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Incoming> {
        match timeout(wait, self.rx.recv()).await {
            Ok(incoming) => incoming,
            Err(_) => None,
        }
    }
}

impl Drop for ReplySocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Incoming>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        loop {
            let message = match decoder.decode_next_json() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!(%peer, "dropping connection: {e}");
                    return;
                }
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let incoming = Incoming {
                message,
                peer,
                reply_tx,
            };
            if tx.send(incoming).await.is_err() {
                return;
            }
            // Strict request-then-reply: nothing is read until the owner answers
            let Ok(reply) = reply_rx.await else { return };
            let frame = match codec::encode_json(&reply) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(%peer, "failed to encode reply: {e}");
                    return;
                }
            };
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => decoder.extend(&buf[..n]),
        }
    }
}
