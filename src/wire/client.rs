// WireClient: outbound persistent WebSocket session. One driver task owns
// the socket; the public handle talks to it over a command channel and the
// session reports back through an event stream. Send-buffering, the flat
// reconnect cycle and destroy-idempotence all live in the driver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::WireError;
use crate::logger::Logger;
use crate::wire::{decode, encode, Frame};

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Credential source, resolved fresh on every dial.
#[derive(Clone)]
pub enum TokenSource {
    None,
    Static(String),
    Lazy(Arc<dyn Fn() -> String + Send + Sync>),
}

impl TokenSource {
    fn resolve(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Static(s) => Some(s.clone()),
            Self::Lazy(f) => Some(f()),
        }
    }
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "TokenSource::None"),
            Self::Static(_) => write!(f, "TokenSource::Static(..)"),
            Self::Lazy(_) => write!(f, "TokenSource::Lazy(..)"),
        }
    }
}

#[derive(Clone)]
pub struct WireClientConfig {
    pub url: String,
    pub token: TokenSource,
    /// Enables the reconnect cycle after a successful open.
    pub reconnect_delay: Option<Duration>,
    pub max_reconnects: Option<u32>,
    /// Queue sends while disconnected, drain FIFO on open.
    pub buffer: bool,
}

impl WireClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: TokenSource::None,
            reconnect_delay: None,
            max_reconnects: None,
            buffer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Frame(Frame),
    Disconnected,
    Destroyed,
}

enum ClientCmd {
    Connect {
        done: oneshot::Sender<Result<(), WireError>>,
    },
    Send {
        event: String,
        data: Value,
    },
    Destroy,
}

struct ClientShared {
    cmd_tx: mpsc::UnboundedSender<ClientCmd>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    buffer: bool,
}

#[derive(Clone)]
pub struct WireClient {
    inner: Arc<ClientShared>,
}

impl WireClient {
    /// Spawns the driver task. The receiver carries the session's events;
    /// the handle is cheap to clone.
    pub fn new(config: WireClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            cmd_tx,
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            buffer: config.buffer,
        });
        tokio::spawn(drive(config, shared.clone(), cmd_rx, event_tx));
        (Self { inner: shared }, event_rx)
    }

    /// First dial. Resolves once the socket is open (buffered sends already
    /// flushed); rejects on a first-attempt failure.
    pub async fn connect(&self) -> Result<(), WireError> {
        let (done, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(ClientCmd::Connect { done })
            .map_err(|_| WireError::Destroyed)?;
        rx.await.map_err(|_| WireError::Destroyed)?
    }

    /// Returns false when the frame was neither sent nor buffered.
    pub fn send(&self, event: &str, data: &Value) -> bool {
        if self.inner.destroyed.load(Ordering::Relaxed) {
            return false;
        }
        if !self.inner.connected.load(Ordering::Relaxed) && !self.inner.buffer {
            return false;
        }
        self.inner
            .cmd_tx
            .send(ClientCmd::Send {
                event: event.to_string(),
                data: data.clone(),
            })
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Idempotent: stops timers, closes the socket, ends the driver (which
    /// emits `Destroyed` exactly once).
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.inner.cmd_tx.send(ClientCmd::Destroy);
    }
}

enum SessionEnd {
    Closed,
    Destroyed,
}

async fn drive(
    config: WireClientConfig,
    shared: Arc<ClientShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCmd>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let log = Logger::new("quty-client");
    let mut buffer: VecDeque<(String, Value)> = VecDeque::new();

    'idle: while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            ClientCmd::Send { event, data } => {
                if config.buffer {
                    buffer.push_back((event, data));
                }
            }
            ClientCmd::Destroy => break,
            ClientCmd::Connect { done } => {
                let mut ws = match dial(&config).await {
                    Ok(ws) => {
                        let _ = done.send(Ok(()));
                        ws
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                        continue;
                    }
                };
                let mut attempts: u32 = 0;
                loop {
                    shared.connected.store(true, Ordering::Relaxed);
                    let end =
                        run_session(&mut ws, &config, &mut cmd_rx, &events, &mut buffer).await;
                    shared.connected.store(false, Ordering::Relaxed);
                    match end {
                        SessionEnd::Destroyed => break 'idle,
                        SessionEnd::Closed => {
                            let _ = events.send(ClientEvent::Disconnected);
                            let Some(delay) = config.reconnect_delay else {
                                continue 'idle;
                            };
                            // Flat-delay reconnect cycle. Failures here are
                            // swallowed (trace only) and re-arm the timer.
                            loop {
                                if let Some(max) = config.max_reconnects {
                                    if attempts >= max {
                                        log.debug(format!(
                                            "reconnect limit {max} reached for {}",
                                            config.url
                                        ));
                                        continue 'idle;
                                    }
                                }
                                attempts += 1;
                                if wait_or_destroy(delay, &mut cmd_rx, &config, &mut buffer).await {
                                    break 'idle;
                                }
                                match dial(&config).await {
                                    Ok(next) => {
                                        ws = next;
                                        attempts = 0;
                                        break;
                                    }
                                    Err(e) => {
                                        log.trace(format!(
                                            "reconnect to {} failed: {e}",
                                            config.url
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    shared.destroyed.store(true, Ordering::Relaxed);
    shared.connected.store(false, Ordering::Relaxed);
    let _ = events.send(ClientEvent::Destroyed);
}

/// Sleep while staying responsive to commands. Returns true on destroy.
async fn wait_or_destroy(
    delay: Duration,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCmd>,
    config: &WireClientConfig,
    buffer: &mut VecDeque<(String, Value)>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Send { event, data }) => {
                    if config.buffer {
                        buffer.push_back((event, data));
                    }
                }
                Some(ClientCmd::Connect { done }) => {
                    // Already cycling; treat as satisfied.
                    let _ = done.send(Ok(()));
                }
                Some(ClientCmd::Destroy) | None => return true,
            },
        }
    }
}

async fn run_session(
    ws: &mut WsStream,
    config: &WireClientConfig,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCmd>,
    events: &mpsc::UnboundedSender<ClientEvent>,
    buffer: &mut VecDeque<(String, Value)>,
) -> SessionEnd {
    let log = Logger::new("quty-client");

    // FIFO drain of everything queued while the socket was down.
    while let Some((event, data)) = buffer.pop_front() {
        if ws
            .send(Message::Text(encode(&event, &data).into()))
            .await
            .is_err()
        {
            return SessionEnd::Closed;
        }
    }
    let _ = events.send(ClientEvent::Connected);

    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match decode(text.as_str()) {
                        Ok(frame) => {
                            let _ = events.send(ClientEvent::Frame(frame));
                        }
                        Err(_) => log.trace(format!("ignoring malformed frame from {}", config.url)),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if ws.send(Message::Pong(payload)).await.is_err() {
                        return SessionEnd::Closed;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return SessionEnd::Closed,
                Some(Ok(_)) => {}
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Send { event, data }) => {
                    if ws
                        .send(Message::Text(encode(&event, &data).into()))
                        .await
                        .is_err()
                    {
                        return SessionEnd::Closed;
                    }
                }
                Some(ClientCmd::Connect { done }) => {
                    let _ = done.send(Ok(()));
                }
                Some(ClientCmd::Destroy) | None => {
                    let _ = ws.send(Message::Close(None)).await;
                    return SessionEnd::Destroyed;
                }
            },
        }
    }
}

async fn dial(config: &WireClientConfig) -> Result<WsStream, WireError> {
    let mut url = config.url.clone();
    if let Some(token) = config.token.resolve().filter(|t| !t.is_empty()) {
        let sep = if url.contains('?') { '&' } else { '?' };
        url = format!("{url}{sep}token={token}");
    }

    let (ws, _resp) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| WireError::DialFailed(format!("connect timeout for {}", config.url)))?
        .map_err(|e| WireError::DialFailed(e.to_string()))?;

    if let MaybeTlsStream::Plain(stream) = ws.get_ref() {
        let _ = stream.set_nodelay(true);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(10))
            .with_interval(Duration::from_secs(5));
        let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
    }
    Ok(ws)
}
