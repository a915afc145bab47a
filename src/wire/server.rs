// WireServer: inbound acceptor. One TCP listener serves both ordinary HTTP
// (exact-match route table, used for the health endpoints) and WebSocket
// upgrades on the configured path. The split is decided by peeking the
// request head before anything is consumed, so the upgrade handshake still
// sees the full request. Accepted sockets carrying peer or publisher
// attributes get keepalive supervision: ping on a fixed interval, terminate
// when the other side stops answering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WireError;
use crate::logger::Logger;
use crate::wire::{decode, encode, Frame};

/// Keepalive ping interval. A socket that shows no life for 1.5x this is
/// terminated.
pub const HEARTBEAT_TIMER: Duration = Duration::from_secs(10);

const HEAD_LIMIT: usize = 8192;
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// What the authorizer sees: the upgrade request before the handshake.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Canonical remote ip (last `:`-separated component).
    pub remote: String,
}

/// Attributes the authorizer stashes onto the accepted socket.
#[derive(Debug, Clone, Default)]
pub struct ConnAttrs {
    pub peer_id: Option<String>,
    pub publisher_id: Option<String>,
    /// Decoded token payload (reserved fields stripped).
    pub data: Value,
}

/// Pluggable admission check. `None` rejects: the socket is destroyed
/// without a reply and a `Failed` event is emitted.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, req: &UpgradeRequest) -> Option<ConnAttrs>;
}

// ---------------------------------------------------------------------------
// HTTP routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub remote: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }
}

/// Handler errors map to a 500 plain-text reply; the process never dies for
/// a route.
pub type RouteHandler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, String> + Send + Sync>;

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

struct ConnInner {
    id: String,
    attrs: ConnAttrs,
    remote_ip: String,
    tx: mpsc::UnboundedSender<Message>,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
}

/// Handle to one accepted WebSocket. Cheap to clone; owned jointly by the
/// server registry and whoever received the `Client` event.
#[derive(Clone)]
pub struct ServerConn {
    inner: Arc<ConnInner>,
}

impl ServerConn {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn attrs(&self) -> &ConnAttrs {
        &self.inner.attrs
    }

    pub fn remote_ip(&self) -> &str {
        &self.inner.remote_ip
    }

    pub fn send(&self, event: &str, data: &Value) -> bool {
        self.inner
            .tx
            .send(Message::Text(encode(event, data).into()))
            .is_ok()
    }

    pub fn terminate(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.is_closed()
    }

    fn touch(&self) {
        *self.inner.last_seen.lock().unwrap() = Instant::now();
    }
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote_ip)
            .finish()
    }
}

#[derive(Debug)]
pub enum ServerEvent {
    Listening { port: u16 },
    Client(ServerConn),
    Event { conn: ServerConn, frame: Frame },
    Disconnect(ServerConn),
    Failed { remote: String, reason: String },
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub path: String,
}

struct ServerInner {
    config: ServerConfig,
    authorizer: OnceLock<Box<dyn Authorizer>>,
    routes: Mutex<HashMap<(String, String), RouteHandler>>,
    conns: DashMap<String, ServerConn>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
    log: Logger,
}

#[derive(Clone)]
pub struct WireServer {
    inner: Arc<ServerInner>,
}

impl WireServer {
    pub fn new(config: ServerConfig) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            config,
            authorizer: OnceLock::new(),
            routes: Mutex::new(HashMap::new()),
            conns: DashMap::new(),
            events,
            cancel: CancellationToken::new(),
            log: Logger::new("quty-server"),
        });
        (Self { inner }, event_rx)
    }

    /// Install the upgrade authorizer. Without one every upgrade is admitted
    /// with empty attributes.
    pub fn set_authorizer(&self, authorizer: Box<dyn Authorizer>) {
        let _ = self.inner.authorizer.set(authorizer);
    }

    /// Register an exact-match HTTP route.
    pub fn add_handler(&self, method: &str, path: &str, handler: RouteHandler) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .insert((method.to_ascii_uppercase(), path.to_string()), handler);
    }

    /// Bind and start accepting. Returns the bound port (meaningful when
    /// configured with port 0).
    pub async fn listen(&self) -> Result<u16, WireError> {
        let addr = format!("0.0.0.0:{}", self.inner.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WireError::Bind { addr, source: e })?;
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.inner.config.port);
        self.inner.log.info(format!("listening on port {port}"));
        tokio::spawn(accept_loop(self.inner.clone(), listener));
        let _ = self.inner.events.send(ServerEvent::Listening { port });
        Ok(port)
    }

    pub fn conn_count(&self) -> usize {
        self.inner.conns.len()
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let keepalive = TcpKeepalive::new()
                        .with_time(Duration::from_secs(10))
                        .with_interval(Duration::from_secs(5));
                    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        handle_socket(inner, stream, addr).await;
                    });
                }
                Err(e) => inner.log.warn(format!("accept error: {e}")),
            },
            () = inner.cancel.cancelled() => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-socket handling
// ---------------------------------------------------------------------------

struct RequestHead {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    head_len: usize,
}

/// Peek the request head without consuming it, so a WebSocket handshake can
/// still read the full request afterwards.
async fn peek_head(stream: &TcpStream) -> Option<RequestHead> {
    let mut buf = vec![0u8; HEAD_LIMIT];
    let mut last_len = 0usize;
    let deadline = Instant::now() + HEAD_TIMEOUT;
    loop {
        let n = stream.peek(&mut buf).await.ok()?;
        if let Some(pos) = find_head_end(&buf[..n]) {
            return parse_head(&buf[..pos + 4], pos + 4);
        }
        if n >= HEAD_LIMIT || Instant::now() >= deadline {
            return None;
        }
        if n == last_len {
            // Partial head, nothing new yet.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        last_len = n;
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(raw: &[u8], head_len: usize) -> Option<RequestHead> {
    let text = std::str::from_utf8(raw).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_ascii_uppercase();
    let target = parts.next()?;
    parts.next()?; // HTTP version

    let (path, query_raw) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q),
        None => (target.to_string(), ""),
    };
    let query = parse_query(query_raw);

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Some(RequestHead {
        method,
        path,
        query,
        headers,
        head_len,
    })
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Last `:`-separated component: strips the IPv6-mapped prefix off
/// `::ffff:a.b.c.d` remotes.
fn canonical_ip(addr: &SocketAddr) -> String {
    let ip = addr.ip().to_string();
    ip.rsplit(':').next().unwrap_or(&ip).to_string()
}

async fn handle_socket(inner: Arc<ServerInner>, stream: TcpStream, addr: SocketAddr) {
    // Misbehaving clients that connect and never speak are cut off here.
    let head = match tokio::time::timeout(HEAD_TIMEOUT, peek_head(&stream)).await {
        Ok(Some(head)) => head,
        _ => return,
    };
    let remote = canonical_ip(&addr);

    let is_upgrade = head
        .headers
        .get("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if !is_upgrade {
        serve_http(&inner, stream, head, remote).await;
        return;
    }

    if head.path != inner.config.path {
        inner
            .log
            .debug(format!("upgrade on unexpected path {:?} from {remote}", head.path));
        return;
    }

    let attrs = match inner.authorizer.get() {
        Some(authorizer) => {
            let req = UpgradeRequest {
                path: head.path.clone(),
                query: head.query.clone(),
                remote: remote.clone(),
            };
            match authorizer.authorize(&req) {
                Some(attrs) => attrs,
                None => {
                    let _ = inner.events.send(ServerEvent::Failed {
                        remote,
                        reason: "unauthorized".to_string(),
                    });
                    return;
                }
            }
        }
        None => ConnAttrs::default(),
    };

    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            inner.log.debug(format!("upgrade failed for {remote}: {e}"));
            return;
        }
    };

    let conn_id = Uuid::now_v7().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = ServerConn {
        inner: Arc::new(ConnInner {
            id: conn_id.clone(),
            attrs,
            remote_ip: remote,
            tx,
            last_seen: Mutex::new(Instant::now()),
            cancel: inner.cancel.child_token(),
        }),
    };
    inner.conns.insert(conn_id.clone(), conn.clone());
    let _ = inner.events.send(ServerEvent::Client(conn.clone()));

    let (mut sink, mut source) = ws.split();

    let cancel = conn.inner.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = cancel.cancelled() => break,
            }
        }
        let _ = sink.close().await;
    });

    let supervised =
        conn.inner.attrs.peer_id.is_some() || conn.inner.attrs.publisher_id.is_some();
    if supervised {
        tokio::spawn(heartbeat(conn.clone()));
    }

    // Read loop.
    loop {
        let msg = tokio::select! {
            msg = source.next() => msg,
            () = conn.inner.cancel.cancelled() => break,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                match decode(text.as_str()) {
                    Ok(frame) => {
                        let _ = inner.events.send(ServerEvent::Event {
                            conn: conn.clone(),
                            frame,
                        });
                    }
                    Err(_) => inner.log.trace(format!(
                        "ignoring malformed frame from {}",
                        conn.inner.remote_ip
                    )),
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                conn.touch();
                let _ = conn.inner.tx.send(Message::Pong(payload));
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => conn.touch(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    inner.conns.remove(&conn_id);
    conn.inner.cancel.cancel();
    let _ = writer.await;
    let _ = inner.events.send(ServerEvent::Disconnect(conn));
}

/// Alive-flag supervision: ping every `HEARTBEAT_TIMER`, terminate when the
/// socket shows no life for 1.5x the timer.
async fn heartbeat(conn: ServerConn) {
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_TIMER / 2,
        HEARTBEAT_TIMER / 2,
    );
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let idle = conn.inner.last_seen.lock().unwrap().elapsed();
                if idle > HEARTBEAT_TIMER * 3 / 2 {
                    conn.terminate();
                    break;
                }
                ticks += 1;
                if ticks % 2 == 0 && conn.inner.tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
            () = conn.inner.cancel.cancelled() => break,
        }
    }
}

async fn serve_http(
    inner: &Arc<ServerInner>,
    mut stream: TcpStream,
    head: RequestHead,
    remote: String,
) {
    // Consume what we peeked plus any declared body.
    let body_len = head
        .headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut discard = vec![0u8; head.head_len + body_len.min(HEAD_LIMIT)];
    if stream.read_exact(&mut discard).await.is_err() {
        return;
    }

    let response = {
        let routes = inner.routes.lock().unwrap();
        match routes.get(&(head.method.clone(), head.path.clone())) {
            Some(handler) => {
                let req = HttpRequest {
                    method: head.method.clone(),
                    path: head.path.clone(),
                    query: head.query.clone(),
                    remote,
                };
                match handler(&req) {
                    Ok(resp) => resp,
                    Err(e) => {
                        inner
                            .log
                            .warn(format!("handler for {} {} failed: {e}", head.method, head.path));
                        HttpResponse::text(500, "Internal Server Error")
                    }
                }
            }
            None => HttpResponse::text(404, "Not Found"),
        }
    };

    let raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len(),
        response.body
    );
    let _ = stream.write_all(raw.as_bytes()).await;
    let _ = stream.shutdown().await;
}
