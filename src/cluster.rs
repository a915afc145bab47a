// Cluster: the top-level fabric. Composes a WireServer (inbound peers and
// publishers) with a pool of outbound WireClients, all sharing one
// ChannelHub. One mutex over hub + peer maps + readiness keeps the
// reference event-loop semantics: every socket event, publication and
// gossip mutation is serialized through it, and it is never held across an
// await (all sends are unbounded-channel pushes).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::hub::{ChannelHub, HubEvent, HubEventLog, PublishOpts};
use crate::logger::Logger;
use crate::token::{self, CreateOpts, VerifyOpts, TYPE_CLUSTER_PEER, TYPE_PUBLISHER};
use crate::util::{self, PeerAddress};
use crate::wire::client::{ClientEvent, TokenSource, WireClient, WireClientConfig};
use crate::wire::server::{
    Authorizer, ConnAttrs, HttpResponse, ServerConfig, ServerConn, ServerEvent, UpgradeRequest,
    WireServer,
};
use crate::wire::{tags, Frame};

/// A dialed peer must answer with NodeInfo within this window.
pub(crate) const NODE_INFO_TIMEOUT: Duration = Duration::from_secs(3);
const PEER_TOKEN_TTL_MS: i64 = 60_000;

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ClusterMetrics {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub peers_added: AtomicU64,
    pub peers_removed: AtomicU64,
}

impl ClusterMetrics {
    fn snapshot(&self) -> Value {
        json!({
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "messages_dropped": self.messages_dropped.load(Ordering::Relaxed),
            "peers_added": self.peers_added.load(Ordering::Relaxed),
            "peers_removed": self.peers_removed.load(Ordering::Relaxed),
        })
    }
}

// ---------------------------------------------------------------------------
// Notices (the fabric's outward event surface, incl. the Hub contract)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterNotice {
    /// Readiness flipped (monotonic, at most once per process).
    Ready,
    NodeAdd { sid: String },
    NodeRemove { sid: String },
    /// A locally attached client should receive this frame; the local Hub
    /// decides whether the session actually gets it.
    ClientMessage { channel: String, cid: String, msg: String },
    /// The local Hub should tear this client session down.
    ClientKick { cid: String },
    ClientUnsubscribe { channel: String, cid: String },
    /// Observability hook on the originating node.
    ChannelMessage { channel: String, msg: String },
    AuthFailed { remote: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub url: String,
    pub sid: String,
}

// ---------------------------------------------------------------------------
// Peer links
// ---------------------------------------------------------------------------

/// A live peer connection, whichever side opened it.
enum PeerConduit {
    Inbound(ServerConn),
    Outbound(WireClient),
}

impl PeerConduit {
    fn send(&self, event: &str, data: &Value) -> bool {
        match self {
            Self::Inbound(conn) => conn.send(event, data),
            Self::Outbound(client) => client.send(event, data),
        }
    }

    fn destroy(&self) {
        match self {
            Self::Inbound(conn) => conn.terminate(),
            Self::Outbound(client) => client.destroy(),
        }
    }
}

struct PeerLink {
    sid: String,
    /// Canonical `ip:port` of the peer's listener.
    key: String,
    url: String,
    /// Server connection id for inbound links; used to ignore disconnects
    /// of already-replaced sockets.
    conn_id: Option<String>,
    conduit: PeerConduit,
}

#[derive(Clone)]
enum FrameSrc {
    Inbound(ServerConn),
    Outbound { sid: String },
}

// ---------------------------------------------------------------------------
// State under the one logical mutex
// ---------------------------------------------------------------------------

struct ClusterState {
    hub: ChannelHub,
    nodes: HashMap<String, PeerLink>,
    node_ips: HashMap<String, String>,
    pending: HashSet<String>,
    /// Addresses that turned out to point at this very node.
    self_addrs: HashSet<String>,
    ready: bool,
    ready_queue: VecDeque<(FrameSrc, Frame)>,
}

impl ClusterState {
    fn new() -> Self {
        Self {
            hub: ChannelHub::new(),
            nodes: HashMap::new(),
            node_ips: HashMap::new(),
            pending: HashSet::new(),
            self_addrs: HashSet::new(),
            ready: false,
            ready_queue: VecDeque::new(),
        }
    }
}

struct ClusterInner {
    /// Self-handle for spawning tasks from `&self` methods.
    weak: Weak<ClusterInner>,
    id: String,
    config: ClusterConfig,
    listen_port: OnceLock<u16>,
    state: Mutex<ClusterState>,
    metrics: ClusterMetrics,
    notices: mpsc::UnboundedSender<ClusterNotice>,
    ready_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    server: WireServer,
    log: Logger,
}

pub struct Cluster {
    inner: Arc<ClusterInner>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<ClusterNotice>>>,
}

// ---------------------------------------------------------------------------
// Inbound authorization
// ---------------------------------------------------------------------------

struct ClusterAuthorizer {
    secret: Option<String>,
    log: Logger,
}

impl Authorizer for ClusterAuthorizer {
    fn authorize(&self, req: &UpgradeRequest) -> Option<ConnAttrs> {
        let raw = req.query.get("token")?;
        let payload = match token::verify(
            raw,
            &VerifyOpts {
                token_type: None,
                secret: self.secret.clone(),
            },
        ) {
            Ok(p) => p,
            Err(e) => {
                self.log
                    .debug(format!("token from {} rejected: {e}", req.remote));
                return None;
            }
        };
        match payload.token_type {
            Some(TYPE_CLUSTER_PEER) => {
                let peer_id = payload.issuer?;
                Some(ConnAttrs {
                    peer_id: Some(peer_id),
                    publisher_id: None,
                    data: payload.data,
                })
            }
            Some(TYPE_PUBLISHER) => {
                let publisher_id = match payload.issuer {
                    Some(id) => id,
                    None => util::random_id(16).ok()?,
                };
                Some(ConnAttrs {
                    peer_id: None,
                    publisher_id: Some(publisher_id),
                    data: payload.data,
                })
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

impl Cluster {
    /// Boot the fabric: bind the listener, run one discovery pass, arm the
    /// readiness timer and the discovery ticker. Fails fast on config
    /// errors, bind failure or an unavailable RNG.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        let id = util::node_id(&config.namespace)?;
        let log = Logger::new("quty-cluster");

        let (server, server_rx) = WireServer::new(ServerConfig {
            port: config.port,
            path: config.path.clone(),
        });
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak| ClusterInner {
            weak: weak.clone(),
            id,
            config,
            listen_port: OnceLock::new(),
            state: Mutex::new(ClusterState::new()),
            metrics: ClusterMetrics::default(),
            notices,
            ready_tx,
            cancel: CancellationToken::new(),
            server,
            log,
        });

        inner.server.set_authorizer(Box::new(ClusterAuthorizer {
            secret: inner.config.auth.clone(),
            log: Logger::new("quty-cluster"),
        }));
        register_routes(&inner);

        let port = inner.server.listen().await?;
        let _ = inner.listen_port.set(port);
        inner
            .log
            .info(format!("node {} listening on port {port}", inner.id));

        tokio::spawn(run_server_events(inner.clone(), server_rx));

        if inner.config.discovery.has_sources() {
            let me = inner.clone();
            tokio::spawn(async move { me.run_discovery().await });
            if inner.config.max_ready_after == 0 {
                let mut st = inner.state.lock().unwrap();
                inner.flip_ready(&mut st);
            } else {
                let me = inner.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(me.config.max_ready_after)) => {
                            let mut st = me.state.lock().unwrap();
                            me.flip_ready(&mut st);
                        }
                        () = me.cancel.cancelled() => {}
                    }
                });
            }
        } else {
            // Nobody to wait for.
            let mut st = inner.state.lock().unwrap();
            inner.flip_ready(&mut st);
        }

        tokio::spawn(discovery_ticker(inner.clone()));

        Ok(Self {
            inner,
            notice_rx: Mutex::new(Some(notice_rx)),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The bound listen port (differs from config when configured as 0).
    pub fn port(&self) -> u16 {
        self.inner.listen_port()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().unwrap().ready
    }

    /// The fabric's outward event stream; can be taken once.
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<ClusterNotice>> {
        self.notice_rx.lock().unwrap().take()
    }

    /// Publish a text payload. Returns whether any subscriber (node or
    /// local client) was matched; not a delivery confirmation.
    pub fn publish(&self, channel: &str, msg: &str) -> bool {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        let mut out = HubEventLog::new();
        let matched = st.hub.publish(
            channel,
            msg,
            Some(&inner.id),
            PublishOpts::default(),
            &mut out,
        );
        inner.route_hub_events(&mut st, out.take());
        matched
    }

    /// JSON payloads are stringified once here; every downstream emit and
    /// wire frame carries the same rendering.
    pub fn publish_value(&self, channel: &str, msg: &Value) -> bool {
        match msg {
            Value::String(s) => self.publish(channel, s),
            other => self.publish(channel, &other.to_string()),
        }
    }

    /// Subscribe this node itself to a channel.
    pub fn subscribe(&self, channel: &str) {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        let mut out = HubEventLog::new();
        let sid = inner.id.clone();
        st.hub.subscribe_node(&sid, channel, &mut out);
        inner.route_hub_events(&mut st, out.take());
    }

    pub fn unsubscribe(&self, channel: &str) {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        let mut out = HubEventLog::new();
        let sid = inner.id.clone();
        st.hub.unsubscribe_node(&sid, channel, &mut out);
        inner.route_hub_events(&mut st, out.take());
    }

    // -- Hub collaborator contract ------------------------------------------

    pub fn subscribe_client(&self, cid: &str, channel: &str) {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        let mut out = HubEventLog::new();
        let sid = inner.id.clone();
        st.hub.subscribe_client(&sid, cid, channel, &mut out);
        inner.route_hub_events(&mut st, out.take());
    }

    /// `channel: None` removes the client from every channel.
    pub fn unsubscribe_client(&self, cid: &str, channel: Option<&str>) {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        let mut out = HubEventLog::new();
        match channel {
            Some(c) => st.hub.unsubscribe_client(cid, c, &mut out),
            None => st.hub.remove_client(cid, &mut out),
        }
        inner.route_hub_events(&mut st, out.take());
    }

    pub fn is_client_subscribed(&self, cid: &str, channel: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .hub
            .is_client_subscribed(cid, channel)
    }

    /// Local bookkeeping when a client session went away.
    pub fn disconnect_client(&self, cid: &str) {
        self.unsubscribe_client(cid, None);
    }

    /// Tear down a client wherever it lives: applied locally, then gossiped
    /// once to every peer (receivers do not re-forward).
    pub fn kick_client(&self, cid: &str) {
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        inner.apply_client_kick(&mut st, cid);
        inner.broadcast(&st, tags::CLIENT_KICK, &json!({ "cid": cid }));
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let st = self.inner.state.lock().unwrap();
        st.nodes
            .values()
            .map(|l| PeerInfo {
                url: l.url.clone(),
                sid: l.sid.clone(),
            })
            .collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().hub.channels()
    }

    pub fn is_node_known(&self, sid: &str) -> bool {
        self.inner.state.lock().unwrap().nodes.contains_key(sid)
    }

    /// Node ids known to subscribe to a channel.
    pub fn channel_nodes(&self, channel: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .hub
            .node_subscribers(channel)
    }

    pub fn metrics(&self) -> Value {
        self.inner.metrics.snapshot()
    }

    /// Dial a peer by address; short-circuits when already tracked, pending
    /// or known to be this node itself.
    pub async fn add_node(&self, address: &str) {
        self.inner.add_node(address).await;
    }

    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.server.shutdown();
        let links: Vec<PeerLink> = {
            let mut st = inner.state.lock().unwrap();
            st.node_ips.clear();
            st.pending.clear();
            st.nodes.drain().map(|(_, l)| l).collect()
        };
        for link in links {
            link.conduit.destroy();
        }
        inner.log.info(format!("node {} shut down", inner.id));
    }
}

// ---------------------------------------------------------------------------
// Fabric internals
// ---------------------------------------------------------------------------

impl ClusterInner {
    fn listen_port(&self) -> u16 {
        *self.listen_port.get().unwrap_or(&self.config.port)
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("cluster inner still referenced")
    }

    fn notify(&self, notice: ClusterNotice) {
        let _ = self.notices.send(notice);
    }

    /// Monotonic readiness flip; replays the queued pre-readiness events in
    /// arrival order, skipping sources that died in the meantime.
    fn flip_ready(&self, st: &mut ClusterState) {
        if st.ready {
            return;
        }
        st.ready = true;
        self.ready_tx.send_replace(true);
        self.log.info("cluster ready");
        self.notify(ClusterNotice::Ready);
        let queued: Vec<(FrameSrc, Frame)> = st.ready_queue.drain(..).collect();
        for (src, frame) in queued {
            let dead = match &src {
                FrameSrc::Inbound(conn) => conn.is_closed(),
                FrameSrc::Outbound { sid } => !st.nodes.contains_key(sid),
            };
            if !dead {
                self.handle_frame_locked(st, src, frame);
            }
        }
    }

    /// Readiness gate in front of the frame handler.
    fn gate_frame(&self, st: &mut ClusterState, src: FrameSrc, frame: Frame) {
        if !st.ready {
            let from_peer = !matches!(&src, FrameSrc::Inbound(c) if c.attrs().peer_id.is_none());
            if frame.event == tags::NODE_STATE && from_peer {
                // First peer state ends the waiting period.
                self.flip_ready(st);
            } else {
                st.ready_queue.push_back((src, frame));
                return;
            }
        }
        self.handle_frame_locked(st, src, frame);
    }

    fn handle_frame_locked(&self, st: &mut ClusterState, src: FrameSrc, frame: Frame) {
        let from_publisher =
            matches!(&src, FrameSrc::Inbound(c) if c.attrs().publisher_id.is_some());
        let sender_sid = match &src {
            FrameSrc::Inbound(conn) => conn.attrs().peer_id.clone(),
            FrameSrc::Outbound { sid } => Some(sid.clone()),
        };

        match frame.event.as_str() {
            tags::NODE_STATE => {
                if !from_publisher {
                    self.on_node_state(st, &frame);
                }
            }
            tags::CHANNEL_JOIN => {
                let (Some(sid), Some(channel)) =
                    (sender_sid, frame.data.get("c").and_then(Value::as_str))
                else {
                    return;
                };
                let mut out = HubEventLog::new();
                st.hub.subscribe_node(&sid, channel, &mut out);
                self.route_hub_events(st, out.take());
            }
            tags::CHANNEL_LEAVE => {
                let (Some(sid), Some(channel)) =
                    (sender_sid, frame.data.get("c").and_then(Value::as_str))
                else {
                    return;
                };
                let mut out = HubEventLog::new();
                st.hub.unsubscribe_node(&sid, channel, &mut out);
                self.route_hub_events(st, out.take());
            }
            tags::CHANNEL_MESSAGE => {
                let Some(channel) = frame.data.get("c").and_then(Value::as_str) else {
                    return;
                };
                let msg = payload_text(frame.data.get("m"));
                self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                let mut out = HubEventLog::new();
                if from_publisher {
                    // Publishers feed the full pipeline: their message may
                    // still need to reach other nodes.
                    st.hub
                        .publish(channel, &msg, None, PublishOpts::default(), &mut out);
                } else {
                    // Peer-delivered: local clients only, never re-forwarded.
                    // The observability emit fires iff this node itself
                    // subscribes to the channel.
                    let opts = PublishOpts {
                        skip_nodes: true,
                        skip_broadcast: true,
                    };
                    let sid = self.id.clone();
                    st.hub.publish(channel, &msg, Some(&sid), opts, &mut out);
                }
                self.route_hub_events(st, out.take());
            }
            tags::CLIENT_KICK => {
                let Some(cid) = frame.data.get("cid").and_then(Value::as_str) else {
                    return;
                };
                self.apply_client_kick(st, cid);
                if from_publisher {
                    self.broadcast(st, tags::CLIENT_KICK, &json!({ "cid": cid }));
                }
            }
            tags::CLIENT_UNSUBSCRIBE => {
                let (Some(channel), Some(cid)) = (
                    frame.data.get("c").and_then(Value::as_str),
                    frame.data.get("cid").and_then(Value::as_str),
                ) else {
                    return;
                };
                self.apply_client_unsubscribe(st, cid, channel);
                if from_publisher {
                    self.broadcast(
                        st,
                        tags::CLIENT_UNSUBSCRIBE,
                        &json!({"c": channel, "cid": cid}),
                    );
                }
            }
            tags::NODE_INFO => {
                // Server-to-dialer only; nothing to do on this side.
            }
            other => self.log.trace(format!("unknown event tag {other:?}")),
        }
    }

    fn on_node_state(&self, st: &mut ClusterState, frame: &Frame) {
        let Some(sid) = frame.data.get("s").and_then(Value::as_str) else {
            return;
        };
        if let Some(channels) = frame.data.get("c").and_then(Value::as_array) {
            let mut out = HubEventLog::new();
            for channel in channels.iter().filter_map(Value::as_str) {
                st.hub.subscribe_node(sid, channel, &mut out);
            }
            self.route_hub_events(st, out.take());
        }
        if let Some(nodes) = frame.data.get("n").and_then(Value::as_array) {
            for entry in nodes {
                let url = entry.get("url").and_then(Value::as_str);
                let peer_sid = entry.get("sid").and_then(Value::as_str);
                let (Some(url), Some(peer_sid)) = (url, peer_sid) else {
                    continue;
                };
                if peer_sid == self.id || st.nodes.contains_key(peer_sid) {
                    continue;
                }
                let url = url.to_string();
                let me = self.arc();
                tokio::spawn(async move { me.add_node(&url).await });
            }
        }
    }

    fn apply_client_kick(&self, st: &mut ClusterState, cid: &str) {
        if !st.hub.has_client(cid) {
            return;
        }
        self.notify(ClusterNotice::ClientKick {
            cid: cid.to_string(),
        });
        let mut out = HubEventLog::new();
        st.hub.remove_client(cid, &mut out);
        self.route_hub_events(st, out.take());
    }

    fn apply_client_unsubscribe(&self, st: &mut ClusterState, cid: &str, channel: &str) {
        if !st.hub.is_client_subscribed(cid, channel) {
            return;
        }
        self.notify(ClusterNotice::ClientUnsubscribe {
            channel: channel.to_string(),
            cid: cid.to_string(),
        });
        let mut out = HubEventLog::new();
        st.hub.unsubscribe_client(cid, channel, &mut out);
        self.route_hub_events(st, out.take());
    }

    /// Turn drained hub events into peer sends and outward notices. The
    /// join/leave tags go out only for this node's own membership; gossip
    /// about other nodes is authoritative for its sender alone.
    fn route_hub_events(&self, st: &mut ClusterState, events: Vec<HubEvent>) {
        for event in events {
            match event {
                HubEvent::NodeJoined { channel, sid } => {
                    if sid == self.id {
                        self.broadcast(st, tags::CHANNEL_JOIN, &json!({ "c": channel }));
                    }
                }
                HubEvent::NodeLeft { channel, sid } => {
                    if sid == self.id {
                        self.broadcast(st, tags::CHANNEL_LEAVE, &json!({ "c": channel }));
                    }
                }
                HubEvent::NodeMessage { channel, sid, msg } => {
                    if sid == self.id {
                        continue;
                    }
                    let Some(link) = st.nodes.get(&sid) else {
                        continue;
                    };
                    let payload = json!({"c": channel, "s": self.id, "m": msg});
                    if link.conduit.send(tags::CHANNEL_MESSAGE, &payload) {
                        self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                HubEvent::NodeBroadcast { channel, msg } => {
                    // Nobody known to subscribe: flood with the advisory
                    // marker. Receivers fan out locally and never re-forward.
                    let payload = json!({"c": channel, "s": self.id, "m": msg, "b": true});
                    for link in st.nodes.values() {
                        if link.conduit.send(tags::CHANNEL_MESSAGE, &payload) {
                            self.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
                        } else {
                            self.metrics.messages_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                HubEvent::ClientMessage { channel, cid, msg } => {
                    self.notify(ClusterNotice::ClientMessage { channel, cid, msg });
                }
                HubEvent::ChannelMessage { channel, msg } => {
                    self.notify(ClusterNotice::ChannelMessage { channel, msg });
                }
                HubEvent::ChannelAdded(_)
                | HubEvent::ChannelRemoved(_)
                | HubEvent::ClientJoined { .. }
                | HubEvent::ClientLeft { .. } => {}
            }
        }
    }

    fn broadcast(&self, st: &ClusterState, event: &str, payload: &Value) {
        for link in st.nodes.values() {
            link.conduit.send(event, payload);
        }
    }

    fn node_state_payload(&self, st: &ClusterState) -> Value {
        let peers: Vec<Value> = st
            .nodes
            .values()
            .map(|l| json!({"url": l.url, "sid": l.sid}))
            .collect();
        json!({"s": self.id, "n": peers, "c": st.hub.channels_of_node(&self.id)})
    }

    fn broadcast_node_state(&self, st: &mut ClusterState) {
        if st.nodes.is_empty() {
            return;
        }
        let payload = self.node_state_payload(st);
        self.broadcast(st, tags::NODE_STATE, &payload);
    }

    // -- inbound admission ---------------------------------------------------

    fn admit_inbound(&self, conn: ServerConn) {
        let attrs = conn.attrs().clone();
        let Some(peer_id) = attrs.peer_id else {
            // Publishers need no admission bookkeeping.
            return;
        };
        let mut st = self.state.lock().unwrap();

        // Identity + our channel set: always the first application frame.
        let info = json!({
            "_t": TYPE_CLUSTER_PEER,
            "_i": self.id,
            "c": st.hub.channels_of_node(&self.id),
        });
        conn.send(tags::NODE_INFO, &info);

        // The dialer declares its listen port in the token payload.
        let Some(port) = attrs.data.get("port").and_then(Value::as_u64) else {
            self.log
                .warn(format!("peer {peer_id} declared no listen port, dropping"));
            conn.terminate();
            return;
        };
        let key = format!("{}:{}", conn.remote_ip(), port);
        if peer_id == self.id {
            st.self_addrs.insert(key);
            conn.terminate();
            return;
        }
        if st.node_ips.contains_key(&key) || st.nodes.contains_key(&peer_id) {
            self.log
                .debug(format!("duplicate connection for {key}, dropping the newer one"));
            conn.terminate();
            return;
        }

        let url = format!("ws://{key}");
        st.node_ips.insert(key.clone(), peer_id.clone());
        st.nodes.insert(
            peer_id.clone(),
            PeerLink {
                sid: peer_id.clone(),
                key,
                url,
                conn_id: Some(conn.id().to_string()),
                conduit: PeerConduit::Inbound(conn),
            },
        );
        self.metrics.peers_added.fetch_add(1, Ordering::Relaxed);
        self.log.info(format!("peer {peer_id} joined (inbound)"));
        self.notify(ClusterNotice::NodeAdd { sid: peer_id });
        self.broadcast_node_state(&mut st);
    }

    fn on_server_disconnect(&self, conn: ServerConn) {
        let Some(peer_id) = conn.attrs().peer_id.clone() else {
            return;
        };
        let mut st = self.state.lock().unwrap();
        let current = st
            .nodes
            .get(&peer_id)
            .is_some_and(|l| l.conn_id.as_deref() == Some(conn.id()));
        if current {
            self.remove_peer_locked(&mut st, &peer_id);
        }
    }

    fn remove_peer_locked(&self, st: &mut ClusterState, sid: &str) {
        let Some(link) = st.nodes.remove(sid) else {
            return;
        };
        st.node_ips.remove(&link.key);
        st.pending.remove(&link.key);
        link.conduit.destroy();
        let mut out = HubEventLog::new();
        st.hub.remove_node(sid, &mut out);
        self.route_hub_events(st, out.take());
        self.metrics.peers_removed.fetch_add(1, Ordering::Relaxed);
        self.log.info(format!("peer {sid} left"));
        self.notify(ClusterNotice::NodeRemove {
            sid: sid.to_string(),
        });
        self.broadcast_node_state(st);
    }

    // -- outbound establishment ---------------------------------------------

    async fn add_node(&self, address: &str) {
        let addr = match PeerAddress::parse(address, self.listen_port()) {
            Ok(a) => a,
            Err(e) => {
                self.log.warn(format!("ignoring peer address: {e}"));
                return;
            }
        };
        let key = addr.key();
        {
            let mut st = self.state.lock().unwrap();
            if st.node_ips.contains_key(&key)
                || st.pending.contains(&key)
                || st.self_addrs.contains(&key)
            {
                return;
            }
            st.pending.insert(key.clone());
        }

        let secret = self.config.auth.clone();
        let self_id = self.id.clone();
        let listen_port = self.listen_port();
        let mut cfg = WireClientConfig::new(addr.url(&self.config.path));
        cfg.token = TokenSource::Lazy(Arc::new(move || {
            token::create(
                &json!({ "port": listen_port }),
                &CreateOpts {
                    ttl: Some(PEER_TOKEN_TTL_MS),
                    secret: secret.clone(),
                    token_type: Some(TYPE_CLUSTER_PEER),
                    id: Some(self_id.clone()),
                    expire: None,
                },
            )
            .unwrap_or_default()
        }));
        let (client, mut events) = WireClient::new(cfg);

        if let Err(e) = client.connect().await {
            self.log.debug(format!("dial {key} failed: {e}"));
            client.destroy();
            self.state.lock().unwrap().pending.remove(&key);
            return;
        }

        // The remote's NodeInfo gates establishment.
        let info = tokio::time::timeout(NODE_INFO_TIMEOUT, async {
            while let Some(ev) = events.recv().await {
                match ev {
                    ClientEvent::Frame(f) if f.event == tags::NODE_INFO => return Some(f),
                    ClientEvent::Disconnected | ClientEvent::Destroyed => return None,
                    _ => {}
                }
            }
            None
        })
        .await;
        let frame = match info {
            Ok(Some(f)) => f,
            _ => {
                self.log
                    .debug(format!("no node info from {key} in time, dropping"));
                client.destroy();
                self.state.lock().unwrap().pending.remove(&key);
                return;
            }
        };

        let peer_id = frame
            .data
            .get("_i")
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(peer_id) = peer_id else {
            client.destroy();
            self.state.lock().unwrap().pending.remove(&key);
            return;
        };
        let channels: Vec<String> = frame
            .data
            .get("c")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        {
            let mut st = self.state.lock().unwrap();
            st.pending.remove(&key);
            if peer_id == self.id {
                // Discovery handed us our own address.
                st.self_addrs.insert(key);
                drop(st);
                client.destroy();
                return;
            }
            if st.nodes.contains_key(&peer_id) || st.node_ips.contains_key(&key) {
                // Loser by second arrival.
                drop(st);
                client.destroy();
                return;
            }

            let mut out = HubEventLog::new();
            for channel in &channels {
                st.hub.subscribe_node(&peer_id, channel, &mut out);
            }
            st.node_ips.insert(key.clone(), peer_id.clone());
            st.nodes.insert(
                peer_id.clone(),
                PeerLink {
                    sid: peer_id.clone(),
                    key: key.clone(),
                    url: format!("ws://{key}"),
                    conn_id: None,
                    conduit: PeerConduit::Outbound(client),
                },
            );
            self.metrics.peers_added.fetch_add(1, Ordering::Relaxed);
            self.route_hub_events(&mut st, out.take());
            self.log
                .info(format!("peer {peer_id} joined (outbound {key})"));
            self.notify(ClusterNotice::NodeAdd {
                sid: peer_id.clone(),
            });
            self.broadcast_node_state(&mut st);
            self.flip_ready(&mut st);
        }

        // Pump the rest of the session into the fabric.
        let me = self.arc();
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                match ev {
                    ClientEvent::Frame(frame) => {
                        let mut st = me.state.lock().unwrap();
                        me.gate_frame(
                            &mut st,
                            FrameSrc::Outbound {
                                sid: peer_id.clone(),
                            },
                            frame,
                        );
                    }
                    ClientEvent::Disconnected | ClientEvent::Destroyed => {
                        let mut st = me.state.lock().unwrap();
                        let current = st
                            .nodes
                            .get(&peer_id)
                            .is_some_and(|l| l.key == key && l.conn_id.is_none());
                        if current {
                            me.remove_peer_locked(&mut st, &peer_id);
                        }
                        break;
                    }
                    ClientEvent::Connected => {}
                }
            }
        });
    }

    // -- discovery -----------------------------------------------------------

    async fn run_discovery(&self) {
        if !self.config.discovery.has_sources() {
            return;
        }
        let mut candidates: Vec<String> = Vec::new();

        if let Some(service) = &self.config.discovery.service {
            match util::resolve_ipv4(service).await {
                Ok(ips) => {
                    candidates
                        .extend(ips.into_iter().map(|ip| format!("{ip}:{}", self.config.port)));
                }
                Err(e) => self.log.warn(format!("discovery service failed: {e}")),
            }
        }

        for entry in &self.config.discovery.nodes {
            candidates.push(entry.as_address());
        }

        if let Some(url) = &self.config.discovery.fetch {
            match util::fetch_json(url, reqwest::Method::GET, &[("id", self.id.as_str())], None).await {
                Ok(Value::Array(items)) => {
                    for item in &items {
                        if let Some(s) = item.as_str() {
                            candidates.push(s.to_string());
                        } else if let Some(ip) = item.get("ip").and_then(Value::as_str) {
                            match item.get("port").and_then(Value::as_u64) {
                                Some(p) => candidates.push(format!("{ip}:{p}")),
                                None => candidates.push(ip.to_string()),
                            }
                        }
                    }
                }
                Ok(_) => self.log.warn("discovery fetch returned a non-array"),
                Err(e) => self.log.warn(format!("discovery fetch failed: {e}")),
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        for raw in candidates {
            let Ok(addr) = PeerAddress::parse(&raw, self.config.port) else {
                self.log.trace(format!("skipping discovery entry {raw:?}"));
                continue;
            };
            if !seen.insert(addr.key()) {
                continue;
            }
            let me = self.arc();
            tokio::spawn(async move { me.add_node(&addr.key()).await });
        }
    }
}

async fn run_server_events(inner: Arc<ClusterInner>, mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
    loop {
        let event = tokio::select! {
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
            () = inner.cancel.cancelled() => break,
        };
        match event {
            ServerEvent::Listening { port } => {
                inner.log.debug(format!("accepting peers on port {port}"));
            }
            ServerEvent::Client(conn) => inner.admit_inbound(conn),
            ServerEvent::Event { conn, frame } => {
                let mut st = inner.state.lock().unwrap();
                inner.gate_frame(&mut st, FrameSrc::Inbound(conn), frame);
            }
            ServerEvent::Disconnect(conn) => inner.on_server_disconnect(conn),
            ServerEvent::Failed { remote, reason } => {
                inner
                    .log
                    .debug(format!("rejected connection from {remote}: {reason}"));
                inner.notify(ClusterNotice::AuthFailed { remote });
            }
        }
    }
}

/// Periodic re-discovery; armed once readiness is declared.
async fn discovery_ticker(inner: Arc<ClusterInner>) {
    let mut ready_rx = inner.ready_tx.subscribe();
    while !*ready_rx.borrow() {
        tokio::select! {
            changed = ready_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            () = inner.cancel.cancelled() => return,
        }
    }
    let period = Duration::from_millis(inner.config.discovery.timer.max(250));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = interval.tick() => inner.run_discovery().await,
            () = inner.cancel.cancelled() => return,
        }
    }
}

fn register_routes(inner: &Arc<ClusterInner>) {
    for path in ["/", "/ping"] {
        let weak = Arc::downgrade(inner);
        inner.server.add_handler(
            "GET",
            path,
            Box::new(move |_req| {
                let ready = weak
                    .upgrade()
                    .map(|i| i.state.lock().unwrap().ready)
                    .unwrap_or(false);
                Ok(if ready {
                    HttpResponse::text(200, "Ready")
                } else {
                    HttpResponse::text(503, "Service Unavailable")
                })
            }),
        );
    }
    for path in ["/_status", "/health"] {
        let weak = Arc::downgrade(inner);
        inner.server.add_handler(
            "GET",
            path,
            Box::new(move |_req| {
                let Some(inner) = weak.upgrade() else {
                    return Ok(HttpResponse::text(503, "Service Unavailable"));
                };
                let st = inner.state.lock().unwrap();
                let nodes: Vec<Value> = st
                    .nodes
                    .values()
                    .map(|l| json!({"url": l.url, "sid": l.sid}))
                    .collect();
                let body = json!({
                    "ready": st.ready,
                    "nodes": nodes,
                    "channels": st.hub.channels(),
                    "metrics": inner.metrics.snapshot(),
                });
                Ok(HttpResponse::json(200, &body))
            }),
        );
    }
}

fn payload_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(port: u16) -> ClusterConfig {
        ClusterConfig {
            port,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn singleton_publish_matches_after_self_subscribe() {
        let cluster = Cluster::start(local_config(0)).await.unwrap();
        let mut notices = cluster.take_notices().unwrap();
        assert!(cluster.is_ready());

        assert!(!cluster.publish("ch", "hi"));

        cluster.subscribe("ch");
        assert!(cluster.publish("ch", "hi"));
        // The observability emit fires for the originating node.
        loop {
            match notices.recv().await.unwrap() {
                ClusterNotice::ChannelMessage { channel, msg } => {
                    assert_eq!(channel, "ch");
                    assert_eq!(msg, "hi");
                    break;
                }
                _ => continue,
            }
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn readiness_without_sources_is_immediate_and_monotonic() {
        let cluster = Cluster::start(local_config(0)).await.unwrap();
        let mut notices = cluster.take_notices().unwrap();
        assert!(cluster.is_ready());
        assert!(matches!(notices.recv().await, Some(ClusterNotice::Ready)));
        cluster.shutdown().await;
        // No second Ready on the stream.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(n) = notices.try_recv() {
            assert!(!matches!(n, ClusterNotice::Ready));
        }
    }

    #[tokio::test]
    async fn local_client_delivery_and_contract_queries() {
        let cluster = Cluster::start(local_config(0)).await.unwrap();
        let mut notices = cluster.take_notices().unwrap();

        cluster.subscribe_client("c9", "room");
        assert!(cluster.is_client_subscribed("c9", "room"));
        assert!(cluster.publish("room", "hello"));
        loop {
            match notices.recv().await.unwrap() {
                ClusterNotice::ClientMessage { channel, cid, msg } => {
                    assert_eq!((channel.as_str(), cid.as_str(), msg.as_str()), ("room", "c9", "hello"));
                    break;
                }
                _ => continue,
            }
        }

        cluster.disconnect_client("c9");
        assert!(!cluster.is_client_subscribed("c9", "room"));
        assert!(cluster.channels().is_empty());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn publish_value_stringifies_once() {
        let cluster = Cluster::start(local_config(0)).await.unwrap();
        let mut notices = cluster.take_notices().unwrap();
        cluster.subscribe_client("c1", "j");
        assert!(cluster.publish_value("j", &json!({"a": [1, 2]})));
        loop {
            match notices.recv().await.unwrap() {
                ClusterNotice::ClientMessage { msg, .. } => {
                    assert_eq!(msg, r#"{"a":[1,2]}"#);
                    break;
                }
                _ => continue,
            }
        }
        cluster.shutdown().await;
    }

    #[test]
    fn authorizer_stashes_peer_and_publisher_attrs() {
        let auth = ClusterAuthorizer {
            secret: Some("s3cret".into()),
            log: Logger::new("test"),
        };
        let peer_token = token::create(
            &json!({ "port": 23033 }),
            &CreateOpts {
                secret: Some("s3cret".into()),
                token_type: Some(TYPE_CLUSTER_PEER),
                id: Some("quty-1-aa110001".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let req = |token: &str| UpgradeRequest {
            path: "/".into(),
            query: [("token".to_string(), token.to_string())].into_iter().collect(),
            remote: "10.0.0.9".into(),
        };

        let attrs = auth.authorize(&req(&peer_token)).unwrap();
        assert_eq!(attrs.peer_id.as_deref(), Some("quty-1-aa110001"));
        assert_eq!(attrs.data["port"], 23033);

        let pub_token = token::create(
            &json!({}),
            &CreateOpts {
                secret: Some("s3cret".into()),
                token_type: Some(TYPE_PUBLISHER),
                ..Default::default()
            },
        )
        .unwrap();
        let attrs = auth.authorize(&req(&pub_token)).unwrap();
        assert!(attrs.peer_id.is_none());
        assert!(attrs.publisher_id.is_some());

        // Wrong secret, wrong type, or no token at all: rejected.
        let bad = token::create(
            &json!({}),
            &CreateOpts {
                secret: Some("other".into()),
                token_type: Some(TYPE_CLUSTER_PEER),
                id: Some("x".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(auth.authorize(&req(&bad)).is_none());
        let untyped = token::create(&json!({}), &CreateOpts {
            secret: Some("s3cret".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(auth.authorize(&req(&untyped)).is_none());
    }
}
