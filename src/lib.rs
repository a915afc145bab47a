//! quty: a clustered publish/subscribe message bus.
//!
//! Independent nodes form a full-mesh overlay over WebSocket, gossip their
//! channel subscriptions, and route each publication to the minimal set of
//! peers plus locally attached client sessions. The crate covers the
//! cluster fabric: peer discovery, authenticated node-to-node sessions, the
//! in-memory subscription registry ([`ChannelHub`]), and the loop-free
//! publication router ([`Cluster`]). The public-facing client engine (the
//! local Hub) is an external collaborator fed through [`ClusterNotice`].

pub mod cluster;
pub mod config;
pub mod error;
pub mod hub;
pub mod logger;
pub mod token;
pub mod util;
pub mod wire;

pub use cluster::{Cluster, ClusterNotice, PeerInfo};
pub use config::{ClusterConfig, DiscoveryConfig, NodeEntry};
pub use error::{ClusterError, TokenError, UtilError, WireError};
pub use hub::{ChannelHub, HubEvent, HubEventLog, HubObserver, PublishOpts};
pub use logger::{Level, Logger};
pub use wire::client::{ClientEvent, TokenSource, WireClient, WireClientConfig};
pub use wire::server::{
    Authorizer, ConnAttrs, HttpRequest, HttpResponse, ServerConfig, ServerConn, ServerEvent,
    UpgradeRequest, WireServer,
};
pub use wire::Frame;
