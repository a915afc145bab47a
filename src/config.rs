use serde::Deserialize;

use crate::error::ClusterError;

pub const DEFAULT_NAMESPACE: &str = "quty";
pub const DEFAULT_PORT: u16 = 23032;
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_DISCOVERY_TIMER_MS: u64 = 3000;
pub const DEFAULT_MAX_READY_AFTER_MS: u64 = 5000;

/// One entry of the static discovery list. Tolerates `"ip"`, `"ip:port"`
/// and `{ip, port}` forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeEntry {
    Addr(String),
    Host { ip: String, port: Option<u16> },
}

impl NodeEntry {
    pub fn as_address(&self) -> String {
        match self {
            Self::Addr(s) => s.clone(),
            Self::Host { ip, port } => match port {
                Some(p) => format!("{ip}:{p}"),
                None => ip.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// DNS name resolved to the IPv4 set of the peer deployment.
    pub service: Option<String>,
    /// Static peer list.
    pub nodes: Vec<NodeEntry>,
    /// URL returning a JSON array of peer addresses; queried with `?id=<selfId>`.
    pub fetch: Option<String>,
    /// Discovery ticker period, milliseconds.
    pub timer: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service: None,
            nodes: Vec::new(),
            fetch: None,
            timer: DEFAULT_DISCOVERY_TIMER_MS,
        }
    }
}

impl DiscoveryConfig {
    pub fn has_sources(&self) -> bool {
        self.service.is_some() || !self.nodes.is_empty() || self.fetch.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    /// Cluster listen port. 0 binds an ephemeral port (the bound port is
    /// what gets declared to peers).
    pub port: u16,
    /// WebSocket upgrade path.
    pub path: String,
    /// HMAC secret for peer/publisher tokens. None disables signing.
    pub auth: Option<String>,
    pub discovery: DiscoveryConfig,
    /// Force readiness after this many milliseconds even when no peer
    /// answered. 0 means don't wait at all.
    pub max_ready_after: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            auth: None,
            discovery: DiscoveryConfig::default(),
            max_ready_after: DEFAULT_MAX_READY_AFTER_MS,
        }
    }
}

impl ClusterConfig {
    /// Defaults overridden by the `CLUSTER_*` environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn apply_env(&mut self) {
        if let Some(ns) = env_nonempty("CLUSTER_NAMESPACE") {
            self.namespace = ns;
        }
        if let Some(port) = env_nonempty("CLUSTER_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }
        if let Some(auth) = env_nonempty("CLUSTER_AUTH") {
            self.auth = Some(auth);
        }
        if let Some(nodes) = env_nonempty("CLUSTER_DISCOVERY_NODES") {
            self.discovery.nodes = nodes
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(|s| NodeEntry::Addr(s.to_string()))
                .collect();
        }
        if let Some(service) = env_nonempty("CLUSTER_DISCOVERY_SERVICE") {
            self.discovery.service = Some(service);
        }
        if let Some(fetch) = env_nonempty("CLUSTER_DISCOVERY_FETCH") {
            self.discovery.fetch = Some(fetch);
        }
    }

    /// Fail-fast construction checks.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.namespace.is_empty() {
            return Err(ClusterError::Config("namespace must not be empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(ClusterError::Config(format!(
                "path must start with '/', got {:?}",
                self.path
            )));
        }
        if let Some(url) = &self.discovery.fetch {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ClusterError::Config(format!(
                    "discovery.fetch must be an http(s) url, got {url:?}"
                )));
            }
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.namespace, "quty");
        assert_eq!(cfg.path, "/");
        assert_eq!(cfg.discovery.timer, 3000);
        assert_eq!(cfg.max_ready_after, 5000);
        assert!(!cfg.discovery.has_sources());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_path_and_fetch() {
        let mut cfg = ClusterConfig::default();
        cfg.path = "peers".into();
        assert!(cfg.validate().is_err());

        let mut cfg = ClusterConfig::default();
        cfg.discovery.fetch = Some("ftp://example/peers".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_entry_forms_normalize() {
        let e: NodeEntry = serde_json::from_str(r#""10.0.0.1:9000""#).unwrap();
        assert_eq!(e.as_address(), "10.0.0.1:9000");
        let e: NodeEntry = serde_json::from_str(r#"{"ip":"10.0.0.2","port":9001}"#).unwrap();
        assert_eq!(e.as_address(), "10.0.0.2:9001");
        let e: NodeEntry = serde_json::from_str(r#"{"ip":"10.0.0.3"}"#).unwrap();
        assert_eq!(e.as_address(), "10.0.0.3");
    }

    #[test]
    fn discovery_nodes_env_splits_on_commas_and_spaces() {
        let mut cfg = ClusterConfig::default();
        std::env::set_var("CLUSTER_DISCOVERY_NODES", "10.0.0.1:9000, 10.0.0.2 10.0.0.3:9002");
        cfg.apply_env();
        std::env::remove_var("CLUSTER_DISCOVERY_NODES");
        let addrs: Vec<String> = cfg.discovery.nodes.iter().map(|n| n.as_address()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:9000", "10.0.0.2", "10.0.0.3:9002"]);
    }
}
