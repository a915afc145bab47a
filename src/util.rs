// Small shared helpers: id generation, hostname resolution, JSON-over-HTTP
// fetch with a hard timeout, and peer address normalization.

use std::net::Ipv4Addr;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;

use crate::error::UtilError;

const ID_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub(crate) const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// `n` characters from the 62-char alphanumeric alphabet, backed by the OS
/// RNG. Fails loud when the random source is unavailable.
pub fn random_id(n: usize) -> Result<String, UtilError> {
    let mut bytes = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| UtilError::RngUnavailable(e.to_string()))?;
    Ok(bytes
        .iter()
        .map(|b| ID_ALPHABET[(*b as usize) % ID_ALPHABET.len()] as char)
        .collect())
}

/// Node identity: `<namespace>-1-<4 hex chars><last 4 digits of unix millis>`.
/// Stable for the process lifetime, regenerated on restart.
pub fn node_id(namespace: &str) -> Result<String, UtilError> {
    let mut bytes = [0u8; 2];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| UtilError::RngUnavailable(e.to_string()))?;
    let millis = chrono::Utc::now().timestamp_millis();
    Ok(format!(
        "{namespace}-1-{:02x}{:02x}{:04}",
        bytes[0],
        bytes[1],
        millis.rem_euclid(10_000)
    ))
}

/// Resolve `host` to its deduplicated IPv4 set. AAAA records are discarded.
pub async fn resolve_ipv4(host: &str) -> Result<Vec<Ipv4Addr>, UtilError> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| UtilError::ResolveFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    let mut out: Vec<Ipv4Addr> = Vec::new();
    for addr in addrs {
        if let std::net::IpAddr::V4(ip) = addr.ip() {
            if !out.contains(&ip) {
                out.push(ip);
            }
        }
    }
    if out.is_empty() {
        return Err(UtilError::ResolveFailed {
            host: host.to_string(),
            reason: "no A records".to_string(),
        });
    }
    Ok(out)
}

/// One HTTP(S) request; accepts only 2xx with a `*/json` content type and
/// parses the body as JSON.
pub async fn fetch_json(
    url: &str,
    method: reqwest::Method,
    query: &[(&str, &str)],
    body: Option<&Value>,
) -> Result<Value, UtilError> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| UtilError::FetchFailed(e.to_string()))?;
    let mut req = client.request(method, url).query(query);
    if let Some(body) = body {
        req = req.json(body);
    }
    let resp = req
        .send()
        .await
        .map_err(|e| UtilError::FetchFailed(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(UtilError::FetchStatus(status.as_u16()));
    }
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("/json"));
    if !is_json {
        return Err(UtilError::FetchNotJson);
    }
    resp.json::<Value>()
        .await
        .map_err(|e| UtilError::FetchFailed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Peer addresses
// ---------------------------------------------------------------------------

/// Normalized peer address. Canonical key is `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub proto: String,
    pub ip: String,
    pub port: u16,
}

impl PeerAddress {
    /// Accepts `"ip"`, `"ip:port"`, `"ws://ip:port"` and `"wss://ip:port"`.
    /// A missing port falls back to `default_port`.
    pub fn parse(raw: &str, default_port: u16) -> Result<Self, UtilError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UtilError::BadAddress(raw.to_string()));
        }
        let (proto, rest) = match raw.split_once("://") {
            Some((p, rest)) if p == "ws" || p == "wss" => (p.to_string(), rest),
            Some(_) => return Err(UtilError::BadAddress(raw.to_string())),
            None => ("ws".to_string(), raw),
        };
        let rest = rest.split('/').next().unwrap_or(rest);
        let (ip, port) = match rest.rsplit_once(':') {
            Some((ip, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| UtilError::BadAddress(raw.to_string()))?;
                (ip, port)
            }
            None => (rest, default_port),
        };
        if ip.is_empty() {
            return Err(UtilError::BadAddress(raw.to_string()));
        }
        Ok(Self {
            proto,
            ip: ip.to_string(),
            port,
        })
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Dial URL for the cluster upgrade path.
    pub fn url(&self, path: &str) -> String {
        format!("{}://{}:{}{}", self.proto, self.ip, self.port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_uses_the_fixed_alphabet() {
        let id = random_id(64).unwrap();
        assert_eq!(id.len(), 64);
        assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
        // Two draws colliding over 64 chars would mean the RNG is broken.
        assert_ne!(id, random_id(64).unwrap());
    }

    #[test]
    fn node_id_shape() {
        let id = node_id("quty").unwrap();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "quty");
        assert_eq!(parts[1], "1");
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2][..4].bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(parts[2][4..].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn peer_address_forms() {
        let a = PeerAddress::parse("10.0.0.1:9000", 23032).unwrap();
        assert_eq!(a.key(), "10.0.0.1:9000");
        assert_eq!(a.url("/"), "ws://10.0.0.1:9000/");

        let a = PeerAddress::parse("10.0.0.1", 23032).unwrap();
        assert_eq!(a.key(), "10.0.0.1:23032");

        let a = PeerAddress::parse("wss://10.0.0.1:9000/cluster", 23032).unwrap();
        assert_eq!(a.proto, "wss");
        assert_eq!(a.key(), "10.0.0.1:9000");

        assert!(PeerAddress::parse("", 23032).is_err());
        assert!(PeerAddress::parse("http://10.0.0.1", 23032).is_err());
        assert!(PeerAddress::parse("10.0.0.1:notaport", 23032).is_err());
    }

    #[tokio::test]
    async fn resolve_ipv4_localhost() {
        let ips = resolve_ipv4("localhost").await.unwrap();
        assert!(ips.contains(&Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn resolve_ipv4_rejects_unknown_host() {
        assert!(resolve_ipv4("definitely-not-a-host.invalid").await.is_err());
    }
}
