// Wire frame codec. Frames are WebSocket text payloads of the shape
// `"<event>|<body>"`: the event tag is short ASCII without `|`, the body is
// empty, a raw string, or a JSON object/array. Object bodies get a
// process-monotonic `_q` sequence number spliced in on encode and stripped
// back out into `Frame::seq` on decode (advisory, used for tracing).

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::WireError;

pub mod client;
pub mod server;

/// Gossip event tags.
pub mod tags {
    /// Identity + initial subscriptions, first frame on a peer connection.
    pub const NODE_INFO: &str = "I";
    /// Membership + channel-set broadcast.
    pub const NODE_STATE: &str = "S";
    pub const CHANNEL_JOIN: &str = "J";
    pub const CHANNEL_LEAVE: &str = "L";
    pub const CHANNEL_MESSAGE: &str = "M";
    pub const CLIENT_KICK: &str = "CK";
    pub const CLIENT_UNSUBSCRIBE: &str = "CU";
}

static SEND_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: String,
    /// `_q` of object payloads, stripped by the decoder.
    pub seq: Option<u64>,
    pub data: Value,
}

pub fn encode(event: &str, data: &Value) -> String {
    let body = match data {
        Value::Null => String::new(),
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert(
                "_q".to_string(),
                Value::from(SEND_SEQ.fetch_add(1, Ordering::Relaxed)),
            );
            Value::Object(map).to_string()
        }
        Value::Array(_) => data.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    format!("{event}|{body}")
}

/// Split on the first `|` only. `{`/`[`-led bodies must parse as JSON;
/// anything else is a raw string. Empty bodies decode to the empty string.
pub fn decode(raw: &str) -> Result<Frame, WireError> {
    let (event, body) = raw.split_once('|').ok_or(WireError::Malformed)?;
    if event.is_empty() {
        return Err(WireError::Malformed);
    }
    let mut seq = None;
    let data = if body.starts_with('{') || body.starts_with('[') {
        let mut value: Value = serde_json::from_str(body).map_err(|_| WireError::Malformed)?;
        if let Value::Object(map) = &mut value {
            seq = map.remove("_q").and_then(|q| q.as_u64());
        }
        value
    } else {
        Value::String(body.to_string())
    };
    Ok(Frame {
        event: event.to_string(),
        seq,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_string_and_empty() {
        let f = decode(&encode("M", &json!("hello world"))).unwrap();
        assert_eq!(f.event, "M");
        assert_eq!(f.data, json!("hello world"));
        assert_eq!(f.seq, None);

        let f = decode(&encode("ping", &Value::Null)).unwrap();
        assert_eq!(f.data, json!(""));
    }

    #[test]
    fn roundtrip_object_strips_seq() {
        let payload = json!({"c": "room", "s": "quty-1-ab120042", "m": "hi"});
        let f = decode(&encode("M", &payload)).unwrap();
        assert_eq!(f.data, payload);
        assert!(f.seq.is_some());
    }

    #[test]
    fn seq_is_monotonic_per_process() {
        let a = decode(&encode("M", &json!({}))).unwrap().seq.unwrap();
        let b = decode(&encode("M", &json!({}))).unwrap().seq.unwrap();
        assert!(b > a);
    }

    #[test]
    fn roundtrip_array() {
        let payload = json!([1, "two", {"three": 3}]);
        let f = decode(&encode("S", &payload)).unwrap();
        assert_eq!(f.data, payload);
        assert_eq!(f.seq, None);
    }

    #[test]
    fn splits_on_first_pipe_only() {
        let f = decode("M|a|b|c").unwrap();
        assert_eq!(f.event, "M");
        assert_eq!(f.data, json!("a|b|c"));
    }

    #[test]
    fn rejects_malformed() {
        assert!(decode("no-pipe-here").is_err());
        assert!(decode("|empty-event").is_err());
        assert!(decode("M|{not json").is_err());
        assert!(decode("M|[1,2").is_err());
    }
}
