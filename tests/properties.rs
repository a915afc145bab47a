// Property-based suite for the pure pieces: hub registry invariants, token
// envelope round-trips (including bit-flip rejection) and the wire frame
// codec.

use proptest::prelude::*;
use quty::hub::{ChannelHub, HubEvent, HubEventLog, PublishOpts};
use quty::token::{self, CreateOpts, VerifyOpts, TYPE_CLUSTER_PEER};
use quty::wire::{decode, encode};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// ChannelHub
// ---------------------------------------------------------------------------

const OWNER: &str = "self";

/// Operations the fabric actually drives: remote nodes come and go through
/// gossip, local clients through the hub contract (owner node implied).
#[derive(Debug, Clone)]
enum HubOp {
    SubNode(u8, u8),
    UnsubNode(u8, u8),
    SubClient(u8, u8),
    UnsubClient(u8, u8),
    RemoveNode(u8),
    RemoveClient(u8),
    RemoveChannel(u8),
}

fn node(v: u8) -> String {
    format!("n{}", v % 4)
}

fn client(v: u8) -> String {
    format!("c{}", v % 4)
}

fn channel(v: u8) -> String {
    format!("ch{}", v % 4)
}

fn hub_op_strategy() -> impl Strategy<Value = HubOp> {
    prop_oneof![
        (any::<u8>(), any::<u8>()).prop_map(|(a, b)| HubOp::SubNode(a, b)),
        (any::<u8>(), any::<u8>()).prop_map(|(a, b)| HubOp::UnsubNode(a, b)),
        (any::<u8>(), any::<u8>()).prop_map(|(a, b)| HubOp::SubClient(a, b)),
        (any::<u8>(), any::<u8>()).prop_map(|(a, b)| HubOp::UnsubClient(a, b)),
        any::<u8>().prop_map(HubOp::RemoveNode),
        any::<u8>().prop_map(HubOp::RemoveClient),
        any::<u8>().prop_map(HubOp::RemoveChannel),
    ]
}

fn apply(hub: &mut ChannelHub, op: &HubOp, obs: &mut HubEventLog) {
    match op {
        HubOp::SubNode(n, c) => hub.subscribe_node(&node(*n), &channel(*c), obs),
        HubOp::UnsubNode(n, c) => hub.unsubscribe_node(&node(*n), &channel(*c), obs),
        HubOp::SubClient(cl, c) => hub.subscribe_client(OWNER, &client(*cl), &channel(*c), obs),
        HubOp::UnsubClient(cl, c) => hub.unsubscribe_client(&client(*cl), &channel(*c), obs),
        HubOp::RemoveNode(n) => hub.remove_node(&node(*n), obs),
        HubOp::RemoveClient(cl) => hub.remove_client(&client(*cl), obs),
        HubOp::RemoveChannel(c) => hub.remove_channel(&channel(*c), obs),
    }
}

#[test]
fn prop_hub_invariants_hold_for_all_op_sequences() {
    proptest!(|(ops in proptest::collection::vec(hub_op_strategy(), 1..60))| {
        let mut hub = ChannelHub::new();
        let mut obs = HubEventLog::new();
        for op in &ops {
            apply(&mut hub, op, &mut obs);

            // A channel key exists iff it has subscribers.
            for c in hub.channels() {
                let nodes = hub.node_subscribers(&c);
                let clients = hub.client_subscribers(&c);
                prop_assert!(
                    !nodes.is_empty() || !clients.is_empty(),
                    "channel {c} exists without subscribers"
                );
                // A live client subscription implies the owner node's.
                if !clients.is_empty() {
                    prop_assert!(
                        hub.is_node_subscribed(OWNER, &c),
                        "clients of {c} without the owning node"
                    );
                }
            }
        }
    });
}

#[test]
fn prop_subscribe_node_is_idempotent() {
    proptest!(|(n in any::<u8>(), c in any::<u8>(), repeats in 2usize..5)| {
        let mut hub = ChannelHub::new();
        let mut obs = HubEventLog::new();
        for _ in 0..repeats {
            hub.subscribe_node(&node(n), &channel(c), &mut obs);
        }
        let joins = obs
            .events()
            .iter()
            .filter(|e| matches!(e, HubEvent::NodeJoined { .. }))
            .count();
        prop_assert_eq!(joins, 1);
    });
}

#[test]
fn prop_removing_last_subscriber_emits_one_channel_remove() {
    proptest!(|(nodes in proptest::collection::hash_set(any::<u8>(), 1..4),
                clients in proptest::collection::hash_set(any::<u8>(), 0..4))| {
        let mut hub = ChannelHub::new();
        let mut obs = HubEventLog::new();
        for n in &nodes {
            hub.subscribe_node(&node(*n), "ch0", &mut obs);
        }
        for cl in &clients {
            hub.subscribe_client(OWNER, &client(*cl), "ch0", &mut obs);
        }

        let mut obs = HubEventLog::new();
        hub.remove_channel("ch0", &mut obs);
        let removes = obs
            .events()
            .iter()
            .filter(|e| matches!(e, HubEvent::ChannelRemoved(c) if c == "ch0"))
            .count();
        prop_assert_eq!(removes, 1);
        prop_assert!(hub.channels().is_empty());
        prop_assert!(hub.node_subscribers("ch0").is_empty());
        prop_assert!(hub.client_subscribers("ch0").is_empty());
    });
}

#[test]
fn prop_publish_matches_iff_channel_known() {
    proptest!(|(subscribe in any::<bool>(), skip in any::<bool>())| {
        let mut hub = ChannelHub::new();
        let mut obs = HubEventLog::new();
        if subscribe {
            hub.subscribe_node("n1", "ch0", &mut obs);
        }
        let opts = PublishOpts { skip_nodes: false, skip_broadcast: skip };
        let mut obs = HubEventLog::new();
        let matched = hub.publish("ch0", "m", None, opts, &mut obs);
        prop_assert_eq!(matched, subscribe);
        let broadcasts = obs
            .events()
            .iter()
            .filter(|e| matches!(e, HubEvent::NodeBroadcast { .. }))
            .count();
        prop_assert_eq!(broadcasts, usize::from(!subscribe && !skip));
    });
}

// ---------------------------------------------------------------------------
// Token envelope
// ---------------------------------------------------------------------------

fn claim_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}"
}

fn claim_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[ -~]{0,16}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn claims() -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map(claim_key(), claim_value(), 0..5)
        .prop_map(|m| m.into_iter().collect())
}

#[test]
fn prop_token_roundtrip() {
    proptest!(|(data in claims(), secret in "[a-zA-Z0-9]{8,24}")| {
        let data = Value::Object(data);
        let create = CreateOpts {
            secret: Some(secret.clone()),
            token_type: Some(TYPE_CLUSTER_PEER),
            id: Some("quty-1-ab120042".to_string()),
            ttl: Some(60_000),
            expire: None,
        };
        let verify = VerifyOpts {
            secret: Some(secret),
            token_type: Some(TYPE_CLUSTER_PEER),
        };
        let tok = token::create(&data, &create).unwrap();
        let decoded = token::verify(&tok, &verify).unwrap();
        prop_assert_eq!(decoded.data, data);
        prop_assert_eq!(decoded.issuer.as_deref(), Some("quty-1-ab120042"));
    });
}

#[test]
fn prop_any_bit_flip_is_rejected() {
    proptest!(|(data in claims(), secret in "[a-zA-Z0-9]{8,24}",
                byte_pos in any::<prop::sample::Index>(), bit in 0u8..8)| {
        let data = Value::Object(data);
        let create = CreateOpts {
            secret: Some(secret.clone()),
            token_type: Some(TYPE_CLUSTER_PEER),
            id: None,
            ttl: None,
            expire: None,
        };
        let verify = VerifyOpts {
            secret: Some(secret),
            token_type: Some(TYPE_CLUSTER_PEER),
        };
        let tok = token::create(&data, &create).unwrap();
        let mut bytes = tok.clone().into_bytes();
        let pos = byte_pos.index(bytes.len());
        bytes[pos] ^= 1 << bit;
        // The flip may leave the ASCII plane; both paths must reject.
        match String::from_utf8(bytes) {
            Ok(flipped) => prop_assert!(token::verify(&flipped, &verify).is_err()),
            Err(_) => {}
        }
    });
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

fn event_tag() -> impl Strategy<Value = String> {
    "[A-Za-z]{1,3}"
}

fn raw_body() -> impl Strategy<Value = String> {
    // Raw strings: anything printable that the decoder won't mistake for a
    // JSON object or array.
    "[ -~]{0,32}".prop_filter("not json-led", |s| {
        !s.starts_with('{') && !s.starts_with('[')
    })
}

#[test]
fn prop_frame_roundtrip_strings() {
    proptest!(|(event in event_tag(), body in raw_body())| {
        let frame = decode(&encode(&event, &json!(body))).unwrap();
        prop_assert_eq!(frame.event, event);
        prop_assert_eq!(frame.data, json!(body));
    });
}

#[test]
fn prop_frame_roundtrip_objects() {
    proptest!(|(event in event_tag(), data in claims())| {
        let data = Value::Object(data);
        let frame = decode(&encode(&event, &data)).unwrap();
        prop_assert_eq!(frame.event, event);
        prop_assert_eq!(frame.data, data);
        prop_assert!(frame.seq.is_some());
    });
}

#[test]
fn prop_frame_roundtrip_arrays() {
    proptest!(|(event in event_tag(),
                items in proptest::collection::vec(claim_value(), 0..6))| {
        let data = Value::Array(items);
        let frame = decode(&encode(&event, &data)).unwrap();
        prop_assert_eq!(frame.event, event);
        prop_assert_eq!(frame.data, data);
    });
}
