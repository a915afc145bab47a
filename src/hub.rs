// ChannelHub: the in-memory subscription registry. Pure data structure --
// no I/O, no locking, no async. Every mutation reports its fan-out through
// an explicit `HubObserver` sink so the caller decides what a `node.message`
// or `channel.remove` turns into (peer sends, local deliveries, nothing).
//
// Invariants:
//   - a channel key exists iff its subscriber set is non-empty
//   - client subscriptions live only on the node that owns the client
//   - a client subscription implies the owning node's subscription

use ahash::{AHashMap, AHashSet};

/// Explicit fan-out sink. Method-per-event; default bodies ignore, so
/// observers implement only what they route.
pub trait HubObserver {
    fn channel_added(&mut self, _channel: &str) {}
    fn channel_removed(&mut self, _channel: &str) {}
    fn node_joined(&mut self, _channel: &str, _sid: &str) {}
    fn node_left(&mut self, _channel: &str, _sid: &str) {}
    fn client_joined(&mut self, _channel: &str, _cid: &str) {}
    fn client_left(&mut self, _channel: &str, _cid: &str) {}
    fn node_message(&mut self, _channel: &str, _sid: &str, _msg: &str) {}
    fn node_broadcast(&mut self, _channel: &str, _msg: &str) {}
    fn client_message(&mut self, _channel: &str, _cid: &str, _msg: &str) {}
    fn channel_message(&mut self, _channel: &str, _msg: &str) {}
}

/// Recorded hub event, for observers that buffer and route later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    ChannelAdded(String),
    ChannelRemoved(String),
    NodeJoined { channel: String, sid: String },
    NodeLeft { channel: String, sid: String },
    ClientJoined { channel: String, cid: String },
    ClientLeft { channel: String, cid: String },
    NodeMessage { channel: String, sid: String, msg: String },
    NodeBroadcast { channel: String, msg: String },
    ClientMessage { channel: String, cid: String, msg: String },
    ChannelMessage { channel: String, msg: String },
}

/// Vec-backed observer. The fabric runs every hub mutation through one of
/// these and routes the drained events afterwards.
#[derive(Debug, Default)]
pub struct HubEventLog {
    events: Vec<HubEvent>,
}

impl HubEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(self) -> Vec<HubEvent> {
        self.events
    }

    pub fn events(&self) -> &[HubEvent] {
        &self.events
    }
}

impl HubObserver for HubEventLog {
    fn channel_added(&mut self, channel: &str) {
        self.events.push(HubEvent::ChannelAdded(channel.into()));
    }
    fn channel_removed(&mut self, channel: &str) {
        self.events.push(HubEvent::ChannelRemoved(channel.into()));
    }
    fn node_joined(&mut self, channel: &str, sid: &str) {
        self.events.push(HubEvent::NodeJoined {
            channel: channel.into(),
            sid: sid.into(),
        });
    }
    fn node_left(&mut self, channel: &str, sid: &str) {
        self.events.push(HubEvent::NodeLeft {
            channel: channel.into(),
            sid: sid.into(),
        });
    }
    fn client_joined(&mut self, channel: &str, cid: &str) {
        self.events.push(HubEvent::ClientJoined {
            channel: channel.into(),
            cid: cid.into(),
        });
    }
    fn client_left(&mut self, channel: &str, cid: &str) {
        self.events.push(HubEvent::ClientLeft {
            channel: channel.into(),
            cid: cid.into(),
        });
    }
    fn node_message(&mut self, channel: &str, sid: &str, msg: &str) {
        self.events.push(HubEvent::NodeMessage {
            channel: channel.into(),
            sid: sid.into(),
            msg: msg.into(),
        });
    }
    fn node_broadcast(&mut self, channel: &str, msg: &str) {
        self.events.push(HubEvent::NodeBroadcast {
            channel: channel.into(),
            msg: msg.into(),
        });
    }
    fn client_message(&mut self, channel: &str, cid: &str, msg: &str) {
        self.events.push(HubEvent::ClientMessage {
            channel: channel.into(),
            cid: cid.into(),
            msg: msg.into(),
        });
    }
    fn channel_message(&mut self, channel: &str, msg: &str) {
        self.events.push(HubEvent::ChannelMessage {
            channel: channel.into(),
            msg: msg.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOpts {
    /// Don't emit per-node deliveries (set for peer-received messages).
    pub skip_nodes: bool,
    /// Don't fall back to a broadcast when the channel is unknown.
    pub skip_broadcast: bool,
}

#[derive(Debug, Default)]
pub struct ChannelHub {
    node_channels: AHashMap<String, AHashSet<String>>,
    client_channels: AHashMap<String, AHashSet<String>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Emits `channel.add` on the first subscriber of the
    /// channel, then `node.join` iff the node was absent.
    pub fn subscribe_node(&mut self, sid: &str, channel: &str, obs: &mut dyn HubObserver) {
        if !self.node_channels.contains_key(channel) {
            obs.channel_added(channel);
        }
        let set = self.node_channels.entry(channel.to_string()).or_default();
        if set.insert(sid.to_string()) {
            obs.node_joined(channel, sid);
        }
    }

    /// Idempotent. `channel.remove` fires when the last node subscriber
    /// leaves and no client subscribers remain.
    pub fn unsubscribe_node(&mut self, sid: &str, channel: &str, obs: &mut dyn HubObserver) {
        let Some(set) = self.node_channels.get_mut(channel) else {
            return;
        };
        if !set.remove(sid) {
            return;
        }
        obs.node_left(channel, sid);
        if set.is_empty() {
            self.node_channels.remove(channel);
            let clients_left = self
                .client_channels
                .get(channel)
                .is_some_and(|c| !c.is_empty());
            if !clients_left {
                self.client_channels.remove(channel);
                obs.channel_removed(channel);
            }
        }
    }

    /// Subscribes the owning node first, then the client.
    pub fn subscribe_client(
        &mut self,
        sid: &str,
        cid: &str,
        channel: &str,
        obs: &mut dyn HubObserver,
    ) {
        self.subscribe_node(sid, channel, obs);
        let set = self.client_channels.entry(channel.to_string()).or_default();
        if set.insert(cid.to_string()) {
            obs.client_joined(channel, cid);
        }
    }

    /// When the last client subscriber leaves, the whole channel is torn
    /// down (node subscribers included).
    pub fn unsubscribe_client(&mut self, cid: &str, channel: &str, obs: &mut dyn HubObserver) {
        let Some(set) = self.client_channels.get_mut(channel) else {
            return;
        };
        if !set.remove(cid) {
            return;
        }
        obs.client_left(channel, cid);
        if set.is_empty() {
            self.client_channels.remove(channel);
            self.remove_channel(channel, obs);
        }
    }

    /// Unsubscribes every current subscriber, driving the emit cascade.
    /// Re-reads the live sets each step: listeners of the emitted events may
    /// remove further subscribers while the walk is in progress.
    pub fn remove_channel(&mut self, channel: &str, obs: &mut dyn HubObserver) {
        loop {
            let Some(cid) = self
                .client_channels
                .get(channel)
                .and_then(|s| s.iter().next().cloned())
            else {
                break;
            };
            self.unsubscribe_client(&cid, channel, obs);
        }
        loop {
            let Some(sid) = self
                .node_channels
                .get(channel)
                .and_then(|s| s.iter().next().cloned())
            else {
                break;
            };
            self.unsubscribe_node(&sid, channel, obs);
        }
    }

    pub fn remove_node(&mut self, sid: &str, obs: &mut dyn HubObserver) {
        let channels: Vec<String> = self
            .node_channels
            .iter()
            .filter(|(_, set)| set.contains(sid))
            .map(|(c, _)| c.clone())
            .collect();
        for channel in channels {
            self.unsubscribe_node(sid, &channel, obs);
        }
    }

    pub fn remove_client(&mut self, cid: &str, obs: &mut dyn HubObserver) {
        let channels: Vec<String> = self
            .client_channels
            .iter()
            .filter(|(_, set)| set.contains(cid))
            .map(|(c, _)| c.clone())
            .collect();
        for channel in channels {
            self.unsubscribe_client(cid, &channel, obs);
        }
    }

    pub fn is_node_subscribed(&self, sid: &str, channel: &str) -> bool {
        self.node_channels
            .get(channel)
            .is_some_and(|s| s.contains(sid))
    }

    pub fn is_client_subscribed(&self, cid: &str, channel: &str) -> bool {
        self.client_channels
            .get(channel)
            .is_some_and(|s| s.contains(cid))
    }

    pub fn has_client(&self, cid: &str) -> bool {
        self.client_channels.values().any(|s| s.contains(cid))
    }

    /// Fan-out decision for one publication. Returns true iff a node or
    /// client entry existed for the channel; the broadcast fallback alone
    /// does not count as a match.
    pub fn publish(
        &self,
        channel: &str,
        msg: &str,
        sender: Option<&str>,
        opts: PublishOpts,
        obs: &mut dyn HubObserver,
    ) -> bool {
        let nodes = self.node_channels.get(channel);
        let clients = self.client_channels.get(channel);

        if let Some(nodes) = nodes {
            if !opts.skip_nodes {
                for sid in nodes {
                    obs.node_message(channel, sid, msg);
                }
            }
        } else if !opts.skip_broadcast {
            // Nobody known to care: let the fabric flood and have the
            // receivers fan out locally.
            obs.node_broadcast(channel, msg);
        }

        if let Some(clients) = clients {
            for cid in clients {
                obs.client_message(channel, cid, msg);
            }
        }

        let sender_known = match sender {
            None => true,
            Some(sid) => nodes.is_some_and(|s| s.contains(sid)),
        };
        if sender_known {
            obs.channel_message(channel, msg);
        }

        nodes.is_some() || clients.is_some()
    }

    /// All live channel names.
    pub fn channels(&self) -> Vec<String> {
        let mut out: Vec<String> = self.node_channels.keys().cloned().collect();
        for c in self.client_channels.keys() {
            if !self.node_channels.contains_key(c) {
                out.push(c.clone());
            }
        }
        out
    }

    pub fn channels_of_node(&self, sid: &str) -> Vec<String> {
        self.node_channels
            .iter()
            .filter(|(_, set)| set.contains(sid))
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn node_subscribers(&self, channel: &str) -> Vec<String> {
        self.node_channels
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client_subscribers(&self, channel: &str) -> Vec<String> {
        self.client_channels
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> HubEventLog {
        HubEventLog::new()
    }

    fn joins(events: &[HubEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, HubEvent::NodeJoined { .. }))
            .count()
    }

    fn removes(events: &[HubEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, HubEvent::ChannelRemoved(_)))
            .count()
    }

    #[test]
    fn subscribe_node_is_idempotent() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_node("n1", "ch", &mut obs);
        hub.subscribe_node("n1", "ch", &mut obs);
        let events = obs.take();
        assert_eq!(joins(&events), 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, HubEvent::ChannelAdded(_)))
                .count(),
            1
        );
        assert!(hub.is_node_subscribed("n1", "ch"));
    }

    #[test]
    fn last_subscriber_removes_channel_once() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_node("n1", "ch", &mut obs);
        hub.subscribe_node("n2", "ch", &mut obs);
        hub.unsubscribe_node("n1", "ch", &mut obs);
        assert_eq!(removes(obs.events()), 0);
        hub.unsubscribe_node("n2", "ch", &mut obs);
        let events = obs.take();
        assert_eq!(removes(&events), 1);
        assert!(hub.channels().is_empty());
    }

    #[test]
    fn client_subscription_implies_owner_node() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_client("n1", "c9", "ch", &mut obs);
        assert!(hub.is_node_subscribed("n1", "ch"));
        assert!(hub.is_client_subscribed("c9", "ch"));
    }

    #[test]
    fn last_client_tears_down_the_channel() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_client("n1", "c9", "ch", &mut obs);
        hub.unsubscribe_client("c9", "ch", &mut obs);
        let events = obs.take();
        // Node subscriber went with the channel, exactly one remove.
        assert_eq!(removes(&events), 1);
        assert!(!hub.is_node_subscribed("n1", "ch"));
        assert!(hub.channels().is_empty());
    }

    #[test]
    fn node_unsubscribe_keeps_channel_while_clients_remain() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_client("n1", "c9", "ch", &mut obs);
        hub.unsubscribe_node("n1", "ch", &mut obs);
        assert_eq!(removes(obs.events()), 0);
        assert!(hub.is_client_subscribed("c9", "ch"));
        assert_eq!(hub.channels(), vec!["ch".to_string()]);
    }

    #[test]
    fn remove_node_walks_every_channel() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_node("n1", "a", &mut obs);
        hub.subscribe_node("n1", "b", &mut obs);
        hub.subscribe_node("n2", "b", &mut obs);
        hub.remove_node("n1", &mut obs);
        assert!(!hub.is_node_subscribed("n1", "a"));
        assert!(!hub.is_node_subscribed("n1", "b"));
        assert!(hub.is_node_subscribed("n2", "b"));
        assert_eq!(hub.channels(), vec!["b".to_string()]);
    }

    #[test]
    fn publish_routes_to_nodes_and_clients() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_node("n1", "ch", &mut obs);
        hub.subscribe_node("n2", "ch", &mut obs);
        hub.subscribe_client("n1", "c9", "ch", &mut obs);

        let mut obs = log();
        let matched = hub.publish("ch", "hello", Some("n1"), PublishOpts::default(), &mut obs);
        assert!(matched);
        let events = obs.take();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, HubEvent::NodeMessage { .. }))
                .count(),
            2
        );
        assert!(events.iter().any(|e| matches!(
            e,
            HubEvent::ClientMessage { cid, .. } if cid == "c9"
        )));
        // Sender is a known subscriber: observability emit fires.
        assert!(events
            .iter()
            .any(|e| matches!(e, HubEvent::ChannelMessage { .. })));
    }

    #[test]
    fn publish_unknown_channel_broadcasts() {
        let hub = ChannelHub::new();
        let mut obs = log();
        let matched = hub.publish("nowhere", "m", None, PublishOpts::default(), &mut obs);
        assert!(!matched);
        assert!(obs
            .events()
            .iter()
            .any(|e| matches!(e, HubEvent::NodeBroadcast { .. })));
    }

    #[test]
    fn publish_skip_flags_limit_fanout() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_node("n1", "ch", &mut obs);
        hub.subscribe_client("n1", "c9", "ch", &mut obs);

        let opts = PublishOpts {
            skip_nodes: true,
            skip_broadcast: true,
        };
        let mut obs = log();
        assert!(hub.publish("ch", "m", Some("n2"), opts, &mut obs));
        let events = obs.take();
        assert!(!events
            .iter()
            .any(|e| matches!(e, HubEvent::NodeMessage { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, HubEvent::NodeBroadcast { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, HubEvent::ClientMessage { .. })));
        // Unknown sender: no observability emit.
        assert!(!events
            .iter()
            .any(|e| matches!(e, HubEvent::ChannelMessage { .. })));

        let mut obs = log();
        assert!(!hub.publish("nowhere", "m", None, opts, &mut obs));
        assert!(obs.events().is_empty() || !obs
            .events()
            .iter()
            .any(|e| matches!(e, HubEvent::NodeBroadcast { .. })));
    }

    #[test]
    fn channels_of_node_reports_only_that_node() {
        let mut hub = ChannelHub::new();
        let mut obs = log();
        hub.subscribe_node("n1", "a", &mut obs);
        hub.subscribe_node("n2", "b", &mut obs);
        let mut mine = hub.channels_of_node("n1");
        mine.sort();
        assert_eq!(mine, vec!["a".to_string()]);
    }
}
