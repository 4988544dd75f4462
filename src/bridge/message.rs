//! Message model shared by both links and the router.
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::meshtastic::{format_node_id, parse_node_id};

/// `to_id` value for traffic addressed to everyone.
pub const BROADCAST: &str = "broadcast";

/// Which inbound path produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// General mesh traffic relayed on the receive wildcard topic.
    Regular,
    /// Bot-oriented traffic on the configured control channel.
    DedicatedChannel,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Regular => write!(f, "regular"),
            Origin::DedicatedChannel => write!(f, "dedicated"),
        }
    }
}

/// A normalized inbound message. Built by the classifier and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    text: String,
    from_id: String,
    to_id: String,
    is_direct: bool,
    origin: Origin,
    timestamp: DateTime<Utc>,
    packet_id: Option<String>,
    channel: Option<u32>,
}

impl Message {
    pub(crate) fn new(
        text: String,
        from_id: String,
        to_id: String,
        is_direct: bool,
        origin: Origin,
    ) -> Self {
        Self {
            text,
            from_id,
            to_id,
            is_direct,
            origin,
            timestamp: Utc::now(),
            packet_id: None,
            channel: None,
        }
    }

    pub(crate) fn with_packet(mut self, packet_id: Option<String>, channel: Option<u32>) -> Self {
        self.packet_id = packet_id;
        self.channel = channel;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn from_id(&self) -> &str {
        &self.from_id
    }
    pub fn to_id(&self) -> &str {
        &self.to_id
    }
    pub fn is_direct(&self) -> bool {
        self.is_direct
    }
    pub fn origin(&self) -> Origin {
        self.origin
    }
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn packet_id(&self) -> Option<&str> {
        self.packet_id.as_deref()
    }
    pub fn channel(&self) -> Option<u32> {
        self.channel
    }
}

/// A mesh node seen in node-info traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

/// id -> Node map. Written only by the inbound dispatcher, read from anywhere.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, node: Node) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.id.clone(), node);
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(id).cloned()
    }

    /// Display name for log lines, falling back to the id itself.
    pub fn display_name(&self, id: &str) -> String {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let key = parse_node_id(id).map(format_node_id);
        key.as_deref()
            .and_then(|k| nodes.get(k))
            .or_else(|| nodes.get(id))
            .map(|n| n.display_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.nodes.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Per-link connection state. Transitions are owned by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A device channel slot as reported by the live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub index: u32,
    pub name: String,
}

impl ChannelDescriptor {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct LearnedIdentity {
    node_id: Option<String>,
    node_num: Option<u32>,
}

/// Who the bridge is on the mesh: the configured label plus whatever node id the
/// links have learned. Used to discard our own traffic.
#[derive(Debug)]
pub struct SelfIdentity {
    label: String,
    learned: RwLock<LearnedIdentity>,
}

impl SelfIdentity {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            learned: RwLock::new(LearnedIdentity::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record a node id seen in node-info traffic (`!hex`, `0x..` or decimal).
    pub fn record_node_id(&self, id: &str) {
        let mut learned = self.learned.write().unwrap_or_else(|e| e.into_inner());
        learned.node_id = Some(id.to_string());
        if let Some(num) = parse_node_id(id) {
            learned.node_num = Some(num);
        }
    }

    /// Record the node number reported by the device handshake.
    pub fn record_node_num(&self, num: u32) {
        let mut learned = self.learned.write().unwrap_or_else(|e| e.into_inner());
        learned.node_num = Some(num);
        learned.node_id = Some(format_node_id(num));
    }

    pub fn node_num(&self) -> Option<u32> {
        self.learned.read().unwrap_or_else(|e| e.into_inner()).node_num
    }

    pub fn node_id(&self) -> Option<String> {
        self.learned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .node_id
            .clone()
    }

    /// Our node id when known, else the label.
    pub fn node_id_or_label(&self) -> String {
        self.node_id().unwrap_or_else(|| self.label.clone())
    }

    /// True when `from_id` names the bridge in any of its spellings.
    pub fn matches(&self, from_id: &str) -> bool {
        let from_id = from_id.trim();
        if from_id.is_empty() {
            return false;
        }
        if from_id == self.label {
            return true;
        }
        let learned = self.learned.read().unwrap_or_else(|e| e.into_inner());
        if learned.node_id.as_deref() == Some(from_id) {
            return true;
        }
        match (learned.node_num, parse_node_id(from_id)) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }
}
