//! Inbound payload classification.
//!
//! Turns a raw `(topic, payload)` pair into a [`Classified`] outcome. Dedicated
//! channel payloads come in many JSON shapes (firmware JSON, our own `sendtext`
//! envelope, hand-written test clients), so they run through an ordered table
//! of shape matchers; the first one yielding non-empty text wins. Regular
//! traffic has a single fixed shape and is dropped when it does not parse.
use chrono::Utc;
use log::{debug, trace};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::message::{Message, Node, Origin, SelfIdentity, BROADCAST};
use crate::broker::topic_matches;
use crate::config::Config;
use crate::meshtastic::{format_node_id, parse_node_id};

/// Topic configuration the classifier needs.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Dedicated channel topic with trailing slashes removed; None when disabled.
    pub dedicated_prefix: Option<String>,
    pub regular_filter: String,
    pub nodeinfo_filter: String,
    /// Text starting with this is our own banner coming back.
    pub banner_marker: String,
}

impl ClassifierConfig {
    pub fn from_config(config: &Config) -> Self {
        let dedicated_prefix = if config.channel.enabled {
            Some(config.channel.topic.trim_end_matches('/').to_string())
        } else {
            None
        };
        Self {
            dedicated_prefix,
            regular_filter: config.broker.regular_topic.clone(),
            nodeinfo_filter: config.broker.nodeinfo_topic.clone(),
            banner_marker: config.bridge.banner_text.clone(),
        }
    }

    /// Topic-segment-aware prefix check against the dedicated channel topic.
    pub fn is_dedicated(&self, topic: &str) -> bool {
        match self.dedicated_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => {
                topic == prefix
                    || topic
                        .strip_prefix(prefix)
                        .map_or(false, |rest| rest.starts_with('/'))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    EmptyText,
    SelfEcho,
    SelfSender,
    Malformed,
}

/// Which dedicated-channel shape produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    TextPort,
    SendText,
    PayloadText,
    TopLevelText,
    Heuristic,
    RawText,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Message(Message),
    NodeInfo(Node),
    Dropped(DropReason),
    /// Topic is none of ours.
    Ignored,
}

/// Fields pulled out of a dedicated-channel payload before filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub shape: Shape,
    pub text: String,
    pub from_id: String,
    pub to_id: String,
}

struct ShapeContext<'a> {
    raw: &'a str,
    topic_sender: Option<&'a str>,
}

type Matcher = fn(&Map<String, Value>, &ShapeContext<'_>) -> Option<Extracted>;

/// Strict priority order.
const MATCHERS: [Matcher; 5] = [
    match_text_port,
    match_sendtext,
    match_payload_text,
    match_top_level_text,
    match_heuristic,
];

pub fn classify(
    config: &ClassifierConfig,
    identity: &SelfIdentity,
    topic: &str,
    payload: &[u8],
) -> Classified {
    let raw = String::from_utf8_lossy(payload);

    let message = if config.is_dedicated(topic) {
        let extracted = extract_dedicated(topic, &raw);
        trace!("dedicated payload matched {:?}", extracted.shape);
        Message::new(
            extracted.text,
            extracted.from_id,
            extracted.to_id,
            true,
            Origin::DedicatedChannel,
        )
    } else if topic_matches(&config.regular_filter, topic) {
        match parse_regular(&raw) {
            Some(message) => message,
            None => {
                debug!("Dropping non-conforming payload on {}", topic);
                return Classified::Dropped(DropReason::Malformed);
            }
        }
    } else if topic_matches(&config.nodeinfo_filter, topic) {
        return match parse_node_info(&raw) {
            Some(node) => Classified::NodeInfo(node),
            None => Classified::Dropped(DropReason::Malformed),
        };
    } else {
        return Classified::Ignored;
    };

    match apply_filters(config, identity, &message) {
        Some(reason) => Classified::Dropped(reason),
        None => Classified::Message(message),
    }
}

/// Post-classification filters, in order: empty, own banner, own sender.
fn apply_filters(
    config: &ClassifierConfig,
    identity: &SelfIdentity,
    message: &Message,
) -> Option<DropReason> {
    let text = message.text().trim();
    if text.is_empty() {
        return Some(DropReason::EmptyText);
    }
    let marker = config.banner_marker.trim();
    if !marker.is_empty() && text.starts_with(marker) {
        return Some(DropReason::SelfEcho);
    }
    if identity.matches(message.from_id()) {
        return Some(DropReason::SelfSender);
    }
    None
}

/// Dedicated-channel extraction. Never fails: non-JSON falls back to raw text.
pub fn extract_dedicated(topic: &str, raw: &str) -> Extracted {
    let ctx = ShapeContext {
        raw,
        topic_sender: topic_sender(topic),
    };
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        if let Some(found) = MATCHERS.iter().find_map(|m| m(&map, &ctx)) {
            return found;
        }
    }
    Extracted {
        shape: Shape::RawText,
        text: raw.to_string(),
        from_id: ctx.topic_sender.unwrap_or("unknown").to_string(),
        to_id: BROADCAST.to_string(),
    }
}

/// `!`-prefixed last topic segment, if any.
fn topic_sender(topic: &str) -> Option<&str> {
    topic
        .rsplit('/')
        .next()
        .filter(|last| last.starts_with('!') && last.len() > 1)
}

/// String or number rendered as an id; numbers in decimal.
fn id_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn payload_object(map: &Map<String, Value>) -> Option<&Map<String, Value>> {
    map.get("payload").and_then(Value::as_object)
}

fn is_type(map: &Map<String, Value>, kind: &str) -> bool {
    map.get("type").and_then(Value::as_str) == Some(kind)
}

fn sender_or_from(map: &Map<String, Value>) -> String {
    id_value(map.get("sender"))
        .or_else(|| id_value(map.get("from")))
        .unwrap_or_else(|| "unknown".to_string())
}

fn to_or_broadcast(value: Option<&Value>) -> String {
    id_value(value).unwrap_or_else(|| BROADCAST.to_string())
}

/// (a) firmware JSON: `{"type":"text","payload":{"text":..},"from":..,"to":..}`
fn match_text_port(map: &Map<String, Value>, _ctx: &ShapeContext<'_>) -> Option<Extracted> {
    if !is_type(map, "text") {
        return None;
    }
    let text = text_value(payload_object(map)?.get("text"))?;
    Some(Extracted {
        shape: Shape::TextPort,
        text,
        from_id: sender_or_from(map),
        to_id: to_or_broadcast(map.get("to")),
    })
}

/// (b) our envelope: `{"type":"sendtext","payload":{"text","from_id","to_id"}}`
fn match_sendtext(map: &Map<String, Value>, _ctx: &ShapeContext<'_>) -> Option<Extracted> {
    if !is_type(map, "sendtext") {
        return None;
    }
    let payload = payload_object(map)?;
    let text = text_value(payload.get("text"))?;
    let from_id = id_value(payload.get("from_id"))
        .or_else(|| id_value(map.get("from")))
        .unwrap_or_else(|| "unknown".to_string());
    Some(Extracted {
        shape: Shape::SendText,
        text,
        from_id,
        to_id: to_or_broadcast(payload.get("to_id")),
    })
}

/// (c) any `payload` object with a `text` key.
fn match_payload_text(map: &Map<String, Value>, _ctx: &ShapeContext<'_>) -> Option<Extracted> {
    let text = text_value(payload_object(map)?.get("text"))?;
    Some(Extracted {
        shape: Shape::PayloadText,
        text,
        from_id: sender_or_from(map),
        to_id: to_or_broadcast(map.get("to")),
    })
}

/// (d) top-level `text`.
fn match_top_level_text(map: &Map<String, Value>, _ctx: &ShapeContext<'_>) -> Option<Extracted> {
    let text = text_value(map.get("text"))?;
    let from_id = id_value(map.get("from_id"))
        .or_else(|| id_value(map.get("sender")))
        .unwrap_or_else(|| "unknown".to_string());
    let to_id = id_value(map.get("to_id"))
        .or_else(|| id_value(map.get("to")))
        .unwrap_or_else(|| BROADCAST.to_string());
    Some(Extracted {
        shape: Shape::TopLevelText,
        text,
        from_id,
        to_id,
    })
}

const TEXT_KEYS: [&str; 4] = ["text", "message", "content", "body"];
const SENDER_KEYS: [&str; 5] = ["from", "from_id", "sender", "user", "userId"];

/// (e) scan common keys; the whole payload is the text when none holds a string.
/// A key holding only whitespace still wins over the payload, so the empty-text
/// filter drops it afterwards.
fn match_heuristic(map: &Map<String, Value>, ctx: &ShapeContext<'_>) -> Option<Extracted> {
    let text = TEXT_KEYS
        .iter()
        .find_map(|key| text_value(map.get(*key)))
        .or_else(|| {
            TEXT_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| ctx.raw.to_string());
    let from_id = SENDER_KEYS
        .iter()
        .find_map(|key| id_value(map.get(*key)))
        .or_else(|| ctx.topic_sender.map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    Some(Extracted {
        shape: Shape::Heuristic,
        text,
        from_id,
        to_id: BROADCAST.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegularPayload {
    id: Option<Value>,
    from_id: Value,
    to_id: Value,
    channel: Option<Value>,
    text: String,
}

/// Fixed-shape JSON from the regular receive topic.
fn parse_regular(raw: &str) -> Option<Message> {
    let parsed: RegularPayload = serde_json::from_str(raw).ok()?;
    let from_id = id_value(Some(&parsed.from_id))?;
    let to_id = id_value(Some(&parsed.to_id)).unwrap_or_else(|| BROADCAST.to_string());
    let is_direct = to_id != BROADCAST;
    let channel = parsed
        .channel
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|c| u32::try_from(c).ok());
    Some(
        Message::new(parsed.text, from_id, to_id, is_direct, Origin::Regular)
            .with_packet(id_value(parsed.id.as_ref()), channel),
    )
}

/// `{"num": 42, "user": {"id": "!0000002a", "longName": "...", "shortName": ".."}}`
fn parse_node_info(raw: &str) -> Option<Node> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let map = value.as_object()?;
    let user = map.get("user").and_then(Value::as_object);
    let id = map
        .get("num")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .map(format_node_id)
        .or_else(|| {
            let raw_id = id_value(user?.get("id"))?;
            Some(parse_node_id(&raw_id).map(format_node_id).unwrap_or(raw_id))
        })?;
    let display_name = user
        .and_then(|u| text_value(u.get("longName")).or_else(|| text_value(u.get("shortName"))))
        .map(|n| n.trim().to_string())
        .unwrap_or_else(|| id.clone());
    Some(Node {
        id,
        display_name,
        last_seen: Utc::now(),
    })
}
