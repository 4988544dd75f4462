//! # Meshtastic Device Communication Module
//!
//! Client side of the Meshtastic device API used by the outbound link. The
//! device is reached over its TCP stream interface (default port 4403), where
//! every protobuf is wrapped in a 4-byte header: `0x94 0xC3 <len_hi> <len_lo>`.
//!
//! ## Session lifecycle
//!
//! 1. Open the TCP stream and send a burst of `0xC3` so a half-parsed frame on
//!    the device side resynchronizes.
//! 2. Send `ToRadio{want_config_id}`. The device answers with `my_info`, a
//!    `node_info` per known node, one `channel` per slot and finally
//!    `config_complete_id`.
//! 3. Text goes out as `ToRadio{packet}` carrying `Data{portnum: TEXT_MESSAGE_APP}`.
//! 4. A periodic `heartbeat` keeps idle sessions from being dropped.
//!
//! The bridge talks to sessions through [`DeviceConnector`] / [`DeviceSession`]
//! so tests can swap in an in-memory device.

use async_trait::async_trait;

use crate::bridge::message::ChannelDescriptor;
use crate::error::{LinkError, LinkResult};

pub mod frame;
pub mod tcp;

/// Node number meaning "every node".
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Parse a node id in any of the spellings seen on the mesh: `!1a2b3c4d`,
/// `0x1a2b3c4d` or plain decimal.
pub fn parse_node_id(s: &str) -> Option<u32> {
    let s = s.trim();
    let hex = s
        .strip_prefix('!')
        .or_else(|| s.strip_prefix("0x"))
        .or_else(|| s.strip_prefix("0X"));
    if let Some(hex) = hex {
        if hex.is_empty() || hex.len() > 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        return u32::from_str_radix(hex, 16).ok();
    }
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u32>().ok()
}

/// Canonical `!xxxxxxxx` form of a node number.
pub fn format_node_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Where a text packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Node(u32),
}

impl Destination {
    /// `None`, empty, `broadcast` and `^all` all mean broadcast; anything else must
    /// parse as a node id.
    pub fn parse(to: Option<&str>) -> LinkResult<Self> {
        let Some(raw) = to.map(str::trim) else {
            return Ok(Destination::Broadcast);
        };
        if raw.is_empty() || raw.eq_ignore_ascii_case("broadcast") || raw == "^all" {
            return Ok(Destination::Broadcast);
        }
        match parse_node_id(raw) {
            Some(BROADCAST_ADDR) => Ok(Destination::Broadcast),
            Some(num) => Ok(Destination::Node(num)),
            None => Err(LinkError::InvalidDestination(raw.to_string())),
        }
    }

    pub fn addr(self) -> u32 {
        match self {
            Destination::Broadcast => BROADCAST_ADDR,
            Destination::Node(num) => num,
        }
    }

    pub fn is_direct(self) -> bool {
        matches!(self, Destination::Node(_))
    }
}

/// What the device reports about itself once the config handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub node_num: u32,
    pub node_id: String,
    pub long_name: Option<String>,
}

/// Opens device sessions. One connector lives for the whole process; every
/// (re)connect asks it for a fresh session.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Human readable endpoint for log lines.
    fn describe(&self) -> String;

    async fn open(&self) -> LinkResult<Box<dyn DeviceSession>>;
}

/// A live device session.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Self-identity query. Fails when the device never finished its handshake.
    async fn my_info(&self) -> LinkResult<DeviceIdentity>;

    /// Enabled channel slots as currently reported by the device.
    async fn channels(&self) -> LinkResult<Vec<ChannelDescriptor>>;

    /// Nodes the device has announced since the session opened.
    fn node_count(&self) -> usize;

    async fn send_text(&self, text: &str, destination: Destination, channel: u32) -> LinkResult<()>;

    /// Idempotent.
    async fn close(&self);
}
