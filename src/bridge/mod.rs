//! # Hybrid messaging bridge
//!
//! Pairs a subscribe-only broker link with a send-capable device link:
//!
//! ```text
//! broker ──▶ InboundLink ──▶ classify ──▶ Bridge ──▶ Responder
//!                 ▲                          │
//!                 │ fallback publish         ▼
//!                 └───────────────────── OutboundLink ──▶ device
//! ```
//!
//! - [`classify`] - payload shapes, self-echo and feedback filters
//! - [`inbound`] - broker session, subscriptions, dispatcher and regular queue
//! - [`outbound`] - device session with backoff, chunking and reset recovery
//! - [`router`] - reply policy and cross-transport fallback

pub mod chunk;
pub mod classify;
pub mod inbound;
pub mod message;
pub mod outbound;
pub mod queue;
pub mod router;

pub use message::{ChannelDescriptor, ConnectionState, Message, Node, NodeRegistry, Origin};
pub use router::{Bridge, BridgeMode};
