//! # meshbridge - Hybrid MQTT/TCP messaging bridge for Meshtastic
//!
//! meshbridge connects a Meshtastic mesh to a conversational responder. Radio
//! traffic is received from an MQTT broker that gateway nodes publish to, and
//! replies leave through a direct TCP session to a Meshtastic device, because
//! the firmware's broker-publish path is dependable for receiving but not for
//! sending.
//!
//! ## Features
//!
//! - **Two transports, one channel**: subscribe over MQTT, send over the device TCP API (port 4403).
//! - **Payload classification**: regular mesh JSON plus several JSON shapes (and raw text) on a dedicated bot channel.
//! - **Loop protection**: own banner and own node id are filtered before anything reaches the responder.
//! - **Resilient sends**: exponential backoff on connect, one reconnect-and-retry on transport resets, UTF-8 safe 190-byte chunking.
//! - **Fallback**: dedicated-channel replies that cannot reach the device are published back to the broker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshbridge::bridge::Bridge;
//! use meshbridge::config::Config;
//! use meshbridge::responder::EchoResponder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let bridge = Bridge::from_config(&config);
//!     bridge.set_responder(Arc::new(EchoResponder));
//!     bridge.connect().await?;
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bridge`] - message model, classification, inbound/outbound links and the router
//! - [`broker`] - MQTT session layer for the inbound link
//! - [`meshtastic`] - Meshtastic TCP API session for the outbound link
//! - [`responder`] - echo and HTTP chat-completion responders
//! - [`config`] - configuration management and validation
//! - [`protobuf`] - Meshtastic protocol buffer definitions

pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod responder;
pub mod test_utils;
