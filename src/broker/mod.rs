//! Broker session layer for the inbound link.
//!
//! A [`BrokerConnector`] opens a session and pushes [`BrokerEvent`]s onto the
//! channel it is given; the inbound link's dispatcher task consumes them. The
//! session keeps reconnecting on its own and reports every transition.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LinkResult;

pub mod mqtt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Session (re)established; subscriptions must be (re)issued.
    Connected,
    Message { topic: String, payload: Vec<u8> },
    /// Transport dropped. The session retries by itself.
    Disconnected(String),
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    fn describe(&self) -> String;

    async fn open(
        &self,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> LinkResult<Arc<dyn BrokerSession>>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn subscribe(&self, filter: &str) -> LinkResult<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> LinkResult<()>;

    /// Idempotent. Stops the event loop; no events follow.
    async fn close(&self);
}

/// MQTT topic filter matching with `+` (one level) and `#` (rest, including the
/// parent level itself).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
