//! Shared fixtures for the bridge integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshbridge::bridge::{Bridge, Message};
use meshbridge::config::Config;
use meshbridge::responder::{FnResponder, Responder};
use meshbridge::test_utils::{MockBroker, MockDevice};

pub const DEDICATED_TOPIC: &str = "msh/US/2/json/llm/";
pub const RESPONSE_TOPIC: &str = "msh/US/2/json/llmres/";
pub const REGULAR_TOPIC: &str = "msh/US/rx";
pub const DEVICE_NODE: u32 = 0x0a0b_0c0d;

/// Defaults with every delay shrunk so paused-clock tests finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.broker.connect_timeout_secs = 1;
    config.device.connect_retries = 1;
    config.device.reconnect_retries = 1;
    config.device.backoff_base_ms = 10;
    config.device.backoff_cap_ms = 100;
    config.device.chunk_pause_ms = 0;
    config.bridge.reply_retry_delay_ms = 10;
    config.bridge.queue_join_timeout_ms = 200;
    config.bridge.shutdown_send_timeout_ms = 200;
    config
}

pub fn device() -> MockDevice {
    MockDevice::new(DEVICE_NODE).with_channels(&[(0, "Primary"), (1, "llmres")])
}

pub struct Harness {
    pub bridge: Bridge,
    pub broker: MockBroker,
    pub device: MockDevice,
    pub seen: Arc<Mutex<Vec<Message>>>,
}

impl Harness {
    pub fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_texts(&self) -> Vec<String> {
        self.seen().iter().map(|m| m.text().to_string()).collect()
    }

    /// JSON publishes on the response topic.
    pub fn responses(&self) -> Vec<serde_json::Value> {
        self.broker
            .published_json()
            .into_iter()
            .filter(|(topic, _)| topic == RESPONSE_TOPIC)
            .map(|(_, v)| v)
            .collect()
    }
}

/// Responder recording every message and answering with `reply`.
pub fn recording_responder(reply: Option<&str>) -> (Arc<dyn Responder>, Arc<Mutex<Vec<Message>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let reply = reply.map(str::to_string);
    let responder = FnResponder(move |m: &Message| {
        log.lock().unwrap().push(m.clone());
        Ok::<_, anyhow::Error>(reply.clone())
    });
    (Arc::new(responder), seen)
}

pub fn harness_with(
    config: Config,
    broker: MockBroker,
    device: MockDevice,
    reply: Option<&str>,
) -> Harness {
    let bridge = Bridge::new(&config, Arc::new(broker.clone()), Arc::new(device.clone()));
    let (responder, seen) = recording_responder(reply);
    bridge.set_responder(responder);
    Harness {
        bridge,
        broker,
        device,
        seen,
    }
}

pub fn harness(reply: Option<&str>) -> Harness {
    harness_with(test_config(), MockBroker::new(), device(), reply)
}

/// Poll `cond` on the (usually paused) clock until it holds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Let spawned tasks run without expecting anything in particular.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}
