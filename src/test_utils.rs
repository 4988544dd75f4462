//! In-memory broker and device doubles.
//!
//! Both implement the session traits used by the links, record everything sent
//! through them, and can be scripted to fail. Used by unit tests and by the
//! integration tests under `tests/`.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bridge::message::ChannelDescriptor;
use crate::broker::{BrokerConnector, BrokerEvent, BrokerSession};
use crate::error::{LinkError, LinkResult};
use crate::meshtastic::{
    format_node_id, Destination, DeviceConnector, DeviceIdentity, DeviceSession,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct BrokerState {
    events: Mutex<Option<mpsc::UnboundedSender<BrokerEvent>>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    withhold_connack: AtomicBool,
    publish_failing: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Broker double. Acknowledges the connection as soon as a session opens
/// unless [`MockBroker::without_connack`] is used.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_connack(self) -> Self {
        self.state.withhold_connack.store(true, Ordering::SeqCst);
        self
    }

    fn emit(&self, event: BrokerEvent) -> bool {
        lock(&self.state.events)
            .as_ref()
            .map_or(false, |tx| tx.send(event).is_ok())
    }

    /// Deliver a publish as if it arrived from the broker.
    pub fn inject(&self, topic: &str, payload: &str) -> bool {
        self.emit(BrokerEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        })
    }

    pub fn drop_connection(&self, reason: &str) -> bool {
        self.emit(BrokerEvent::Disconnected(reason.to_string()))
    }

    pub fn restore_connection(&self) -> bool {
        self.emit(BrokerEvent::Connected)
    }

    pub fn set_publish_failing(&self, failing: bool) {
        self.state.publish_failing.store(failing, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state.subscriptions).clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state.published).clone()
    }

    /// Publishes whose payload parses as JSON.
    pub fn published_json(&self) -> Vec<(String, serde_json::Value)> {
        self.published()
            .into_iter()
            .filter_map(|(topic, payload)| {
                serde_json::from_slice(&payload).ok().map(|v| (topic, v))
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    fn describe(&self) -> String {
        "mock-broker".to_string()
    }

    async fn open(
        &self,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> LinkResult<Arc<dyn BrokerSession>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if !self.state.withhold_connack.load(Ordering::SeqCst) {
            let _ = events.send(BrokerEvent::Connected);
        }
        *lock(&self.state.events) = Some(events);
        Ok(Arc::new(MockBrokerSession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockBrokerSession {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSession for MockBrokerSession {
    async fn subscribe(&self, filter: &str) -> LinkResult<()> {
        lock(&self.state.subscriptions).push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if self.state.publish_failing.load(Ordering::SeqCst) {
            return Err(LinkError::Broker("scripted publish failure".to_string()));
        }
        lock(&self.state.published).push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            lock(&self.state.events).take();
        }
    }
}

/// One text packet handed to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub text: String,
    pub destination: Destination,
    pub channel: u32,
}

#[derive(Default)]
struct DeviceState {
    node_num: u32,
    channels: Mutex<Vec<ChannelDescriptor>>,
    sent: Mutex<Vec<SentText>>,
    send_failures: Mutex<VecDeque<LinkError>>,
    sends_failing: AtomicBool,
    failing_opens: AtomicUsize,
    failing_identities: AtomicUsize,
    opens: AtomicUsize,
}

/// Device double reporting a fixed node number and channel table.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<DeviceState>,
}

/// Decrement `counter` if positive; true when it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockDevice {
    pub fn new(node_num: u32) -> Self {
        Self {
            state: Arc::new(DeviceState {
                node_num,
                channels: Mutex::new(vec![ChannelDescriptor::new(0, "Primary")]),
                ..DeviceState::default()
            }),
        }
    }

    pub fn with_channels(self, channels: &[(u32, &str)]) -> Self {
        *lock(&self.state.channels) = channels
            .iter()
            .map(|(index, name)| ChannelDescriptor::new(*index, *name))
            .collect();
        self
    }

    pub fn node_num(&self) -> u32 {
        self.state.node_num
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// The next `count` sessions open but fail the identity query.
    pub fn fail_next_identity(&self, count: usize) {
        self.state.failing_identities.store(count, Ordering::SeqCst);
    }

    /// Queue an error for the next send on any session.
    pub fn fail_next_send(&self, error: LinkError) {
        lock(&self.state.send_failures).push_back(error);
    }

    /// Every send fails with a non-transient error while set.
    pub fn set_sends_failing(&self, failing: bool) {
        self.state.sends_failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentText> {
        lock(&self.state.sent).clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.text).collect()
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceConnector for MockDevice {
    fn describe(&self) -> String {
        "mock-device".to_string()
    }

    async fn open(&self) -> LinkResult<Box<dyn DeviceSession>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_opens) {
            return Err(LinkError::TransportReset("connection refused".to_string()));
        }
        Ok(Box::new(MockDeviceSession {
            state: self.state.clone(),
            identity_ok: !take_one(&self.state.failing_identities),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockDeviceSession {
    state: Arc<DeviceState>,
    identity_ok: bool,
    closed: AtomicBool,
}

#[async_trait]
impl DeviceSession for MockDeviceSession {
    async fn my_info(&self) -> LinkResult<DeviceIdentity> {
        if !self.identity_ok {
            return Err(LinkError::Timeout("device handshake"));
        }
        Ok(DeviceIdentity {
            node_num: self.state.node_num,
            node_id: format_node_id(self.state.node_num),
            long_name: Some("mock".to_string()),
        })
    }

    async fn channels(&self) -> LinkResult<Vec<ChannelDescriptor>> {
        Ok(lock(&self.state.channels).clone())
    }

    fn node_count(&self) -> usize {
        1
    }

    async fn send_text(&self, text: &str, destination: Destination, channel: u32) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        if let Some(error) = lock(&self.state.send_failures).pop_front() {
            return Err(error);
        }
        if self.state.sends_failing.load(Ordering::SeqCst) {
            return Err(LinkError::Timeout("device send"));
        }
        lock(&self.state.sent).push(SentText {
            text: text.to_string(),
            destination,
            channel,
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
