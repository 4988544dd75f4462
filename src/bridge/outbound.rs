//! Outbound link: the send side of the bridge, over a device session.
//!
//! All device writes go through one async mutex, so chunks of different
//! replies never interleave and reconnects happen in the calling task. There
//! is no background supervisor; a missing or reset session is repaired lazily
//! by whichever send notices it.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};

use super::chunk::chunk_message;
use super::message::{ChannelDescriptor, ConnectionState, NodeRegistry, SelfIdentity};
use crate::config::DeviceConfig;
use crate::error::{LinkError, LinkResult};
use crate::logutil::truncate_for_log;
use crate::meshtastic::{format_node_id, DeviceConnector, DeviceSession, Destination};
use crate::metrics;

/// Retry and pacing knobs for the outbound link.
#[derive(Debug, Clone)]
pub struct OutboundTuning {
    pub connect_retries: u32,
    pub reconnect_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub chunk_pause: Duration,
    pub default_channel_index: u32,
}

impl OutboundTuning {
    pub fn from_config(device: &DeviceConfig) -> Self {
        Self {
            connect_retries: device.connect_retries,
            reconnect_retries: device.reconnect_retries,
            backoff_base: device.backoff_base(),
            backoff_cap: device.backoff_cap(),
            chunk_pause: device.chunk_pause(),
            default_channel_index: device.default_channel_index(),
        }
    }
}

impl Default for OutboundTuning {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

/// Wait before retry number `attempt + 1`: `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

/// Channel slot for `name`: exact case-insensitive match, then the first
/// channel whose name contains it, then `default`.
pub fn resolve_channel_index(channels: &[ChannelDescriptor], name: &str, default: u32) -> u32 {
    let wanted = name.trim().to_lowercase();
    if wanted.is_empty() {
        return default;
    }
    if let Some(ch) = channels.iter().find(|c| c.name.to_lowercase() == wanted) {
        return ch.index;
    }
    if let Some(ch) = channels
        .iter()
        .find(|c| c.name.to_lowercase().contains(&wanted))
    {
        debug!("Partial channel match for {}: {} at index {}", name, ch.name, ch.index);
        return ch.index;
    }
    warn!("Channel {} not found on device, using default index {}", name, default);
    default
}

enum Target<'a> {
    Node(Destination),
    Channel(&'a str),
}

type SessionSlot = Option<Box<dyn DeviceSession>>;

pub struct OutboundLink {
    connector: Arc<dyn DeviceConnector>,
    session: Mutex<SessionSlot>,
    state: watch::Sender<ConnectionState>,
    identity: Arc<SelfIdentity>,
    registry: Arc<NodeRegistry>,
    tuning: OutboundTuning,
    reconnects: AtomicU64,
    shutting_down: AtomicBool,
}

impl OutboundLink {
    pub fn new(
        connector: Arc<dyn DeviceConnector>,
        tuning: OutboundTuning,
        identity: Arc<SelfIdentity>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            session: Mutex::new(None),
            state,
            identity,
            registry,
            tuning,
            reconnects: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn tuning(&self) -> &OutboundTuning {
        &self.tuning
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Reconnects performed by send paths since creation.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Open a verified session, trying `max_retries + 1` times with
    /// exponential backoff between attempts. Replaces any current session.
    pub async fn connect(&self, max_retries: u32, base_delay: Duration) -> LinkResult<()> {
        let mut slot = self.session.lock().await;
        self.shutting_down.store(false, Ordering::Relaxed);
        self.connect_locked(&mut slot, max_retries, base_delay).await
    }

    async fn connect_locked(
        &self,
        slot: &mut SessionSlot,
        max_retries: u32,
        base_delay: Duration,
    ) -> LinkResult<()> {
        if let Some(old) = slot.take() {
            old.close().await;
        }
        self.state.send_replace(ConnectionState::Connecting);
        let mut last_error = LinkError::NotConnected;
        for attempt in 0..=max_retries {
            if self.is_shutting_down() {
                last_error = LinkError::Closed;
                break;
            }
            if attempt > 0 {
                let delay = backoff_delay(base_delay, self.tuning.backoff_cap, attempt - 1);
                info!(
                    "Retrying device connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    max_retries + 1
                );
                tokio::time::sleep(delay).await;
            }
            match self.open_verified().await {
                Ok(session) => {
                    *slot = Some(session);
                    self.state.send_replace(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Device connection attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        max_retries + 1,
                        self.connector.describe(),
                        e
                    );
                    last_error = e;
                }
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        Err(last_error)
    }

    /// A session only counts once the device has answered the identity query.
    async fn open_verified(&self) -> LinkResult<Box<dyn DeviceSession>> {
        let session = self.connector.open().await?;
        match session.my_info().await {
            Ok(me) => {
                info!(
                    "Connected to device {} as {}{}",
                    self.connector.describe(),
                    me.node_id,
                    me.long_name
                        .as_deref()
                        .map(|n| format!(" ({})", n))
                        .unwrap_or_default()
                );
                self.identity.record_node_num(me.node_num);
                Ok(session)
            }
            Err(e) => {
                session.close().await;
                Err(LinkError::Handshake(format!("identity query failed: {}", e)))
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    async fn reconnect_locked(&self, slot: &mut SessionSlot) -> LinkResult<()> {
        if self.is_shutting_down() {
            return Err(LinkError::Closed);
        }
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::inc_device_reconnects();
        self.connect_locked(slot, self.tuning.reconnect_retries, self.tuning.backoff_base)
            .await
    }

    /// Send `text` to `to` (None or "broadcast" for everyone) on the primary slot.
    pub async fn send(&self, text: &str, to: Option<&str>) -> LinkResult<()> {
        let destination = Destination::parse(to)?;
        if let Destination::Node(num) = destination {
            debug!("Sending to {}", self.registry.display_name(&format_node_id(num)));
        }
        self.deliver(text, Target::Node(destination)).await
    }

    /// Broadcast `text` on the device channel best matching `channel_name`.
    pub async fn send_to_channel(&self, text: &str, channel_name: &str) -> LinkResult<()> {
        self.deliver(text, Target::Channel(channel_name)).await
    }

    async fn deliver(&self, text: &str, target: Target<'_>) -> LinkResult<()> {
        let chunks = chunk_message(text);
        if chunks.is_empty() {
            debug!("Nothing to send");
            return Ok(());
        }
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            info!("No device session; reconnecting before send");
            self.reconnect_locked(&mut slot).await?;
        }
        match self.send_chunks(slot.as_deref(), &chunks, &target).await {
            Err(e) if e.is_transport_reset() => {
                warn!("Device transport reset during send ({}); reconnecting once", e);
                self.reconnect_locked(&mut slot).await?;
                self.send_chunks(slot.as_deref(), &chunks, &target).await
            }
            other => other,
        }
    }

    async fn send_chunks(
        &self,
        session: Option<&dyn DeviceSession>,
        chunks: &[String],
        target: &Target<'_>,
    ) -> LinkResult<()> {
        let session = session.ok_or(LinkError::NotConnected)?;
        let (destination, channel) = match target {
            Target::Node(destination) => (*destination, 0),
            Target::Channel(name) => {
                let channels = session.channels().await?;
                let index =
                    resolve_channel_index(&channels, name, self.tuning.default_channel_index);
                (Destination::Broadcast, index)
            }
        };
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !self.tuning.chunk_pause.is_zero() {
                tokio::time::sleep(self.tuning.chunk_pause).await;
            }
            if self.is_shutting_down() {
                warn!(
                    "Shutting down; {} of {} chunk(s) not sent",
                    chunks.len() - i,
                    chunks.len()
                );
                return Err(LinkError::Closed);
            }
            session.send_text(chunk, destination, channel).await?;
        }
        info!(
            "Sent {} chunk(s) on channel {}: {}",
            chunks.len(),
            channel,
            truncate_for_log(&chunks[0], 60)
        );
        Ok(())
    }

    /// Live channel table, reconnecting first if needed.
    pub async fn channels(&self) -> LinkResult<Vec<ChannelDescriptor>> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            self.reconnect_locked(&mut slot).await?;
        }
        match slot.as_deref() {
            Some(session) => session.channels().await,
            None => Err(LinkError::NotConnected),
        }
    }

    /// Nodes the current session has seen; zero when disconnected.
    pub async fn node_count(&self) -> usize {
        self.session
            .lock()
            .await
            .as_deref()
            .map_or(0, |s| s.node_count())
    }

    /// Idempotent.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
            info!("Outbound link disconnected");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Close the link, letting a send already holding the session finish for
    /// up to `grace`. After that the send stops at its next chunk and the
    /// session is closed anyway. Later sends fail with [`LinkError::Closed`]
    /// until [`connect`](Self::connect) is called again.
    pub async fn shutdown(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.disconnect()).await.is_err() {
            warn!("Device sends still in flight after {:?}; abandoning them", grace);
            self.shutting_down.store(true, Ordering::Relaxed);
            if tokio::time::timeout(grace, self.disconnect()).await.is_err() {
                warn!("Device session did not release; leaving it to be dropped");
                self.state.send_replace(ConnectionState::Disconnected);
            }
        }
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDevice;

    fn link(device: &MockDevice) -> OutboundLink {
        let tuning = OutboundTuning {
            chunk_pause: Duration::from_millis(10),
            ..OutboundTuning::default()
        };
        OutboundLink::new(
            Arc::new(device.clone()),
            tuning,
            Arc::new(SelfIdentity::new("llm_agent")),
            Arc::new(NodeRegistry::new()),
        )
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        let waits: Vec<u64> = (0..6)
            .map(|i| backoff_delay(base, cap, i).as_secs())
            .collect();
        assert_eq!(waits, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }

    #[test]
    fn channel_resolution_precedence() {
        let channels = vec![
            ChannelDescriptor::new(0, "Primary"),
            ChannelDescriptor::new(1, "llm-chat"),
            ChannelDescriptor::new(2, "LLM"),
        ];
        assert_eq!(resolve_channel_index(&channels, "llm", 7), 2);
        assert_eq!(resolve_channel_index(&channels, "chat", 7), 1);
        assert_eq!(resolve_channel_index(&channels, "weather", 7), 7);
        assert_eq!(resolve_channel_index(&channels, "", 7), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_backs_off_between_attempts() {
        let device = MockDevice::new(0x1234);
        device.fail_next_opens(3);
        let link = link(&device);
        let started = tokio::time::Instant::now();
        link.connect(4, Duration::from_secs(2)).await.unwrap();
        // 2 + 4 + 8 seconds of waiting before the fourth attempt.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(14) && waited < Duration::from_secs(15));
        assert_eq!(device.open_count(), 4);
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_retries() {
        let device = MockDevice::new(1);
        device.fail_next_opens(10);
        let link = link(&device);
        assert!(link.connect(2, Duration::from_millis(100)).await.is_err());
        assert_eq!(device.open_count(), 3);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_identity_query_is_a_failed_attempt() {
        let device = MockDevice::new(0xbeef);
        device.fail_next_identity(1);
        let link = link(&device);
        link.connect(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(device.open_count(), 2);
        assert_eq!(link.identity.node_num(), Some(0xbeef));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_reset_reconnects_exactly_once() {
        let device = MockDevice::new(5);
        let link = link(&device);
        link.connect(0, Duration::from_millis(10)).await.unwrap();
        device.fail_next_send(LinkError::TransportReset("peer reset".into()));
        link.send("hello", Some("!0000000a")).await.unwrap();
        assert_eq!(link.reconnect_count(), 1);
        assert_eq!(device.open_count(), 2);
        let sent = device.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, Destination::Node(10));
        assert_eq!(sent[0].channel, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_reset_is_reported() {
        let device = MockDevice::new(5);
        let link = link(&device);
        link.connect(0, Duration::from_millis(10)).await.unwrap();
        device.fail_next_send(LinkError::TransportReset("one".into()));
        device.fail_next_send(LinkError::TransportReset("two".into()));
        let err = link.send("hello", None).await.unwrap_err();
        assert!(err.is_transport_reset());
        assert_eq!(link.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let device = MockDevice::new(5);
        let link = link(&device);
        link.connect(0, Duration::from_millis(10)).await.unwrap();
        device.fail_next_send(LinkError::Timeout("device send"));
        assert!(link.send("hello", None).await.is_err());
        assert_eq!(link.reconnect_count(), 0);
        assert!(device.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_session_connects_lazily() {
        let device = MockDevice::new(5);
        let link = link(&device);
        link.send("hi", None).await.unwrap();
        assert_eq!(device.open_count(), 1);
        assert_eq!(device.sent_texts(), vec!["hi".to_string()]);
        assert_eq!(device.sent()[0].destination, Destination::Broadcast);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_send_resolves_name_and_chunks() {
        let device = MockDevice::new(5).with_channels(&[(0, "Primary"), (2, "LLM")]);
        let link = link(&device);
        link.connect(0, Duration::from_millis(10)).await.unwrap();
        link.send_to_channel(&"y".repeat(200), "LLM").await.unwrap();
        let sent = device.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.channel == 2));
        assert!(sent[0].text.starts_with("[1/2] "));
        assert!(sent[1].text.starts_with("[2/2] "));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_a_long_send_and_closes_the_session() {
        let device = MockDevice::new(5);
        let link = Arc::new(link(&device));
        link.connect(0, Duration::from_millis(10)).await.unwrap();
        let total = chunk_message(&"z".repeat(190 * 40)).len();

        let sender = link.clone();
        let send = tokio::spawn(async move { sender.send(&"z".repeat(190 * 40), None).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        link.shutdown(Duration::from_millis(50)).await;

        assert!(matches!(send.await.unwrap(), Err(LinkError::Closed)));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        let sent = device.sent().len();
        assert!(sent > 0 && sent < total, "sent {} of {}", sent, total);
        assert_eq!(link.reconnect_count(), 0);

        // Nothing reopens the device after shutdown.
        assert!(matches!(link.send("late", None).await, Err(LinkError::Closed)));
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_a_short_send() {
        let device = MockDevice::new(5);
        let link = Arc::new(link(&device));
        link.connect(0, Duration::from_millis(10)).await.unwrap();

        let sender = link.clone();
        let send = tokio::spawn(async move { sender.send(&"q".repeat(400), None).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        link.shutdown(Duration::from_millis(200)).await;

        send.await.unwrap().unwrap();
        assert_eq!(device.sent().len(), 3);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_destination_is_rejected_without_sending() {
        let device = MockDevice::new(5);
        let link = link(&device);
        let err = link.send("hi", Some("not-a-node")).await.unwrap_err();
        assert!(matches!(err, LinkError::InvalidDestination(_)));
        assert_eq!(device.open_count(), 0);
    }
}
