//! The bridge: one inbound link, one outbound link, one responder.
//!
//! Replies prefer the device. A reply that cannot leave over the device falls
//! back to a broker publish on the response topic, but only for messages that
//! came in on the dedicated channel; plain mesh traffic never falls back.
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::inbound::InboundLink;
use super::message::{Message, NodeRegistry, Origin, SelfIdentity, BROADCAST};
use super::outbound::{OutboundLink, OutboundTuning};
use super::queue::MessageHandler;
use crate::broker::mqtt::MqttConnector;
use crate::broker::BrokerConnector;
use crate::config::Config;
use crate::error::{LinkError, LinkResult};
use crate::logutil::truncate_for_log;
use crate::meshtastic::tcp::TcpDeviceConnector;
use crate::meshtastic::DeviceConnector;
use crate::metrics;
use crate::responder::Responder;

/// How the bridge came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// Both links are up.
    Hybrid,
    /// The device could not be reached; inbound still works and dedicated
    /// replies go out through the broker.
    InboundOnly,
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeMode::Hybrid => write!(f, "hybrid"),
            BridgeMode::InboundOnly => write!(f, "inbound-only"),
        }
    }
}

#[derive(Debug, Clone)]
struct ReplyPolicy {
    private_mode: bool,
    reply_retries: u32,
    reply_retry_delay: Duration,
    channel_enabled: bool,
    response_channel: String,
    mirror_dedicated_direct: bool,
    startup_banner: bool,
    banner: String,
    shutdown_send_timeout: Duration,
}

impl ReplyPolicy {
    fn from_config(config: &Config) -> Self {
        Self {
            private_mode: config.bridge.private_mode,
            reply_retries: config.bridge.reply_retries,
            reply_retry_delay: config.bridge.reply_retry_delay(),
            channel_enabled: config.channel.enabled,
            response_channel: config.channel.response_channel_name(),
            mirror_dedicated_direct: config.bridge.mirror_dedicated_direct,
            startup_banner: config.bridge.startup_banner,
            banner: banner_text(config),
            shutdown_send_timeout: config.bridge.shutdown_send_timeout(),
        }
    }
}

/// Startup announcement. Always begins with the configured banner text, which
/// the classifier uses to recognise the announcement when it comes back.
pub fn banner_text(config: &Config) -> String {
    let mut banner = config.bridge.banner_text.trim().to_string();
    if config.bridge.private_mode {
        banner.push_str(" (Private mode: only responding to direct messages)");
    }
    if config.channel.enabled {
        banner.push_str(&format!(" (Listening on channel: {})", config.channel.topic));
    }
    banner
}

struct BridgeCore {
    inbound: InboundLink,
    outbound: OutboundLink,
    responder: RwLock<Option<Arc<dyn Responder>>>,
    policy: ReplyPolicy,
    identity: Arc<SelfIdentity>,
}

#[derive(Clone)]
pub struct Bridge {
    core: Arc<BridgeCore>,
}

impl Bridge {
    pub fn new(
        config: &Config,
        broker: Arc<dyn BrokerConnector>,
        device: Arc<dyn DeviceConnector>,
    ) -> Self {
        let identity = Arc::new(SelfIdentity::new(config.bridge.identity_label.trim()));
        let registry = Arc::new(NodeRegistry::new());
        let inbound = InboundLink::new(config, broker, identity.clone(), registry.clone());
        let outbound = OutboundLink::new(
            device,
            OutboundTuning::from_config(&config.device),
            identity.clone(),
            registry,
        );
        Self {
            core: Arc::new(BridgeCore {
                inbound,
                outbound,
                responder: RwLock::new(None),
                policy: ReplyPolicy::from_config(config),
                identity,
            }),
        }
    }

    /// MQTT inbound and Meshtastic TCP outbound, as configured.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(MqttConnector::new(config.broker.clone())),
            Arc::new(TcpDeviceConnector::from_config(config)),
        )
    }

    /// Replaces any previously registered responder.
    pub fn set_responder(&self, responder: Arc<dyn Responder>) {
        *self
            .core
            .responder
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(responder);
    }

    pub fn inbound(&self) -> &InboundLink {
        &self.core.inbound
    }

    pub fn outbound(&self) -> &OutboundLink {
        &self.core.outbound
    }

    pub fn identity(&self) -> &Arc<SelfIdentity> {
        &self.core.identity
    }

    /// Bring up the inbound link (required) and then the device (optional).
    pub async fn connect(&self) -> LinkResult<BridgeMode> {
        let handler: Arc<dyn MessageHandler> = self.core.clone();
        self.core.inbound.connect(handler).await?;

        let tuning = self.core.outbound.tuning().clone();
        let mode = match self
            .core
            .outbound
            .connect(tuning.connect_retries, tuning.backoff_base)
            .await
        {
            Ok(()) => BridgeMode::Hybrid,
            Err(e) => {
                warn!(
                    "Device link unavailable ({}); running inbound-only, replies will fall back to the broker",
                    e
                );
                BridgeMode::InboundOnly
            }
        };
        info!("Bridge connected in {} mode", mode);
        if self.core.policy.startup_banner {
            self.core.announce(mode).await;
        }
        Ok(mode)
    }

    /// Run one message through the responder and reply policy, as the links
    /// do for inbound traffic.
    pub async fn process(&self, message: Message) {
        self.core.process(message).await;
    }

    /// Stop the queue worker, close both links and log the counters. Sends
    /// still running after the configured grace period are abandoned.
    pub async fn shutdown(&self) {
        self.core.inbound.disconnect().await;
        self.core
            .outbound
            .shutdown(self.core.policy.shutdown_send_timeout)
            .await;
        let snapshot = metrics::snapshot();
        info!(
            "Bridge stopped: {}",
            serde_json::to_string(&snapshot).unwrap_or_default()
        );
    }
}

/// Aborts the responder call when whoever awaits it is cancelled.
struct ResponderTask<T>(JoinHandle<T>);

impl<T> Drop for ResponderTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl MessageHandler for BridgeCore {
    async fn handle(&self, message: Message) {
        self.process(message).await;
    }
}

impl BridgeCore {
    async fn process(&self, message: Message) {
        let responder = self
            .responder
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(responder) = responder else {
            debug!("No responder registered; ignoring message");
            return;
        };

        // A panicking responder takes down only its own task.
        let request = message.clone();
        let mut task =
            ResponderTask(tokio::spawn(async move { responder.respond(&request).await }));
        let outcome = (&mut task.0).await;
        let reply = match outcome {
            Ok(Ok(Some(text))) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                debug!("Responder had nothing to say to {}", message.from_id());
                return;
            }
            Ok(Err(e)) => {
                metrics::inc_responder_errors();
                warn!("Responder failed for {}: {:#}", message.from_id(), e);
                return;
            }
            Err(e) => {
                metrics::inc_responder_errors();
                error!("Responder task aborted for {}: {}", message.from_id(), e);
                return;
            }
        };
        debug!(
            "Reply to {} ({}): {}",
            message.from_id(),
            message.origin(),
            truncate_for_log(&reply, 80)
        );
        self.deliver(&message, &reply).await;
    }

    async fn deliver(&self, message: &Message, reply: &str) {
        match message.origin() {
            Origin::DedicatedChannel => {
                if self.policy.mirror_dedicated_direct
                    && !self
                        .reply_via_device(message, reply, Some(message.from_id()))
                        .await
                {
                    return;
                }
                match self
                    .outbound
                    .send_to_channel(reply, &self.policy.response_channel)
                    .await
                {
                    Ok(()) => metrics::inc_replies_sent(),
                    Err(e) => {
                        metrics::inc_replies_failed();
                        warn!(
                            "Channel reply on {} failed: {}",
                            self.policy.response_channel, e
                        );
                        self.publish_fallback(message, reply).await;
                    }
                }
            }
            Origin::Regular => {
                let to = if message.is_direct() || self.policy.private_mode {
                    Some(message.from_id())
                } else {
                    None
                };
                self.reply_via_device(message, reply, to).await;
            }
        }
    }

    /// Direct or broadcast reply with retries. On final failure, messages from
    /// the dedicated channel are published to the response topic instead.
    async fn reply_via_device(&self, message: &Message, reply: &str, to: Option<&str>) -> bool {
        match self.send_with_retries(reply, to).await {
            Ok(()) => {
                metrics::inc_replies_sent();
                true
            }
            Err(e) => {
                metrics::inc_replies_failed();
                warn!(
                    "Reply to {} failed after retries: {}",
                    to.unwrap_or(BROADCAST),
                    e
                );
                if message.origin() == Origin::DedicatedChannel {
                    self.publish_fallback(message, reply).await;
                }
                false
            }
        }
    }

    async fn send_with_retries(&self, reply: &str, to: Option<&str>) -> LinkResult<()> {
        let attempts = self.policy.reply_retries + 1;
        let mut attempt = 1;
        loop {
            match self.outbound.send(reply, to).await {
                Ok(()) => return Ok(()),
                Err(e @ LinkError::InvalidDestination(_)) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!("Reply attempt {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.policy.reply_retry_delay).await;
                }
            }
        }
    }

    /// `sendtext` envelope as published on the response topic.
    fn envelope(&self, text: &str, to_id: &str, is_response: bool) -> Value {
        let mut payload = json!({
            "text": text,
            "from_id": self.identity.node_id_or_label(),
            "to_id": to_id,
        });
        if is_response {
            payload["is_response"] = Value::Bool(true);
        }
        json!({
            "from": self.identity.node_num().unwrap_or(0),
            "type": "sendtext",
            "payload": payload,
        })
    }

    async fn publish_fallback(&self, message: &Message, reply: &str) {
        let to_id = if self.policy.private_mode {
            message.from_id()
        } else {
            BROADCAST
        };
        let envelope = self.envelope(reply, to_id, true);
        match self
            .inbound
            .publish_to_response_topic(envelope.to_string().into_bytes())
            .await
        {
            Ok(()) => {
                metrics::inc_fallback_published();
                info!("Reply to {} published to the response topic", message.from_id());
            }
            Err(e) => {
                metrics::inc_fallback_failed();
                error!("Fallback publish for {} failed: {}", message.from_id(), e);
            }
        }
    }

    async fn announce(&self, mode: BridgeMode) {
        let banner = &self.policy.banner;
        if mode == BridgeMode::Hybrid {
            if let Err(e) = self.outbound.send(banner, None).await {
                warn!("Startup banner broadcast failed: {}", e);
            }
        }
        if self.policy.channel_enabled {
            let envelope = self.envelope(banner, BROADCAST, false);
            if let Err(e) = self
                .inbound
                .publish_to_response_topic(envelope.to_string().into_bytes())
                .await
            {
                warn!("Startup banner publish failed: {}", e);
            }
        }
    }
}
