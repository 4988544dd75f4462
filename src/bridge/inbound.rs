//! Inbound link: the subscribe side of the bridge.
//!
//! The broker session feeds [`BrokerEvent`]s into a dispatcher task. The
//! dispatcher re-subscribes on every (re)connect, classifies publishes, keeps
//! the node registry current, runs dedicated-channel messages inline and pushes
//! regular traffic onto the single-worker queue.
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::classify::{classify, Classified, ClassifierConfig, DropReason};
use super::message::{ConnectionState, Node, NodeRegistry, Origin, SelfIdentity};
use super::queue::{start_regular_queue, MessageHandler, QueueHandle, QueueSender};
use crate::broker::{BrokerConnector, BrokerEvent, BrokerSession};
use crate::config::Config;
use crate::error::{LinkError, LinkResult};
use crate::logutil::{escape_log, truncate_for_log};
use crate::metrics;

struct Running {
    session: Arc<dyn BrokerSession>,
    dispatcher: JoinHandle<()>,
    stop: watch::Sender<bool>,
    queue: QueueHandle,
}

pub struct InboundLink {
    connector: Arc<dyn BrokerConnector>,
    classifier: ClassifierConfig,
    subscriptions: Vec<String>,
    nodeinfo_request_topic: Option<String>,
    response_topic: Option<String>,
    identity: Arc<SelfIdentity>,
    registry: Arc<NodeRegistry>,
    connect_timeout: Duration,
    queue_join_timeout: Duration,
    shutdown_send_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

impl InboundLink {
    pub fn new(
        config: &Config,
        connector: Arc<dyn BrokerConnector>,
        identity: Arc<SelfIdentity>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let response_topic = if config.channel.enabled {
            Some(config.channel.response_topic.clone())
        } else {
            None
        };
        let request_topic = config.broker.nodeinfo_request_topic.trim();
        Self {
            connector,
            classifier: ClassifierConfig::from_config(config),
            subscriptions: subscription_filters(config),
            nodeinfo_request_topic: (!request_topic.is_empty()).then(|| request_topic.to_string()),
            response_topic,
            identity,
            registry,
            connect_timeout: config.broker.connect_timeout(),
            queue_join_timeout: config.bridge.queue_join_timeout(),
            shutdown_send_timeout: config.bridge.shutdown_send_timeout(),
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel tracking [`ConnectionState`] transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Open the broker session and start dispatching to `handler`. Returns once
    /// the first CONNACK has been seen and subscriptions are issued, or fails
    /// after the connect timeout with everything torn down again.
    pub async fn connect(&self, handler: Arc<dyn MessageHandler>) -> LinkResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        info!("Connecting inbound link to {}", self.connector.describe());
        self.state.send_replace(ConnectionState::Connecting);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = match self.connector.open(events_tx).await {
            Ok(session) => session,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let queue = start_regular_queue(handler.clone());
        let (stop, stop_rx) = watch::channel(false);
        let dispatcher = Dispatcher {
            session: session.clone(),
            classifier: self.classifier.clone(),
            subscriptions: self.subscriptions.clone(),
            nodeinfo_request_topic: self.nodeinfo_request_topic.clone(),
            identity: self.identity.clone(),
            registry: self.registry.clone(),
            state: self.state.clone(),
            handler,
            queue: queue.sender(),
            stop: stop_rx,
        };
        let mut state_rx = self.state.subscribe();
        let dispatcher = tokio::spawn(dispatcher.run(events_rx));

        let reached = tokio::time::timeout(
            self.connect_timeout,
            state_rx.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await;
        if !matches!(reached, Ok(Ok(_))) {
            warn!(
                "Inbound link did not connect within {:?}; giving up",
                self.connect_timeout
            );
            dispatcher.abort();
            queue.shutdown(self.queue_join_timeout).await;
            session.close().await;
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(LinkError::Timeout("broker connect"));
        }

        *running = Some(Running {
            session,
            dispatcher,
            stop,
            queue,
        });
        Ok(())
    }

    /// Best-effort publish to the response topic. Not retried here.
    pub async fn publish_to_response_topic(&self, payload: Vec<u8>) -> LinkResult<()> {
        let topic = self
            .response_topic
            .as_deref()
            .ok_or(LinkError::NotConfigured("response topic"))?;
        let session = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|r| r.session.clone())
                .ok_or(LinkError::NotConnected)?
        };
        session.publish(topic, payload).await?;
        debug!("Published to {}", topic);
        Ok(())
    }

    /// Idempotent. A dedicated-channel message already being handled gets
    /// `shutdown_send_timeout` to finish before the dispatcher is aborted.
    pub async fn disconnect(&self) {
        let taken = self.running.lock().await.take();
        let Some(mut running) = taken else {
            return;
        };
        running.stop.send_replace(true);
        running.queue.shutdown(self.queue_join_timeout).await;
        let grace = self.shutdown_send_timeout;
        if tokio::time::timeout(grace, &mut running.dispatcher).await.is_err() {
            warn!("Inbound dispatcher still busy after {:?}; aborting it", grace);
            running.dispatcher.abort();
        }
        running.session.close().await;
        self.registry.clear();
        self.state.send_replace(ConnectionState::Disconnected);
        info!("Inbound link disconnected");
    }

    /// Regular queue depth and throughput, while connected.
    pub async fn queue_stats(&self) -> Option<super::queue::QueueStats> {
        let sender = {
            let running = self.running.lock().await;
            running.as_ref().map(|r| r.queue.sender())?
        };
        sender.snapshot().await
    }
}

/// Regular receive, node info, and for the dedicated channel both its exact
/// topic and the parent wildcard.
fn subscription_filters(config: &Config) -> Vec<String> {
    let mut filters = vec![
        config.broker.regular_topic.clone(),
        config.broker.nodeinfo_topic.clone(),
    ];
    if config.channel.enabled {
        let topic = config.channel.topic.clone();
        if let Some((parent, _)) = topic.rsplit_once('/') {
            if !parent.is_empty() {
                filters.push(format!("{}/#", parent));
            }
        }
        filters.push(topic);
    }
    let mut unique = Vec::with_capacity(filters.len());
    for filter in filters {
        if !filter.is_empty() && !unique.contains(&filter) {
            unique.push(filter);
        }
    }
    unique
}

struct Dispatcher {
    session: Arc<dyn BrokerSession>,
    classifier: ClassifierConfig,
    subscriptions: Vec<String>,
    nodeinfo_request_topic: Option<String>,
    identity: Arc<SelfIdentity>,
    registry: Arc<NodeRegistry>,
    state: Arc<watch::Sender<ConnectionState>>,
    handler: Arc<dyn MessageHandler>,
    queue: QueueSender,
    stop: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Runs until the event channel closes or a stop is signalled. The stop is
    /// only observed between events, so a handler in progress completes.
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                BrokerEvent::Connected => self.on_connected().await,
                BrokerEvent::Disconnected(reason) => {
                    warn!("Inbound link lost broker connection: {}", reason);
                    self.state.send_replace(ConnectionState::Connecting);
                }
                BrokerEvent::Message { topic, payload } => self.on_publish(&topic, &payload).await,
            }
        }
        debug!("inbound dispatcher terminated");
    }

    async fn on_connected(&self) {
        for filter in &self.subscriptions {
            if let Err(e) = self.session.subscribe(filter).await {
                warn!("Subscribe to {} failed: {}", filter, e);
            }
        }
        if let Some(topic) = &self.nodeinfo_request_topic {
            if let Err(e) = self.session.publish(topic, Vec::new()).await {
                debug!("Node info request failed: {}", e);
            }
        }
        info!("Inbound link connected ({} subscriptions)", self.subscriptions.len());
        self.state.send_replace(ConnectionState::Connected);
    }

    async fn on_publish(&self, topic: &str, payload: &[u8]) {
        match classify(&self.classifier, &self.identity, topic, payload) {
            Classified::Message(message) => {
                info!(
                    "{} message from {}: {}",
                    message.origin(),
                    self.registry.display_name(message.from_id()),
                    truncate_for_log(message.text(), 120)
                );
                match message.origin() {
                    Origin::DedicatedChannel => {
                        metrics::inc_inbound_dedicated();
                        self.handler.handle(message).await;
                    }
                    Origin::Regular => {
                        metrics::inc_inbound_regular();
                        if !self.queue.enqueue(message) {
                            warn!("Regular queue is closed; dropping message");
                        }
                    }
                }
            }
            Classified::NodeInfo(node) => self.on_node_info(node),
            Classified::Dropped(reason) => {
                trace!("Dropped payload on {}: {:?}", topic, reason);
                match reason {
                    DropReason::EmptyText => metrics::inc_dropped_empty(),
                    DropReason::SelfEcho => metrics::inc_dropped_echo(),
                    DropReason::SelfSender => metrics::inc_dropped_self(),
                    DropReason::Malformed => metrics::inc_dropped_malformed(),
                }
            }
            Classified::Ignored => trace!("Ignoring publish on {}", topic),
        }
    }

    fn on_node_info(&self, node: Node) {
        metrics::inc_node_updates();
        if node.display_name == self.identity.label() {
            info!("Learned own node id {} from node info", node.id);
            self.identity.record_node_id(&node.id);
        }
        debug!("Node info: {} = {}", node.id, escape_log(&node.display_name));
        self.registry.upsert(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_subscriptions_cover_dedicated_channel() {
        let filters = subscription_filters(&Config::default());
        assert_eq!(
            filters,
            vec![
                "msh/+/rx".to_string(),
                "msh/+/nodeinfo".to_string(),
                "msh/US/2/json/llm/#".to_string(),
                "msh/US/2/json/llm/".to_string(),
            ]
        );
    }

    #[test]
    fn disabled_channel_subscribes_to_mesh_topics_only() {
        let mut config = Config::default();
        config.channel.enabled = false;
        assert_eq!(subscription_filters(&config).len(), 2);
    }
}
