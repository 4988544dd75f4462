//! Meshtastic TCP stream session.
//!
//! A session owns one TCP connection split into halves. A reader task decodes
//! `FromRadio` frames into shared [`DeviceState`]; writes (text, heartbeats) go
//! through a mutex on the write half so frames never interleave.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use prost::Message as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use super::frame::{self, StreamFramer, START2};
use super::{format_node_id, Destination, DeviceConnector, DeviceIdentity, DeviceSession};
use crate::bridge::message::ChannelDescriptor;
use crate::config::Config;
use crate::error::{LinkError, LinkResult};
use crate::logutil::{hex_snippet, truncate_for_log};
use crate::protobuf::meshtastic_generated as proto;

/// Opens [`TcpDeviceSession`]s against one `host:port`.
#[derive(Debug, Clone)]
pub struct TcpDeviceConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    heartbeat_interval: Option<Duration>,
}

impl TcpDeviceConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(300)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let heartbeat = match config.device.heartbeat_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self::new(config.device.effective_host(&config.broker), config.device.port)
            .with_handshake_timeout(config.device.handshake_timeout())
            .with_heartbeat(heartbeat)
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[async_trait]
impl DeviceConnector for TcpDeviceConnector {
    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    async fn open(&self) -> LinkResult<Box<dyn DeviceSession>> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!("Opening Meshtastic TCP session to {}", addr);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| LinkError::Timeout("device tcp connect"))??;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed on {}: {}", addr, e);
        }
        let session = TcpDeviceSession::start(stream, addr, self.handshake_timeout);
        if let Err(e) = session.begin_handshake().await {
            session.close().await;
            return Err(e);
        }
        if let Some(interval) = self.heartbeat_interval {
            session.spawn_heartbeat(interval);
        }
        Ok(Box::new(session))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Ready,
    Closed,
}

/// What the reader has learned from the device so far.
#[derive(Debug, Default)]
struct DeviceState {
    my_node_num: Option<u32>,
    nodes: HashMap<u32, String>,
    channels: BTreeMap<u32, ChannelDescriptor>,
    closed_reason: Option<String>,
}

pub struct TcpDeviceSession {
    peer: String,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    state: Arc<Mutex<DeviceState>>,
    phase: watch::Receiver<Phase>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    handshake_timeout: Duration,
}

impl TcpDeviceSession {
    fn start(stream: TcpStream, peer: String, handshake_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        let state = Arc::new(Mutex::new(DeviceState::default()));
        let (phase_tx, phase_rx) = watch::channel(Phase::Handshaking);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(read_loop(
            read_half,
            peer.clone(),
            state.clone(),
            phase_tx,
            shutdown_rx,
        ));
        Self {
            peer,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            state,
            phase: phase_rx,
            shutdown: shutdown_tx,
            tasks: Mutex::new(vec![reader]),
            closed: AtomicBool::new(false),
            handshake_timeout,
        }
    }

    async fn begin_handshake(&self) -> LinkResult<()> {
        // Wake a sleeping radio and flush any half-parsed frame on its side.
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&[START2; 32]).await?;
            writer.flush().await?;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let config_id = rand::random::<u32>().max(1);
        debug!("Requesting device config (want_config_id=0x{:08x}) from {}", config_id, self.peer);
        self.write_frame(&frame::want_config(config_id)).await
    }

    fn spawn_heartbeat(&self, interval: Duration) {
        let writer = self.writer.clone();
        let mut shutdown = self.shutdown.subscribe();
        let peer = self.peer.clone();
        let task = tokio::spawn(async move {
            let mut nonce: u32 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        nonce = nonce.wrapping_add(1);
                        let bytes = match frame::encode_frame(&frame::heartbeat(nonce)) {
                            Ok(b) => b,
                            Err(e) => { warn!("heartbeat encode failed: {}", e); break; }
                        };
                        let mut w = writer.lock().await;
                        if let Err(e) = w.write_all(&bytes).await {
                            debug!("heartbeat to {} failed, stopping heartbeats: {}", peer, e);
                            break;
                        }
                        trace!("heartbeat nonce={} sent to {}", nonce, peer);
                    }
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    async fn write_frame(&self, msg: &proto::ToRadio) -> LinkResult<()> {
        let bytes = frame::encode_frame(msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        trace!("ToRadio {} bytes to {}: {}", bytes.len(), self.peer, hex_snippet(&bytes, 32));
        Ok(())
    }

    fn ensure_open(&self) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &state.closed_reason {
            Some(reason) => Err(LinkError::TransportReset(reason.clone())),
            None => Ok(()),
        }
    }

    async fn wait_ready(&self) -> LinkResult<()> {
        let mut phase = self.phase.clone();
        let reached = timeout(
            self.handshake_timeout,
            phase.wait_for(|p| *p != Phase::Handshaking),
        )
        .await
        .map_err(|_| LinkError::Timeout("device config handshake"))?;
        match reached.map(|p| *p) {
            Ok(Phase::Ready) => Ok(()),
            _ => {
                let reason = self
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .closed_reason
                    .clone()
                    .unwrap_or_else(|| "connection closed".to_string());
                Err(LinkError::Handshake(reason))
            }
        }
    }
}

#[async_trait]
impl DeviceSession for TcpDeviceSession {
    async fn my_info(&self) -> LinkResult<DeviceIdentity> {
        self.wait_ready().await?;
        self.ensure_open()?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let node_num = state
            .my_node_num
            .ok_or_else(|| LinkError::Handshake("device did not report my_info".to_string()))?;
        Ok(DeviceIdentity {
            node_num,
            node_id: format_node_id(node_num),
            long_name: state.nodes.get(&node_num).cloned(),
        })
    }

    async fn channels(&self) -> LinkResult<Vec<ChannelDescriptor>> {
        self.wait_ready().await?;
        self.ensure_open()?;
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.channels.values().cloned().collect())
    }

    fn node_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).nodes.len()
    }

    async fn send_text(&self, text: &str, destination: Destination, channel: u32) -> LinkResult<()> {
        self.ensure_open()?;
        let from = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .my_node_num
            .unwrap_or(0);
        let id = rand::random::<u32>().max(1);
        let msg = frame::text_packet(from, destination.addr(), channel, text, id);
        self.write_frame(&msg).await?;
        debug!(
            "Sent text packet id={} to=0x{:08x} channel={} via {}: '{}'",
            id,
            destination.addr(),
            channel,
            self.peer,
            truncate_for_log(text, 80)
        );
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(bytes) = frame::encode_frame(&frame::disconnect()) {
            let mut writer = self.writer.lock().await;
            let _ = timeout(Duration::from_secs(1), writer.write_all(&bytes)).await;
            let _ = writer.shutdown().await;
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!("Closed Meshtastic TCP session to {}", self.peer);
    }
}

impl Drop for TcpDeviceSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: String,
    state: Arc<Mutex<DeviceState>>,
    phase: watch::Sender<Phase>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 1024];
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break "session closed locally".to_string(),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break "device closed the connection".to_string(),
                Ok(n) => {
                    framer.push(&buf[..n]);
                    while let Some(payload) = framer.next_frame() {
                        handle_from_radio(&payload, &peer, &state, &phase);
                    }
                }
                Err(e) => break e.to_string(),
            }
        }
    };
    debug!("Meshtastic reader for {} stopping: {}", peer, reason);
    state
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .closed_reason
        .get_or_insert(reason);
    phase.send_replace(Phase::Closed);
}

fn handle_from_radio(
    payload: &[u8],
    peer: &str,
    state: &Mutex<DeviceState>,
    phase: &watch::Sender<Phase>,
) {
    use proto::from_radio::PayloadVariant;

    let msg = match proto::FromRadio::decode(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!(
                "Undecodable FromRadio from {} ({} bytes, {}): {}",
                peer,
                payload.len(),
                hex_snippet(payload, 16),
                e
            );
            return;
        }
    };
    let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
    match msg.payload_variant {
        Some(PayloadVariant::MyInfo(info)) => {
            debug!("my_info: node {}", format_node_id(info.my_node_num));
            st.my_node_num = Some(info.my_node_num);
        }
        Some(PayloadVariant::NodeInfo(node)) => {
            let name = node
                .user
                .as_ref()
                .map(|u| u.long_name.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format_node_id(node.num));
            trace!("node_info {} = {}", format_node_id(node.num), name);
            st.nodes.insert(node.num, name);
        }
        Some(PayloadVariant::Channel(ch)) => {
            let index = u32::try_from(ch.index).unwrap_or(0);
            let role = ch.role();
            if role == proto::channel::Role::Disabled {
                st.channels.remove(&index);
            } else {
                let name = ch.settings.map(|s| s.name).unwrap_or_default();
                debug!("channel {} = '{}' ({:?})", index, name, role);
                st.channels.insert(index, ChannelDescriptor::new(index, name));
            }
        }
        Some(PayloadVariant::ConfigCompleteId(id)) => {
            info!(
                "Device {} config complete (id=0x{:08x}, {} nodes, {} channels)",
                peer,
                id,
                st.nodes.len(),
                st.channels.len()
            );
            phase.send_replace(Phase::Ready);
        }
        Some(PayloadVariant::Rebooted(_)) => {
            warn!("Device {} reported a reboot", peer);
        }
        Some(PayloadVariant::Packet(pkt)) => {
            trace!("mesh packet from 0x{:08x} on channel {}", pkt.from, pkt.channel);
        }
        None => {}
    }
}
