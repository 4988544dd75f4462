//! MQTT implementation of the broker session, backed by rumqttc.
//!
//! rumqttc drives the connection from `EventLoop::poll`; polling again after an
//! error reconnects, so the event-loop task below is also the reconnect loop.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{BrokerConnector, BrokerEvent, BrokerSession};
use crate::config::BrokerConfig;
use crate::error::{LinkError, LinkResult};
use crate::logutil::truncate_for_log;

/// Pause between poll attempts while the broker is unreachable.
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> MqttOptions {
        let client_id = self.config.client_id();
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    fn describe(&self) -> String {
        format!("mqtt://{}:{}", self.config.host, self.config.port)
    }

    async fn open(
        &self,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> LinkResult<Arc<dyn BrokerSession>> {
        let options = self.options();
        info!(
            "Opening MQTT session to {}:{} as {}",
            self.config.host,
            self.config.port,
            options.client_id()
        );
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_event_loop(eventloop, events, shutdown_rx));
        Ok(Arc::new(MqttSession {
            client,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MqttSession {
    client: AsyncClient,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, filter: &str) -> LinkResult<()> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| LinkError::Broker(e.to_string()))?;
        debug!("Subscribed to {}", filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> LinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| LinkError::Broker(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let requested = match self.client.disconnect().await {
            Ok(()) => true,
            Err(e) => {
                trace!("MQTT disconnect request failed: {}", e);
                false
            }
        };
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            // The loop exits by itself once DISCONNECT is on the wire.
            let flushed = requested
                && tokio::time::timeout(Duration::from_secs(2), &mut task)
                    .await
                    .is_ok();
            if !flushed {
                self.shutdown.send_replace(true);
                task.abort();
            }
        }
        info!("MQTT session closed");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connected = false;
    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = eventloop.poll() => polled,
        };
        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    Some(BrokerEvent::Connected)
                } else {
                    warn!("MQTT broker refused connection: {:?}", ack.code);
                    Some(BrokerEvent::Disconnected(format!("{:?}", ack.code)))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(
                    "MQTT publish on {}: {}",
                    publish.topic,
                    truncate_for_log(&String::from_utf8_lossy(&publish.payload), 100)
                );
                Some(BrokerEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT DISCONNECT sent");
                break;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected = false;
                Some(BrokerEvent::Disconnected("broker sent DISCONNECT".to_string()))
            }
            Ok(_) => None,
            Err(e) => {
                let event = if connected {
                    warn!("MQTT connection lost: {}", e);
                    Some(BrokerEvent::Disconnected(e.to_string()))
                } else {
                    debug!("MQTT connect attempt failed: {}", e);
                    None
                };
                connected = false;
                if let Some(event) = event {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                }
                continue;
            }
        };
        if let Some(event) = event {
            if events.send(event).is_err() {
                debug!("Broker event receiver dropped; stopping MQTT event loop");
                break;
            }
        }
    }
    debug!("MQTT event loop terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Reads one MQTT packet and returns its type.
    async fn read_packet(stream: &mut TcpStream) -> u8 {
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        header >> 4
    }

    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        assert_eq!(read_packet(&mut stream).await, 1, "expected CONNECT");
        stream.write_all(&CONNACK_ACCEPTED).await.unwrap();
        stream
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> BrokerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no broker event within 5s")
            .expect("event channel closed")
    }

    fn connector(port: u16) -> MqttConnector {
        MqttConnector::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..BrokerConfig::default()
        })
    }

    #[tokio::test]
    async fn event_loop_reports_connack_publish_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = connector(port).open(tx).await.unwrap();

        let mut stream = accept_session(&listener).await;
        assert_eq!(next_event(&mut events).await, BrokerEvent::Connected);

        let mut publish = vec![0x30, 13, 0x00, 0x09];
        publish.extend_from_slice(b"msh/US/rx");
        publish.extend_from_slice(b"hi");
        stream.write_all(&publish).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            BrokerEvent::Message {
                topic: "msh/US/rx".to_string(),
                payload: b"hi".to_vec(),
            }
        );

        drop(stream);
        assert!(matches!(
            next_event(&mut events).await,
            BrokerEvent::Disconnected(_)
        ));

        // Polling resumes after the pause and reconnects on its own.
        let _stream = accept_session(&listener).await;
        assert_eq!(next_event(&mut events).await, BrokerEvent::Connected);

        session.close().await;
        assert!(matches!(
            session.publish("msh/US/2/json/llmres/", b"x".to_vec()).await,
            Err(LinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_stays_silent_until_closed() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (tx, mut events) = mpsc::unbounded_channel();
        let session = connector(port).open(tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(events.try_recv().is_err());

        session.close().await;
        session.close().await;
    }
}
