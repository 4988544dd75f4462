//! Regular-traffic queue.
//!
//! Regular mesh messages are handed to a single worker task through an
//! unbounded FIFO so a slow responder never blocks the broker dispatcher.
//! Exactly one consumer runs, so replies leave in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::message::Message;

/// Receives every classified message, from both the dispatcher and the worker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

pub enum QueueCommand {
    Enqueue(Message),
    Snapshot(oneshot::Sender<QueueStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub handled_total: u64,
}

#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueSender {
    /// False once the worker has stopped.
    pub fn enqueue(&self, message: Message) -> bool {
        self.tx.send(QueueCommand::Enqueue(message)).is_ok()
    }

    pub async fn snapshot(&self) -> Option<QueueStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QueueCommand::Snapshot(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }
}

pub struct QueueHandle {
    sender: QueueSender,
    join: JoinHandle<()>,
}

impl QueueHandle {
    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    /// Ask the worker to stop after the message in hand, waiting at most
    /// `timeout`. Queued messages not yet started are discarded.
    pub async fn shutdown(self, timeout: Duration) {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.tx.send(QueueCommand::Shutdown(tx));
        let mut join = self.join;
        let stopped = tokio::time::timeout(timeout, async {
            let _ = rx.await;
            let _ = (&mut join).await;
        })
        .await;
        if stopped.is_err() {
            warn!("Regular queue worker did not stop within {:?}; aborting", timeout);
            join.abort();
        }
    }
}

pub fn start_regular_queue(handler: Arc<dyn MessageHandler>) -> QueueHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueueCommand>();
    let sender = QueueSender { tx };

    let join = tokio::spawn(async move {
        let mut pending = VecDeque::new();
        let mut handled_total = 0u64;
        loop {
            // Drain whatever is already waiting so snapshot/shutdown stay responsive.
            let cmd = if pending.is_empty() {
                match rx.recv().await {
                    Some(cmd) => Some(cmd),
                    None => break,
                }
            } else {
                rx.try_recv().ok()
            };
            match cmd {
                Some(QueueCommand::Enqueue(message)) => {
                    pending.push_back(message);
                    continue;
                }
                Some(QueueCommand::Snapshot(resp)) => {
                    let _ = resp.send(QueueStats {
                        queued: pending.len(),
                        handled_total,
                    });
                    continue;
                }
                Some(QueueCommand::Shutdown(done)) => {
                    if !pending.is_empty() {
                        debug!("Discarding {} queued regular messages", pending.len());
                    }
                    let _ = done.send(());
                    break;
                }
                None => {}
            }
            if let Some(message) = pending.pop_front() {
                handler.handle(message).await;
                handled_total += 1;
            }
        }
        debug!("regular queue worker terminated");
    });

    QueueHandle { sender, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::message::Origin;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, message: Message) {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push(message.text().to_string());
        }
    }

    fn msg(text: &str) -> Message {
        Message::new(
            text.to_string(),
            "!a".to_string(),
            "broadcast".to_string(),
            false,
            Origin::Regular,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn processes_in_fifo_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_millis(50),
        });
        let handle = start_regular_queue(recorder.clone());
        let sender = handle.sender();
        for text in ["one", "two", "three"] {
            assert!(sender.enqueue(msg(text)));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["one", "two", "three"]);
        let stats = sender.snapshot().await.unwrap();
        assert_eq!(stats.handled_total, 3);
        assert_eq!(stats.queued, 0);
        handle.shutdown(Duration::from_secs(1)).await;
        assert!(!sender.enqueue(msg("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_stuck_handler() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            delay: Duration::from_secs(3600),
        });
        let handle = start_regular_queue(recorder.clone());
        handle.sender().enqueue(msg("slow"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown(Duration::from_secs(2)).await;
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
