mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use meshbridge::bridge::{BridgeMode, ConnectionState, Message};
use meshbridge::error::LinkError;
use meshbridge::responder::{FnResponder, Responder};
use meshbridge::test_utils::MockBroker;

/// Answers after `delay`, recording that it got that far.
struct SlowResponder {
    delay: Duration,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Responder for SlowResponder {
    async fn respond(&self, _message: &Message) -> anyhow::Result<Option<String>> {
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(Some("late answer".to_string()))
    }
}

fn slow_responder(delay: Duration) -> (Arc<SlowResponder>, Arc<AtomicBool>) {
    let finished = Arc::new(AtomicBool::new(false));
    let responder = SlowResponder {
        delay,
        finished: finished.clone(),
    };
    (Arc::new(responder), finished)
}

#[tokio::test(start_paused = true)]
async fn connect_subscribes_and_requests_node_info() {
    let h = harness(None);
    h.bridge.connect().await.unwrap();
    assert_eq!(h.bridge.inbound().state(), ConnectionState::Connected);
    assert_eq!(h.bridge.outbound().state(), ConnectionState::Connected);

    let subs = h.broker.subscriptions();
    for expected in ["msh/+/rx", "msh/+/nodeinfo", "msh/US/2/json/llm/", "msh/US/2/json/llm/#"] {
        assert!(subs.iter().any(|s| s == expected), "missing {}", expected);
    }
    assert!(h
        .broker
        .published()
        .iter()
        .any(|(topic, payload)| topic == "msh/request/nodeinfo" && payload.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn broker_reconnect_reissues_subscriptions() {
    let h = harness(None);
    h.bridge.connect().await.unwrap();
    let first = h.broker.subscriptions().len();

    h.broker.drop_connection("keepalive timeout");
    wait_until("connecting state", || {
        h.bridge.inbound().state() == ConnectionState::Connecting
    })
    .await;
    h.broker.restore_connection();
    wait_until("connected state", || {
        h.bridge.inbound().state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(h.broker.subscriptions().len(), first * 2);
}

#[tokio::test(start_paused = true)]
async fn missing_connack_fails_connect_and_tears_down() {
    let h = harness_with(test_config(), MockBroker::new().without_connack(), device(), None);
    let err = h.bridge.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::Timeout(_)));
    assert_eq!(h.broker.close_count(), 1);
    assert_eq!(h.bridge.inbound().state(), ConnectionState::Disconnected);
    // The device is never tried when the inbound side is down.
    assert_eq!(h.device.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_degrades_to_inbound_only() {
    let d = device();
    d.fail_next_opens(1_000);
    let h = harness_with(test_config(), MockBroker::new(), d, Some("via broker"));
    assert_eq!(h.bridge.connect().await.unwrap(), BridgeMode::InboundOnly);
    assert_eq!(h.bridge.outbound().state(), ConnectionState::Disconnected);

    h.broker.inject(DEDICATED_TOPIC, r#"{"text":"anyone home?"}"#);
    wait_until("fallback publish", || !h.responses().is_empty()).await;
    let envelope = &h.responses()[0];
    assert_eq!(envelope["payload"]["text"], "via broker");
    // Identity was never learned from the device.
    assert_eq!(envelope["from"], 0);
    assert_eq!(envelope["payload"]["from_id"], "llm_agent");
}

#[tokio::test(start_paused = true)]
async fn startup_banner_goes_out_both_ways() {
    let mut config = test_config();
    config.bridge.startup_banner = true;
    let h = harness_with(config, MockBroker::new(), device(), None);
    h.bridge.connect().await.unwrap();

    let sent = h.device.sent_texts();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("📢 LLM Agent is now online"));
    assert!(sent[0].ends_with("(Listening on channel: msh/US/2/json/llm/)"));

    let announced = h.responses();
    assert_eq!(announced.len(), 1);
    assert_eq!(announced[0]["type"], "sendtext");
    assert!(announced[0]["payload"].get("is_response").is_none());
    assert_eq!(announced[0]["payload"]["to_id"], "broadcast");
}

#[tokio::test(start_paused = true)]
async fn own_banner_and_own_node_are_not_answered() {
    let h = harness(Some("should not happen"));
    h.bridge.connect().await.unwrap();

    h.broker.inject(
        DEDICATED_TOPIC,
        r#"{"type":"sendtext","payload":{"text":"📢 LLM Agent is now online and ready for conversations! (Listening on channel: msh/US/2/json/llm/)","from_id":"!12345678"}}"#,
    );
    h.broker.inject(
        REGULAR_TOPIC,
        r#"{"id":"x","fromId":"!0a0b0c0d","toId":"broadcast","channel":0,"text":"our own reply"}"#,
    );
    h.broker.inject(
        REGULAR_TOPIC,
        r#"{"id":"y","fromId":"168496141","toId":"broadcast","channel":0,"text":"decimal form of us"}"#,
    );
    h.broker.inject(
        REGULAR_TOPIC,
        r#"{"id":"z","fromId":"llm_agent","toId":"broadcast","channel":0,"text":"label"}"#,
    );
    h.broker.inject(REGULAR_TOPIC, "garbage that is not json");
    h.broker.inject(DEDICATED_TOPIC, r#"{"text":"   "}"#);
    settle().await;
    assert!(h.seen().is_empty());
    assert!(h.device.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn node_info_teaches_identity_to_the_inbound_side() {
    let d = device();
    d.fail_next_opens(1_000);
    let h = harness_with(test_config(), MockBroker::new(), d, Some("hello"));
    h.bridge.connect().await.unwrap();

    h.broker.inject(
        "msh/US/nodeinfo",
        r#"{"num":77,"user":{"id":"!0000004d","longName":"llm_agent","shortName":"LLM"}}"#,
    );
    wait_until("identity learned", || {
        h.bridge.identity().node_num() == Some(77)
    })
    .await;
    assert_eq!(
        h.bridge.inbound().registry().display_name("!0000004d"),
        "llm_agent"
    );

    h.broker.inject(
        REGULAR_TOPIC,
        r#"{"id":"1","fromId":"!0000004d","toId":"broadcast","channel":0,"text":"echo of us"}"#,
    );
    settle().await;
    assert!(h.seen().is_empty());
}

#[tokio::test(start_paused = true)]
async fn responder_failures_mean_no_reply() {
    let h = harness(None);
    h.bridge.set_responder(Arc::new(FnResponder(|m: &Message| {
        match m.text() {
            "boom" => panic!("responder blew up"),
            "err" => Err(anyhow::anyhow!("model offline")),
            other => Ok(Some(format!("re: {}", other))),
        }
    })));
    h.bridge.connect().await.unwrap();

    h.broker.inject(DEDICATED_TOPIC, "boom");
    h.broker.inject(DEDICATED_TOPIC, "err");
    h.broker.inject(DEDICATED_TOPIC, "still alive");
    wait_until("reply after failures", || !h.device.sent().is_empty()).await;
    settle().await;
    assert_eq!(h.device.sent_texts(), vec!["re: still alive".to_string()]);
    assert!(h.responses().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_both_links_once() {
    let h = harness(Some("bye"));
    h.bridge.connect().await.unwrap();
    h.bridge.shutdown().await;
    h.bridge.shutdown().await;

    assert_eq!(h.broker.close_count(), 1);
    assert_eq!(h.bridge.inbound().state(), ConnectionState::Disconnected);
    assert_eq!(h.bridge.outbound().state(), ConnectionState::Disconnected);
    assert!(!h.broker.inject(DEDICATED_TOPIC, "after shutdown"));
    assert!(matches!(
        h.bridge.inbound().publish_to_response_topic(b"x".to_vec()).await,
        Err(LinkError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_a_dedicated_reply_in_progress_finish() {
    let h = harness(None);
    let (responder, finished) = slow_responder(Duration::from_millis(50));
    h.bridge.set_responder(responder);
    h.bridge.connect().await.unwrap();

    h.broker.inject(DEDICATED_TOPIC, r#"{"text":"are you there?"}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.bridge.shutdown().await;

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(h.device.sent_texts(), vec!["late answer".to_string()]);
    assert_eq!(h.bridge.inbound().state(), ConnectionState::Disconnected);
    assert_eq!(h.bridge.outbound().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_a_responder_that_outlives_the_grace_period() {
    let h = harness(None);
    let (responder, finished) = slow_responder(Duration::from_secs(10));
    h.bridge.set_responder(responder);
    h.bridge.connect().await.unwrap();

    h.broker.inject(
        REGULAR_TOPIC,
        r#"{"id":"7","fromId":"!00000042","toId":"broadcast","channel":0,"text":"take your time"}"#,
    );
    h.broker.inject(DEDICATED_TOPIC, r#"{"text":"and you too"}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.bridge.shutdown().await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!finished.load(Ordering::SeqCst));
    assert!(h.device.sent().is_empty());
    assert!(h.responses().is_empty());
}
