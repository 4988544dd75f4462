//! Process-wide bridge counters.
//! Relaxed atomics; `start` logs a snapshot periodically and the bridge logs one on shutdown.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static INBOUND_REGULAR: AtomicU64 = AtomicU64::new(0);
static INBOUND_DEDICATED: AtomicU64 = AtomicU64::new(0);
static NODE_UPDATES: AtomicU64 = AtomicU64::new(0);
static DROPPED_EMPTY: AtomicU64 = AtomicU64::new(0);
static DROPPED_ECHO: AtomicU64 = AtomicU64::new(0);
static DROPPED_SELF: AtomicU64 = AtomicU64::new(0);
static DROPPED_MALFORMED: AtomicU64 = AtomicU64::new(0);
static RESPONDER_ERRORS: AtomicU64 = AtomicU64::new(0);
static REPLIES_SENT: AtomicU64 = AtomicU64::new(0);
static REPLIES_FAILED: AtomicU64 = AtomicU64::new(0);
static FALLBACK_PUBLISHED: AtomicU64 = AtomicU64::new(0);
static FALLBACK_FAILED: AtomicU64 = AtomicU64::new(0);
static DEVICE_RECONNECTS: AtomicU64 = AtomicU64::new(0);

pub fn inc_inbound_regular() {
    INBOUND_REGULAR.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbound_dedicated() {
    INBOUND_DEDICATED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_node_updates() {
    NODE_UPDATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dropped_empty() {
    DROPPED_EMPTY.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dropped_echo() {
    DROPPED_ECHO.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dropped_self() {
    DROPPED_SELF.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dropped_malformed() {
    DROPPED_MALFORMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_responder_errors() {
    RESPONDER_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_sent() {
    REPLIES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_failed() {
    REPLIES_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_fallback_published() {
    FALLBACK_PUBLISHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_fallback_failed() {
    FALLBACK_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_device_reconnects() {
    DEVICE_RECONNECTS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub inbound_regular: u64,
    pub inbound_dedicated: u64,
    pub node_updates: u64,
    pub dropped_empty: u64,
    pub dropped_echo: u64,
    pub dropped_self: u64,
    pub dropped_malformed: u64,
    pub responder_errors: u64,
    pub replies_sent: u64,
    pub replies_failed: u64,
    pub fallback_published: u64,
    pub fallback_failed: u64,
    pub device_reconnects: u64,
}

impl Snapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_empty + self.dropped_echo + self.dropped_self + self.dropped_malformed
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        inbound_regular: INBOUND_REGULAR.load(Ordering::Relaxed),
        inbound_dedicated: INBOUND_DEDICATED.load(Ordering::Relaxed),
        node_updates: NODE_UPDATES.load(Ordering::Relaxed),
        dropped_empty: DROPPED_EMPTY.load(Ordering::Relaxed),
        dropped_echo: DROPPED_ECHO.load(Ordering::Relaxed),
        dropped_self: DROPPED_SELF.load(Ordering::Relaxed),
        dropped_malformed: DROPPED_MALFORMED.load(Ordering::Relaxed),
        responder_errors: RESPONDER_ERRORS.load(Ordering::Relaxed),
        replies_sent: REPLIES_SENT.load(Ordering::Relaxed),
        replies_failed: REPLIES_FAILED.load(Ordering::Relaxed),
        fallback_published: FALLBACK_PUBLISHED.load(Ordering::Relaxed),
        fallback_failed: FALLBACK_FAILED.load(Ordering::Relaxed),
        device_reconnects: DEVICE_RECONNECTS.load(Ordering::Relaxed),
    }
}
