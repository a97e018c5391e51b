//! Relay counters and gauges.
//!
//! A small fixed set of atomics incremented from the hot paths and
//! rendered as Prometheus-style text by the health plane. The process-wide
//! instance lives behind [`Metrics::global`]; components take an
//! `Arc<Metrics>` so tests can observe a private instance instead.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
pub struct Metrics {
    messages_queued: AtomicU64,
    messages_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    queue_depth: AtomicU64,
    sessions_active: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide metrics instance.
    pub fn global() -> Arc<Metrics> {
        static GLOBAL: OnceLock<Arc<Metrics>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Metrics::new())))
    }

    pub fn inc_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn inc_sessions(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_sessions(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn messages_queued(&self) -> u64 {
        self.messages_queued.load(Ordering::Relaxed)
    }

    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    /// Render all counters and gauges as Prometheus text exposition lines.
    pub fn render(&self) -> String {
        format!(
            "smtp_messages_queued_total {}\n\
             smtp_messages_delivered_total {}\n\
             smtp_delivery_failures_total {}\n\
             smtp_queue_depth {}\n\
             smtp_sessions_active {}\n",
            self.messages_queued(),
            self.messages_delivered(),
            self.delivery_failures(),
            self.queue_depth(),
            self.sessions_active(),
        )
    }
}
