//! Debug audit log.
//!
//! A process-wide, opt-in stream of diagnostic lines describing session and
//! queue activity. Enabled via `SMTP_DEBUG`; when disabled the whole path
//! is a single atomic load. Interested parties (tests, diagnostics) attach
//! with [`subscribe`]; delivery to subscribers never blocks, lines are
//! dropped when a subscriber's buffer is full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

use tokio::sync::mpsc;

use crate::config;

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Reload the `SMTP_DEBUG` flag from the environment.
pub fn refresh_from_env() {
    ENABLED.store(config::bool_env("SMTP_DEBUG", false), Ordering::Relaxed);
}

/// Enable or disable audit logging programmatically.
pub fn set(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Current audit logging state.
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

struct Registry {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        subscribers: RwLock::new(HashMap::new()),
        next_id: AtomicU64::new(0),
    })
}

/// A live audit subscription. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    /// Receive the next audit line. Returns `None` only if the process
    /// registry has been torn down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = registry().subscribers.write() {
            subscribers.remove(&self.id);
        }
    }
}

/// Register an audit subscriber with the given channel buffer (minimum 1).
pub fn subscribe(buffer: usize) -> Subscription {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let registry = registry();
    let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
    registry
        .subscribers
        .write()
        .expect("audit registry lock poisoned")
        .insert(id, tx);
    Subscription { id, rx }
}

/// Record one audit line. No-op unless auditing is enabled. Prefer the
/// [`audit!`](crate::audit!) macro, which skips formatting when disabled.
pub fn record(line: String) {
    if !enabled() {
        return;
    }
    tracing::debug!(target: "ferropost::audit", "{line}");
    let Ok(subscribers) = registry().subscribers.read() else {
        return;
    };
    for tx in subscribers.values() {
        // Non-blocking: a slow subscriber loses lines rather than stalling
        // the session or queue that produced them.
        let _ = tx.try_send(line.clone());
    }
}

/// Format and record an audit line when auditing is enabled.
#[macro_export]
macro_rules! audit {
    ($($arg:tt)*) => {
        if $crate::audit::enabled() {
            $crate::audit::record(format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // The enabled flag is process-global; serialise the tests that flip it.
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[tokio::test]
    async fn lines_reach_subscribers_when_enabled() {
        let _guard = GUARD.lock().unwrap();
        set(true);
        let mut sub = subscribe(8);
        record("queue enqueue abc".to_string());
        assert_eq!(sub.recv().await.as_deref(), Some("queue enqueue abc"));
        set(false);
    }

    #[tokio::test]
    async fn disabled_audit_is_silent() {
        let _guard = GUARD.lock().unwrap();
        set(false);
        let mut sub = subscribe(8);
        record("should not appear".to_string());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_buffers_drop_instead_of_blocking() {
        let _guard = GUARD.lock().unwrap();
        set(true);
        let mut sub = subscribe(1);
        record("first".to_string());
        record("second".to_string());
        // Only the first line fits; the second was dropped.
        assert_eq!(sub.try_recv().as_deref(), Some("first"));
        assert!(sub.try_recv().is_none());
        set(false);
    }

    #[tokio::test]
    async fn dropped_subscription_unregisters() {
        let _guard = GUARD.lock().unwrap();
        set(true);
        let sub = subscribe(4);
        let id = sub.id;
        drop(sub);
        assert!(!registry().subscribers.read().unwrap().contains_key(&id));
        set(false);
    }
}
