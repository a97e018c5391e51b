//! The delivery queue.
//!
//! A mutex-guarded in-memory list of [`QueuedMessage`]s serviced by a
//! single background task. Every five seconds (and once immediately on
//! start) the task sweeps the list: items whose retry time has passed are
//! handed to the delivery seam through a worker-pool semaphore, failures
//! are rescheduled with jittered exponential backoff, successes leave the
//! queue. A sweep joins all of its attempts before the next tick runs.
//!
//! There is no retry ceiling: an item that keeps failing stays queued for
//! the life of the process. The spool file written at accept time is the
//! durable record; rehydrating the queue from it on restart is left to
//! operators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferropost_common::audit;
use ferropost_metrics::Metrics;
use tokio::sync::{watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use crate::driver::Deliver;
use crate::retry;
use crate::types::QueuedMessage;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Cloneable handle to the delivery queue.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<Vec<QueuedMessage>>,
    workers: usize,
    deliverer: Arc<dyn Deliver>,
    metrics: Arc<Metrics>,
    quit: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Builder for [`Manager`]. Workers default to the number of logical
/// CPUs; metrics default to the process-wide instance.
pub struct Builder {
    deliverer: Arc<dyn Deliver>,
    workers: usize,
    metrics: Arc<Metrics>,
}

impl Builder {
    /// Override the worker-pool size. Values below 1 are ignored.
    pub fn workers(mut self, workers: usize) -> Self {
        if workers >= 1 {
            self.workers = workers;
        }
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Manager {
        let (quit, _) = watch::channel(false);
        Manager {
            inner: Arc::new(Inner {
                queue: Mutex::new(Vec::new()),
                workers: self.workers,
                deliverer: self.deliverer,
                metrics: self.metrics,
                quit,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }
}

impl Manager {
    pub fn builder(deliverer: Arc<dyn Deliver>) -> Builder {
        Builder {
            deliverer,
            workers: num_cpus::get().max(1),
            metrics: Metrics::global(),
        }
    }

    /// Add a message to the queue. Items with an empty payload are logged
    /// and dropped without touching any counter. A first-time enqueue with
    /// no retry time scheduled becomes due immediately.
    pub fn enqueue(&self, mut msg: QueuedMessage) {
        if msg.payload.is_empty() {
            tracing::warn!(id = %msg.id, to = %msg.to, "discarding message: missing payload");
            return;
        }

        let depth = {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            if msg.attempts == 0 && msg.next_retry.is_none() {
                msg.next_retry = Some(Instant::now());
            }
            tracing::info!(id = %msg.id, to = %msg.to, attempt = msg.attempts, "queued message");
            audit!("queue enqueue {} -> {} attempt {}", msg.id, msg.to, msg.attempts);
            queue.push(msg);
            queue.len()
        };
        self.inner.metrics.inc_queued();
        self.inner.metrics.set_queue_depth(depth);
    }

    /// Current queue length.
    pub fn depth(&self) -> usize {
        self.inner.queue.lock().expect("queue lock poisoned").len()
    }

    /// Start the background sweeper. Subsequent calls are no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let mut quit = self.inner.quit.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            inner.sweep().await;
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = tick.tick() => inner.sweep().await,
                }
            }
            tracing::debug!("queue manager stopped");
        });
    }

    /// Signal the background sweeper to exit. Idempotent; in-flight
    /// delivery attempts are not pre-empted.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.quit.send(true);
    }

    /// Run one sweep over the queue, delivering everything currently due.
    /// This is what the background task runs on each tick; exposed so
    /// controlled environments can drain the queue deterministically.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }
}

impl Inner {
    async fn sweep(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            let (due, remaining) = queue
                .drain(..)
                .partition(|msg: &QueuedMessage| msg.next_retry.is_none_or(|at| at <= now));
            *queue = remaining;
            self.metrics.set_queue_depth(queue.len());
            due
        };

        if due.is_empty() {
            return;
        }
        tracing::debug!(due = due.len(), "sweeping delivery queue");

        let pool = Arc::new(Semaphore::new(self.workers.max(1)));
        let attempts: Vec<_> = due
            .into_iter()
            .map(|msg| {
                let inner = Arc::clone(self);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let Ok(_permit) = pool.acquire_owned().await else {
                        return;
                    };
                    inner.attempt(msg).await;
                })
            })
            .collect();
        futures_util::future::join_all(attempts).await;
    }

    async fn attempt(&self, mut msg: QueuedMessage) {
        match self
            .deliverer
            .deliver(&msg.from, &msg.to, msg.payload.bytes())
            .await
        {
            Ok(()) => {
                tracing::info!(id = %msg.id, to = %msg.to, attempts = msg.attempts, "delivered message");
                self.metrics.inc_delivered();
                audit!("queue delivered {} -> {} attempts {}", msg.id, msg.to, msg.attempts);
            }
            Err(err) => {
                msg.attempts += 1;
                let delay = retry::backoff(msg.attempts);
                msg.next_retry = Some(Instant::now() + delay);
                msg.last_error = err.to_string();
                tracing::warn!(
                    id = %msg.id,
                    to = %msg.to,
                    attempt = msg.attempts,
                    retry_in = ?delay,
                    error = %err,
                    "delivery failed, scheduled retry"
                );
                self.metrics.inc_failures();
                audit!(
                    "queue retry {} -> {} attempt {} error {}",
                    msg.id,
                    msg.to,
                    msg.attempts,
                    msg.last_error
                );

                let depth = {
                    let mut queue = self.queue.lock().expect("queue lock poisoned");
                    queue.push(msg);
                    queue.len()
                };
                self.metrics.set_queue_depth(depth);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use ferropost_common::address::Mailbox;

    use super::*;
    use crate::error::DeliveryError;
    use crate::types::Payload;

    struct ScriptedDeliverer {
        /// Number of leading calls that fail.
        failures: AtomicUsize,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedDeliverer {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Deliver for ScriptedDeliverer {
        async fn deliver(
            &self,
            _from: &Mailbox,
            to: &Mailbox,
            _data: &[u8],
        ) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(DeliveryError::NoMxRecords {
                    domain: to.domain().unwrap_or("?").to_string(),
                });
            }
            Ok(())
        }
    }

    fn message(id: &str) -> QueuedMessage {
        QueuedMessage::new(
            id.to_string(),
            Mailbox::parse("a@relay.test").unwrap(),
            Mailbox::parse("b@example.net").unwrap(),
            Payload::new(b"Subject: x\r\n\r\nhi\r\n".to_vec()),
        )
    }

    fn manager(deliverer: Arc<ScriptedDeliverer>) -> (Manager, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let manager = Manager::builder(deliverer)
            .workers(4)
            .metrics(Arc::clone(&metrics))
            .build();
        (manager, metrics)
    }

    #[tokio::test]
    async fn enqueue_sets_first_retry_to_now() {
        let (manager, metrics) = manager(ScriptedDeliverer::failing(0));
        manager.enqueue(message("m1"));

        assert_eq!(manager.depth(), 1);
        assert_eq!(metrics.messages_queued(), 1);
        assert_eq!(metrics.queue_depth(), 1);
        let queue = manager.inner.queue.lock().unwrap();
        assert!(queue[0].next_retry.is_some());
    }

    #[tokio::test]
    async fn empty_payload_is_dropped_without_counters() {
        let (manager, metrics) = manager(ScriptedDeliverer::failing(0));
        let mut msg = message("m1");
        msg.payload = Payload::new(Vec::new());
        manager.enqueue(msg);

        assert_eq!(manager.depth(), 0);
        assert_eq!(metrics.messages_queued(), 0);
    }

    #[tokio::test]
    async fn sweep_delivers_due_items() {
        let deliverer = ScriptedDeliverer::failing(0);
        let (manager, metrics) = manager(Arc::clone(&deliverer));
        manager.enqueue(message("m1"));
        manager.enqueue(message("m2"));

        manager.sweep().await;

        assert_eq!(manager.depth(), 0);
        assert_eq!(metrics.messages_delivered(), 2);
        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_items_are_rescheduled_with_backoff() {
        let (manager, metrics) = manager(ScriptedDeliverer::failing(1));
        manager.enqueue(message("m1"));

        manager.sweep().await;

        assert_eq!(manager.depth(), 1);
        assert_eq!(metrics.delivery_failures(), 1);
        assert_eq!(metrics.messages_delivered(), 0);
        {
            let queue = manager.inner.queue.lock().unwrap();
            let msg = &queue[0];
            assert_eq!(msg.attempts, 1);
            assert!(!msg.last_error.is_empty());
            let wait = msg.next_retry.unwrap() - Instant::now();
            assert!(
                wait >= Duration::from_secs(60) && wait < Duration::from_secs(75),
                "unexpected backoff {wait:?}"
            );
        }

        // Not yet due: a sweep now must leave it untouched.
        manager.sweep().await;
        assert_eq!(manager.depth(), 1);

        // After the backoff window it delivers.
        tokio::time::advance(Duration::from_secs(76)).await;
        manager.sweep().await;
        assert_eq!(manager.depth(), 0);
        assert_eq!(metrics.messages_delivered(), 1);
        assert_eq!(metrics.queue_depth(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_leaves_depth_alone() {
        let (manager, _metrics) = manager(ScriptedDeliverer::failing(0));
        manager.enqueue(message("m1"));
        manager.stop();
        manager.stop();
        assert_eq!(manager.depth(), 1);
    }

    #[tokio::test]
    async fn start_is_one_shot_and_sweeps_immediately() {
        let deliverer = ScriptedDeliverer::failing(0);
        let (manager, metrics) = manager(Arc::clone(&deliverer));
        manager.enqueue(message("m1"));

        manager.start();
        manager.start();

        // The immediate sweep drains the queue shortly after start.
        for _ in 0..50 {
            if manager.depth() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.depth(), 0);
        assert_eq!(metrics.messages_delivered(), 1);
        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 1);
        manager.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_bound_concurrent_attempts() {
        let deliverer = ScriptedDeliverer::slow(Duration::from_millis(30));
        let metrics = Arc::new(Metrics::new());
        let manager = Manager::builder(Arc::clone(&deliverer) as Arc<dyn Deliver>)
            .workers(2)
            .metrics(metrics)
            .build();
        for i in 0..6 {
            manager.enqueue(message(&format!("m{i}")));
        }

        manager.sweep().await;

        assert_eq!(deliverer.calls.load(Ordering::SeqCst), 6);
        assert!(deliverer.max_concurrent.load(Ordering::SeqCst) <= 2);
    }
}
