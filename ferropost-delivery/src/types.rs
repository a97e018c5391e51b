use std::sync::Arc;

use ferropost_common::address::Mailbox;
use tokio::time::Instant;

/// Immutable message bytes shared across every recipient envelope spawned
/// by one DATA phase. Cloning is an `Arc` bump; the bytes are never
/// mutated after construction.
#[derive(Clone, Debug)]
pub struct Payload {
    data: Arc<[u8]>,
}

impl Payload {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether two payloads share the same underlying allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// One message awaiting delivery to a single recipient. Fan-out happens at
/// enqueue time: a DATA phase with N recipients produces N of these, all
/// holding the same [`Payload`].
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub id: String,
    pub from: Mailbox,
    pub to: Mailbox,
    pub payload: Payload,
    pub attempts: u32,
    /// `None` until first enqueued, at which point it becomes "now".
    pub next_retry: Option<Instant>,
    pub last_error: String,
}

impl QueuedMessage {
    pub fn new(id: String, from: Mailbox, to: Mailbox, payload: Payload) -> Self {
        Self {
            id,
            from,
            to,
            payload,
            attempts: 0,
            next_retry: None,
            last_error: String::new(),
        }
    }
}
