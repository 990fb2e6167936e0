//! Bounded four-level priority queue for outbound messages.
//!
//! The connection manager's drain loop always pulls the oldest envelope of
//! the highest non-empty priority class. On overflow the queue sheds up to
//! 10% of its capacity, evicting `Low` envelopes first and `Normal` second,
//! before rejecting new enqueues.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Outbound message priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub enum MessagePriority {
    /// Informational traffic that can be delayed or shed
    Low = 0,
    /// Regular traffic (default)
    #[default]
    Normal = 1,
    /// Control traffic that should go out soon
    High = 2,
    /// Urgent traffic that must go out first
    Critical = 3,
}

/// An outbound message waiting in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique envelope identifier.
    pub id: Uuid,
    /// Connection this envelope belongs to.
    pub connection_id: Uuid,
    /// JSON payload to write to the transport.
    pub payload: serde_json::Value,
    /// Priority class.
    pub priority: MessagePriority,
    /// Number of delivery attempts so far.
    pub retry_count: u32,
    /// Unix timestamp in milliseconds at creation.
    pub created_at: i64,
}

impl MessageEnvelope {
    /// Wrap a payload for the given connection.
    pub fn new(connection_id: Uuid, payload: serde_json::Value, priority: MessagePriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            payload,
            priority,
            retry_count: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Capacity reached and eviction could not make room.
    #[error("queue full ({capacity} envelopes), nothing evictable")]
    Full { capacity: usize },
}

/// Envelope plus insertion sequence, for heap ordering.
#[derive(Debug, Clone)]
struct QueuedEnvelope {
    envelope: MessageEnvelope,
    sequence: u64,
}

impl PartialEq for QueuedEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedEnvelope {}

impl PartialOrd for QueuedEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; within a class, lower sequence (older) first
        match self.envelope.priority.cmp(&other.envelope.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedEnvelope>,
    sequence: u64,
}

/// Bounded priority buffer for outbound envelopes.
///
/// Cloning shares the underlying queue, so producers and the drain loop can
/// each hold a handle.
#[derive(Clone)]
pub struct PriorityMessageQueue {
    inner: Arc<Mutex<QueueInner>>,
    capacity: usize,
}

impl PriorityMessageQueue {
    /// Create a queue with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a queue bounded at `capacity` envelopes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                sequence: 0,
            })),
            capacity,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an envelope, evicting shedable traffic if the queue is full.
    pub async fn enqueue(&self, envelope: MessageEnvelope) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;

        if inner.heap.len() >= self.capacity {
            let evicted = Self::evict(&mut inner, self.capacity);
            if evicted == 0 && inner.heap.len() >= self.capacity {
                tracing::warn!(
                    connection_id = %envelope.connection_id,
                    "message queue full, rejecting enqueue"
                );
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
        }

        let sequence = inner.sequence;
        inner.sequence = inner.sequence.wrapping_add(1);
        inner.heap.push(QueuedEnvelope { envelope, sequence });
        Ok(())
    }

    /// Remove up to 10% of capacity, `Low` envelopes before `Normal`,
    /// oldest first within a class. `High` and `Critical` are never shed.
    fn evict(inner: &mut QueueInner, capacity: usize) -> usize {
        let budget = (capacity / 10).max(1);
        let mut kept: Vec<QueuedEnvelope> = inner.heap.drain().collect();
        let mut evicted = 0;

        for class in [MessagePriority::Low, MessagePriority::Normal] {
            while evicted < budget {
                let oldest = kept
                    .iter()
                    .enumerate()
                    .filter(|(_, q)| q.envelope.priority == class)
                    .min_by_key(|(_, q)| q.sequence)
                    .map(|(i, _)| i);
                match oldest {
                    Some(i) => {
                        let dropped = kept.swap_remove(i);
                        tracing::debug!(
                            envelope_id = %dropped.envelope.id,
                            priority = ?class,
                            "evicting envelope from full queue"
                        );
                        evicted += 1;
                    }
                    None => break,
                }
            }
            if evicted >= budget {
                break;
            }
        }

        inner.heap = kept.into_iter().collect();
        evicted
    }

    /// Pop the oldest envelope of the highest non-empty priority class.
    pub async fn dequeue(&self) -> Option<MessageEnvelope> {
        let mut inner = self.inner.lock().await;
        inner.heap.pop().map(|q| q.envelope)
    }

    /// Number of queued envelopes.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.heap.is_empty()
    }

    /// Number of queued envelopes for one connection.
    pub async fn pending_for(&self, connection_id: Uuid) -> usize {
        let inner = self.inner.lock().await;
        inner
            .heap
            .iter()
            .filter(|q| q.envelope.connection_id == connection_id)
            .count()
    }

    /// Drop all envelopes for a connection (teardown). Returns the count.
    pub async fn remove_connection(&self, connection_id: Uuid) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.heap.len();
        let kept: Vec<QueuedEnvelope> = inner
            .heap
            .drain()
            .filter(|q| q.envelope.connection_id != connection_id)
            .collect();
        inner.heap = kept.into_iter().collect();
        before - inner.heap.len()
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.inner.lock().await.heap.clear();
    }
}

impl Default for PriorityMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
