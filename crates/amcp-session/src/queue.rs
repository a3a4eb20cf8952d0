use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Mutex;

use amcp_types::{Priority, QueuedMessage};

struct QueueEntry {
    priority: Priority,
    queued_at: DateTime<Utc>,
    seq: u64,
    message: QueuedMessage,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority pops first; within a priority class,
        // earlier enqueue (timestamp, then sequence) wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SessionQueue {
    heap: BinaryHeap<QueueEntry>,
    busy: bool,
    owner: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub session_id: String,
    pub busy: bool,
    pub queued_count: usize,
}

/// Per-session priority queues plus the busy flag that makes a session
/// process at most one prompt at a time.
pub struct QueueManager {
    queues: Mutex<HashMap<String, SessionQueue>>,
    seq: AtomicU64,
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub async fn enqueue(&self, message: QueuedMessage) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(message.session_id.clone()).or_default();
        queue.heap.push(QueueEntry {
            priority: message.priority,
            queued_at: message.queued_at,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            message,
        });
    }

    /// Atomically take exclusive processing rights for a session. Returns
    /// false if another owner already holds it.
    pub async fn acquire(&self, session_id: &str, owner: &str) -> bool {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(session_id.to_string()).or_default();
        if queue.busy {
            return false;
        }
        queue.busy = true;
        queue.owner = Some(owner.to_string());
        true
    }

    /// Finish one prompt. If another message is waiting, the session stays
    /// busy (re-acquired on behalf of the caller) and the highest-priority
    /// message is returned; otherwise the session goes idle.
    pub async fn release(&self, session_id: &str) -> Option<QueuedMessage> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(session_id.to_string()).or_default();

        match queue.heap.pop() {
            Some(entry) => Some(entry.message),
            None => {
                queue.busy = false;
                queue.owner = None;
                None
            }
        }
    }

    pub async fn is_busy(&self, session_id: &str) -> bool {
        let queues = self.queues.lock().await;
        queues.get(session_id).is_some_and(|q| q.busy)
    }

    pub async fn owner(&self, session_id: &str) -> Option<String> {
        let queues = self.queues.lock().await;
        queues.get(session_id).and_then(|q| q.owner.clone())
    }

    pub async fn queued_count(&self, session_id: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(session_id).map_or(0, |q| q.heap.len())
    }

    pub async fn clear(&self, session_id: &str) -> usize {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(session_id) {
            Some(queue) => {
                let count = queue.heap.len();
                queue.heap.clear();
                count
            }
            None => 0,
        }
    }

    /// Drop all queue state for a deleted session.
    pub async fn remove(&self, session_id: &str) -> usize {
        let mut queues = self.queues.lock().await;
        queues.remove(session_id).map_or(0, |q| q.heap.len())
    }

    pub async fn status(&self, session_id: &str) -> QueueStatus {
        let queues = self.queues.lock().await;
        let queue = queues.get(session_id);
        QueueStatus {
            session_id: session_id.to_string(),
            busy: queue.is_some_and(|q| q.busy),
            queued_count: queue.map_or(0, |q| q.heap.len()),
        }
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}
