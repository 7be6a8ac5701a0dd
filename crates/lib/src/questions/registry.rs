//! Pending question registry: (chat, user, kind) -> rendezvous slot.
//!
//! A slot is unbuffered. The reading side posts a one-shot reply cell and waits on it;
//! the delivering side takes the oldest posted cell and fills it. Nothing moves until
//! both sides are present. Concurrent deliveries to one key queue on a fair lock, so
//! they are consumed in the order they arrived. Cells left by readers that gave up are
//! skipped by the deliverer and pruned whenever the reader posts again.

use super::error::{AnswerError, QuestionError};
use crate::update::{Answer, CorrelationKey};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SHARDS: usize = 16;

type ReplyCell = oneshot::Sender<Answer>;

/// Reply cells posted by the reader, oldest first.
#[derive(Default)]
struct ReplyQueue {
    cells: Mutex<VecDeque<ReplyCell>>,
    posted: Notify,
}

struct Slot {
    id: u64,
    replies: Arc<ReplyQueue>,
    /// Held for the whole of one delivery; fair, so deliveries go in arrival order.
    deliveries: Mutex<()>,
    /// Cancelled when the slot is released or the registry root is cancelled.
    closed: CancellationToken,
}

/// Result of handing an event to the registry.
#[derive(Debug)]
pub enum Delivery {
    /// A waiting reader took the event.
    Delivered,
    /// Nobody is waiting on this key (or the reader left first); the event is returned untouched.
    Unmatched(Answer),
}

/// Proof of registration, used to release exactly the slot that was created.
#[derive(Debug)]
pub struct SlotHandle {
    key: CorrelationKey,
    id: u64,
    closed: CancellationToken,
}

impl SlotHandle {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }
}

/// Reading side of a slot, handed to the question handler.
pub struct Answers {
    key: CorrelationKey,
    replies: Arc<ReplyQueue>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Answers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Answers").field("key", &self.key).finish()
    }
}

impl Answers {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// Wait for the next matching event. None once the question is closed
    /// (released or the manager shut down).
    pub async fn next(&self) -> Option<Answer> {
        self.wait(None).await.ok()
    }

    /// Like `next`, but also gives up when `cancel` fires.
    pub async fn next_or_cancel(&self, cancel: &CancellationToken) -> Result<Answer, AnswerError> {
        self.wait(Some(cancel)).await
    }

    pub async fn next_timeout(&self, timeout: Duration) -> Result<Answer, AnswerError> {
        match tokio::time::timeout(timeout, self.wait(None)).await {
            Ok(res) => res,
            Err(_) => Err(AnswerError::TimedOut(timeout)),
        }
    }

    async fn wait(&self, cancel: Option<&CancellationToken>) -> Result<Answer, AnswerError> {
        if self.closed.is_cancelled() {
            return Err(AnswerError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut cells = self.replies.cells.lock().await;
            cells.retain(|cell| !cell.is_closed());
            cells.push_back(tx);
        }
        self.replies.posted.notify_one();
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            answer = rx => answer.map_err(|_| AnswerError::Closed),
            _ = self.closed.cancelled() => Err(AnswerError::Closed),
            _ = cancelled => Err(AnswerError::Cancelled),
        }
    }
}

/// Sharded map of pending questions. Each shard is guarded by one exclusive lock;
/// keys are spread across shards by conversation.
pub struct PendingRegistry {
    shards: Vec<Mutex<HashMap<CorrelationKey, Arc<Slot>>>>,
    root: CancellationToken,
    next_id: AtomicU64,
}

impl PendingRegistry {
    /// `shards` is clamped to at least 1. Slots close when `root` is cancelled.
    pub fn new(shards: usize, root: CancellationToken) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            root,
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &CorrelationKey) -> &Mutex<HashMap<CorrelationKey, Arc<Slot>>> {
        let mut hasher = DefaultHasher::new();
        key.conversation.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Create the slot for `key`. Fails with `AlreadyPending` while another slot is live.
    pub async fn register(&self, key: CorrelationKey) -> Result<(SlotHandle, Answers), QuestionError> {
        let mut shard = self.shard(&key).lock().await;
        if shard.contains_key(&key) {
            return Err(QuestionError::AlreadyPending(key));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replies = Arc::new(ReplyQueue::default());
        let closed = self.root.child_token();
        shard.insert(
            key,
            Arc::new(Slot {
                id,
                replies: replies.clone(),
                deliveries: Mutex::new(()),
                closed: closed.clone(),
            }),
        );
        log::debug!("registry: registered slot {} for {}", id, key);
        let handle = SlotHandle {
            key,
            id,
            closed: closed.clone(),
        };
        let answers = Answers {
            key,
            replies,
            closed,
        };
        Ok((handle, answers))
    }

    /// Hand `answer` to whoever waits on `key`. Returns immediately when no slot exists,
    /// otherwise blocks until the reader takes it or the slot closes.
    pub async fn deliver(&self, key: &CorrelationKey, answer: Answer) -> Delivery {
        let slot = self.shard(key).lock().await.get(key).cloned();
        let Some(slot) = slot else {
            return Delivery::Unmatched(answer);
        };
        let _turn = slot.deliveries.lock().await;
        let mut answer = answer;
        loop {
            let cell = slot.replies.cells.lock().await.pop_front();
            let Some(cell) = cell else {
                let posted = tokio::select! {
                    biased;
                    _ = slot.replies.posted.notified() => true,
                    _ = slot.closed.cancelled() => false,
                };
                if !posted {
                    log::debug!("registry: slot {} for {} closed before delivery", slot.id, key);
                    return Delivery::Unmatched(answer);
                }
                continue;
            };
            match cell.send(answer) {
                Ok(()) => return Delivery::Delivered,
                // Reader stopped waiting (timeout or cancel); try its next request.
                Err(back) => answer = back,
            }
        }
    }

    /// Remove whatever slot is registered for `key`. No-op when absent.
    pub async fn deregister(&self, key: &CorrelationKey) {
        if let Some(slot) = self.shard(key).lock().await.remove(key) {
            slot.closed.cancel();
            log::debug!("registry: deregistered slot {} for {}", slot.id, key);
        }
    }

    /// Remove the slot `handle` created, leaving any newer slot for the same key alone.
    pub async fn release(&self, handle: &SlotHandle) {
        {
            let mut shard = self.shard(&handle.key).lock().await;
            if shard.get(&handle.key).is_some_and(|s| s.id == handle.id) {
                shard.remove(&handle.key);
            }
        }
        handle.closed.cancel();
        log::debug!("registry: released slot {} for {}", handle.id, handle.key);
    }

    pub async fn contains(&self, key: &CorrelationKey) -> bool {
        self.shard(key).lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.lock().await.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
