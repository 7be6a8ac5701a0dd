//! Question manager: the inbound interceptor plus the ask-a-question entry points.

use super::error::QuestionError;
use super::limiter::{AdmissionPolicy, ConcurrencyLimiter, DEFAULT_MAX_CONCURRENT};
use super::registry::{Answers, Delivery, PendingRegistry, DEFAULT_SHARDS};
use super::session::{QuestionSession, SessionId, SessionOutcome};
use crate::channels::ChannelHandle;
use crate::config::QuestionsConfig;
use crate::update::{CallbackQuery, CorrelationKey, Message, Update};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const OUTCOME_CAPACITY: usize = 256;

/// Per-key update queues of the dispatch loop.
type Lanes = Arc<Mutex<HashMap<CorrelationKey, mpsc::UnboundedSender<Update>>>>;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub max_concurrent: usize,
    pub admission: AdmissionPolicy,
    pub registry_shards: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            admission: AdmissionPolicy::default(),
            registry_shards: DEFAULT_SHARDS,
        }
    }
}

impl From<&QuestionsConfig> for ManagerOptions {
    fn from(config: &QuestionsConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            admission: config.admission,
            registry_shards: config.registry_shards,
        }
    }
}

/// What `intercept` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// Handed to a waiting question; `next` was not called.
    Correlated,
    /// No question was waiting; `next` was called with the update.
    Forwarded,
}

struct Inner {
    registry: Arc<PendingRegistry>,
    limiter: ConcurrencyLimiter,
    root: CancellationToken,
    outcomes: broadcast::Sender<SessionOutcome>,
}

/// Shared handle; clones refer to the same registry and limiter.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// All sessions run under `root`; cancelling it stops new questions and closes waiting ones.
    pub fn new(root: CancellationToken, options: ManagerOptions) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(PendingRegistry::new(options.registry_shards, root.clone())),
                limiter: ConcurrencyLimiter::new(options.max_concurrent, options.admission, root.clone()),
                root,
                outcomes,
            }),
        }
    }

    pub fn with_defaults(root: CancellationToken) -> Self {
        Self::new(root, ManagerOptions::default())
    }

    /// Offer `update` to a waiting question. If none matches (or the update has no sender),
    /// `next` receives the update unchanged.
    ///
    /// On a match this waits until the question's handler reads the event, so callers
    /// should intercept different keys concurrently (see `run_dispatch`).
    pub async fn intercept<F, Fut>(&self, update: Update, next: F) -> Interception
    where
        F: FnOnce(Update) -> Fut,
        Fut: Future<Output = ()>,
    {
        let Some((key, answer)) = update.to_answer() else {
            next(update).await;
            return Interception::Forwarded;
        };
        match self.inner.registry.deliver(&key, answer).await {
            Delivery::Delivered => {
                log::debug!("update {} correlated to question for {}", update.update_id, key);
                Interception::Correlated
            }
            Delivery::Unmatched(_) => {
                next(update).await;
                Interception::Forwarded
            }
        }
    }

    /// Read updates until the channel closes or the manager shuts down.
    ///
    /// Updates for one correlation key go through a lane that intercepts them one at a
    /// time, so a question reads them in arrival order. Each lane runs on its own task, so
    /// one conversation's pending exchange never stalls another's. Updates without a key
    /// are forwarded on their own task.
    pub async fn run_dispatch<F, Fut>(&self, mut updates: mpsc::Receiver<Update>, next: F)
    where
        F: Fn(Update) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lanes: Lanes = Arc::default();
        loop {
            let update = tokio::select! {
                _ = self.inner.root.cancelled() => break,
                update = updates.recv() => match update {
                    Some(u) => u,
                    None => break,
                },
            };
            let Some(key) = update.correlation_key() else {
                let next = next.clone();
                tokio::spawn(async move { next(update).await });
                continue;
            };

            let mut map = lanes.lock().await;
            let update = match map.get(&key) {
                Some(lane) => match lane.send(update) {
                    Ok(()) => continue,
                    Err(mpsc::error::SendError(update)) => update,
                },
                None => update,
            };
            let (tx, rx) = mpsc::unbounded_channel();
            // Cannot fail: `rx` is alive.
            let _ = tx.send(update);
            map.insert(key, tx);
            drop(map);
            tokio::spawn(run_lane(self.clone(), key, rx, lanes.clone(), next.clone()));
        }
        log::info!("question dispatch loop stopped");
    }

    /// Ask `message`'s sender a question answered by their next plain message in the same chat.
    pub async fn ask_question<F, Fut>(
        &self,
        channel: Arc<dyn ChannelHandle>,
        message: &Message,
        handler: F,
    ) -> Result<SessionId, QuestionError>
    where
        F: FnOnce(CancellationToken, Arc<dyn ChannelHandle>, Answers) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = message
            .correlation_key()
            .ok_or(QuestionError::InvalidQuestionEvent("message has no sender"))?;
        self.ask(key, channel, handler).await
    }

    /// Ask the presser of an inline button a question answered by their next button press
    /// in the same chat.
    pub async fn ask_callback_question<F, Fut>(
        &self,
        channel: Arc<dyn ChannelHandle>,
        callback: &CallbackQuery,
        handler: F,
    ) -> Result<SessionId, QuestionError>
    where
        F: FnOnce(CancellationToken, Arc<dyn ChannelHandle>, Answers) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = callback
            .correlation_key()
            .ok_or(QuestionError::InvalidQuestionEvent("callback query has no message"))?;
        self.ask(key, channel, handler).await
    }

    async fn ask<F, Fut>(
        &self,
        key: CorrelationKey,
        channel: Arc<dyn ChannelHandle>,
        handler: F,
    ) -> Result<SessionId, QuestionError>
    where
        F: FnOnce(CancellationToken, Arc<dyn ChannelHandle>, Answers) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.root.is_cancelled() {
            return Err(QuestionError::ShuttingDown);
        }
        let registry = &self.inner.registry;
        let (handle, answers) = registry.register(key).await?;
        let permit = match self.inner.limiter.acquire().await {
            Ok(p) => p,
            Err(e) => {
                registry.release(&handle).await;
                return Err(e);
            }
        };
        let session = QuestionSession::new(
            handle,
            answers,
            registry.clone(),
            self.inner.root.child_token(),
            channel,
            self.inner.outcomes.clone(),
        );
        let id = session.id().clone();
        self.inner.limiter.spawn_with(permit, session.run(handler));
        Ok(id)
    }

    /// Change the concurrent session bound (applies to sessions admitted from now on).
    pub fn set_max_concurrent(&self, n: usize) {
        self.inner.limiter.set_max_concurrent(n);
    }

    pub fn running(&self) -> usize {
        self.inner.limiter.running()
    }

    /// Number of questions currently waiting on an answer key.
    pub async fn pending_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Outcome of every session that finishes after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Cancel the root context, close waiting questions, and wait for running sessions.
    pub async fn shutdown(&self) {
        log::info!("question manager shutting down");
        self.inner.limiter.drain().await;
        log::info!("question sessions finished");
    }
}

/// Intercept one key's updates in order. The lane removes itself from `lanes` once its
/// queue is empty; the emptiness check and the removal happen under the map lock the
/// dispatch loop sends under, so no update is stranded in a dead lane.
async fn run_lane<F, Fut>(
    manager: Manager,
    key: CorrelationKey,
    mut queue: mpsc::UnboundedReceiver<Update>,
    lanes: Lanes,
    next: F,
) where
    F: Fn(Update) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        while let Ok(update) = queue.try_recv() {
            manager.intercept(update, next.clone()).await;
        }
        let mut map = lanes.lock().await;
        match queue.try_recv() {
            Ok(update) => {
                drop(map);
                manager.intercept(update, next.clone()).await;
            }
            Err(_) => {
                map.remove(&key);
                log::trace!("dispatch lane for {} idle", key);
                return;
            }
        }
    }
}
