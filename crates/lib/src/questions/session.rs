//! One ask-a-question exchange: runs the handler and always releases its slot.

use super::error::SessionError;
use super::registry::{Answers, PendingRegistry, SlotHandle};
use crate::channels::ChannelHandle;
use crate::update::CorrelationKey;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Opaque session identifier (`q-<uuid>`), used in logs and outcome reports.
pub type SessionId = String;

/// Published once per session when its handler has returned and its slot is gone.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub key: CorrelationKey,
    pub result: Result<(), SessionError>,
}

pub(crate) struct QuestionSession {
    id: SessionId,
    handle: SlotHandle,
    answers: Answers,
    registry: Arc<PendingRegistry>,
    ctx: CancellationToken,
    channel: Arc<dyn ChannelHandle>,
    outcomes: broadcast::Sender<SessionOutcome>,
}

impl QuestionSession {
    pub(crate) fn new(
        handle: SlotHandle,
        answers: Answers,
        registry: Arc<PendingRegistry>,
        ctx: CancellationToken,
        channel: Arc<dyn ChannelHandle>,
        outcomes: broadcast::Sender<SessionOutcome>,
    ) -> Self {
        Self {
            id: format!("q-{}", uuid::Uuid::new_v4()),
            handle,
            answers,
            registry,
            ctx,
            channel,
            outcomes,
        }
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    /// Run the handler to completion, then release the slot and report how it ended.
    pub(crate) async fn run<F, Fut>(self, handler: F)
    where
        F: FnOnce(CancellationToken, Arc<dyn ChannelHandle>, Answers) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let QuestionSession {
            id,
            handle,
            answers,
            registry,
            ctx,
            channel,
            outcomes,
        } = self;
        let key = *handle.key();
        log::debug!("question {} started for {}", id, key);

        // Own task so a panic comes back as a JoinError instead of unwinding through us.
        let handler_ctx = ctx.clone();
        let joined = tokio::spawn(async move { handler(handler_ctx, channel, answers).await }).await;

        registry.release(&handle).await;
        ctx.cancel();

        let result = match joined {
            Ok(Ok(())) => {
                log::debug!("question {} finished for {}", id, key);
                Ok(())
            }
            Ok(Err(e)) => {
                log::warn!("question {} handler failed for {}: {:#}", id, key, e);
                Err(SessionError::Handler(format!("{:#}", e)))
            }
            Err(e) if e.is_panic() => {
                let msg = panic_message(e.into_panic());
                log::error!("question {} handler panicked for {}: {}", id, key, msg);
                Err(SessionError::Panicked(msg))
            }
            Err(_) => {
                log::warn!("question {} handler aborted for {}", id, key);
                Err(SessionError::Aborted)
            }
        };
        // No subscribers is fine.
        let _ = outcomes.send(SessionOutcome {
            session_id: id,
            key,
            result,
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
