//! Error types for asking questions and reading answers.

use crate::update::CorrelationKey;
use std::time::Duration;

/// Why a question could not be started. Returned before anything is spawned.
#[derive(Debug, thiserror::Error)]
pub enum QuestionError {
    #[error("invalid question event: {0}")]
    InvalidQuestionEvent(&'static str),
    #[error("a question is already pending for {0}")]
    AlreadyPending(CorrelationKey),
    #[error("question capacity exhausted")]
    AtCapacity,
    #[error("question manager is shutting down")]
    ShuttingDown,
}

/// Why `Answers::next_*` returned without an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AnswerError {
    #[error("question closed")]
    Closed,
    #[error("wait for answer cancelled")]
    Cancelled,
    #[error("no answer within {0:?}")]
    TimedOut(Duration),
}

/// How a question session ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler task aborted")]
    Aborted,
}
