//! Inbound event model (Telegram Bot API shape) and the correlation key derived from it.

use serde::Deserialize;
use std::fmt;

/// Telegram chat id; scopes a correlation key.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

/// Telegram user id; scopes a correlation key.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which kind of answer a question waits for. Each kind is its own namespace.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum InteractionKind {
    /// Plain chat message.
    Message,
    /// Inline keyboard button press.
    Callback,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionKind::Message => f.write_str("message"),
            InteractionKind::Callback => f.write_str("callback"),
        }
    }
}

/// (conversation, participant, kind): identifies who a question is waiting on.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct CorrelationKey {
    pub conversation: ConversationId,
    pub participant: ParticipantId,
    pub kind: InteractionKind,
}

impl CorrelationKey {
    pub fn new(conversation: i64, participant: i64, kind: InteractionKind) -> Self {
        Self {
            conversation: ConversationId(conversation),
            participant: ParticipantId(participant),
            kind,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chat={} user={} kind={}",
            self.conversation, self.participant, self.kind
        )
    }
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    /// Absent for channel posts and some service messages.
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    /// The message carrying the pressed button. Absent when the message is too old.
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ConversationId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: ParticipantId,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Message {
    /// Key a message question (or answer) correlates on. None when the sender is unknown.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        let from = self.from.as_ref()?;
        Some(CorrelationKey {
            conversation: self.chat.id,
            participant: from.id,
            kind: InteractionKind::Message,
        })
    }
}

impl CallbackQuery {
    /// Key a callback question (or answer) correlates on. None when the originating message is gone.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        let message = self.message.as_ref()?;
        Some(CorrelationKey {
            conversation: message.chat.id,
            participant: self.from.id,
            kind: InteractionKind::Callback,
        })
    }
}

/// An event handed to a waiting question.
#[derive(Debug, Clone)]
pub enum Answer {
    Message(Message),
    Callback(CallbackQuery),
}

impl Answer {
    /// Message text or callback data.
    pub fn text(&self) -> Option<&str> {
        match self {
            Answer::Message(m) => m.text.as_deref(),
            Answer::Callback(c) => c.data.as_deref(),
        }
    }

    pub fn kind(&self) -> InteractionKind {
        match self {
            Answer::Message(_) => InteractionKind::Message,
            Answer::Callback(_) => InteractionKind::Callback,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Answer::Message(m) => Some(m),
            Answer::Callback(_) => None,
        }
    }

    pub fn as_callback(&self) -> Option<&CallbackQuery> {
        match self {
            Answer::Callback(c) => Some(c),
            Answer::Message(_) => None,
        }
    }
}

impl Update {
    /// Key a pending question would be waiting on, without cloning the payload.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        if let Some(ref message) = self.message {
            return message.correlation_key();
        }
        self.callback_query.as_ref()?.correlation_key()
    }

    /// Split the update into its correlation key and answer payload. None when the update
    /// cannot be attributed to a participant in a conversation.
    pub fn to_answer(&self) -> Option<(CorrelationKey, Answer)> {
        if let Some(ref message) = self.message {
            let key = message.correlation_key()?;
            return Some((key, Answer::Message(message.clone())));
        }
        if let Some(ref callback) = self.callback_query {
            let key = callback.correlation_key()?;
            return Some((key, Answer::Callback(callback.clone())));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_update_maps_to_message_key() {
        let update: Update = serde_json::from_str(
            r#"{"update_id":7,"message":{"message_id":1,"chat":{"id":100},"from":{"id":1,"first_name":"A"},"text":"hi"}}"#,
        )
        .unwrap();
        let (key, answer) = update.to_answer().unwrap();
        assert_eq!(key, CorrelationKey::new(100, 1, InteractionKind::Message));
        assert_eq!(answer.text(), Some("hi"));
    }

    #[test]
    fn callback_update_uses_originating_chat() {
        let update: Update = serde_json::from_str(
            r#"{"update_id":8,"callback_query":{"id":"cb1","from":{"id":5},"data":"yes","message":{"message_id":3,"chat":{"id":-42}}}}"#,
        )
        .unwrap();
        let (key, answer) = update.to_answer().unwrap();
        assert_eq!(key, CorrelationKey::new(-42, 5, InteractionKind::Callback));
        assert_eq!(update.correlation_key(), Some(key));
        assert_eq!(answer.kind(), InteractionKind::Callback);
        assert_eq!(answer.text(), Some("yes"));
    }

    #[test]
    fn unattributable_updates_have_no_key() {
        let anonymous: Update = serde_json::from_str(
            r#"{"update_id":9,"message":{"message_id":1,"chat":{"id":100},"text":"channel post"}}"#,
        )
        .unwrap();
        assert!(anonymous.to_answer().is_none());
        assert!(anonymous.correlation_key().is_none());

        let stale_callback: Update = serde_json::from_str(
            r#"{"update_id":10,"callback_query":{"id":"cb2","from":{"id":5},"data":"x"}}"#,
        )
        .unwrap();
        assert!(stale_callback.to_answer().is_none());

        let empty: Update = serde_json::from_str(r#"{"update_id":11}"#).unwrap();
        assert!(empty.to_answer().is_none());
    }
}
