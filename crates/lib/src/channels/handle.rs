//! Send-side handle of a channel, passed through to question handlers.

use crate::update::ConversationId;
use async_trait::async_trait;

/// One inline keyboard button: label shown to the user, data returned in the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub data: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Handle to a running channel (stop, send message).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;
    /// Stop the channel connector.
    fn stop(&self);
    /// Send a text message to a conversation.
    async fn send_message(&self, conversation: ConversationId, text: &str) -> Result<(), String>;
    /// Send a message with one row of inline buttons. Default returns error.
    async fn send_choices(
        &self,
        _conversation: ConversationId,
        _text: &str,
        _choices: &[Choice],
    ) -> Result<(), String> {
        Err("inline choices not supported".to_string())
    }
    /// Acknowledge a button press so the client stops its spinner. Default is a no-op.
    async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}
