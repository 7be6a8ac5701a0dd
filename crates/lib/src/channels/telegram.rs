//! Telegram channel: long-poll getUpdates and sendMessage via Bot API.

use crate::channels::handle::{ChannelHandle, Choice};
use crate::update::{ConversationId, Update};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram channel connector: long-polls for updates and sends replies via sendMessage.
pub struct TelegramChannel {
    id: String,
    token: Option<String>,
    api_base: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self {
            id: "telegram".to_string(),
            token,
            api_base: telegram_api_base(),
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn method_url(&self, method: &str) -> Result<String, String> {
        let token = self
            .token
            .as_ref()
            .ok_or("telegram bot token not configured")?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    /// Start the getUpdates long-poll loop and forward every update to `updates_tx`.
    /// Returns a handle to await (or abort) on shutdown.
    pub fn start_inbound(self: Arc<Self>, updates_tx: mpsc::Sender<Update>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            if let Err(e) = self.delete_webhook().await {
                log::warn!("telegram deleteWebhook before polling failed: {}", e);
            }
            run_get_updates_loop(self, updates_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(&self, offset: Option<i64>) -> Result<(Vec<Update>, Option<i64>), String> {
        let url = self.method_url("getUpdates")?;
        let mut body = serde_json::json!({
            "timeout": LONG_POLL_TIMEOUT,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        parse_updates(data)
    }

    /// Remove webhook so the bot can use getUpdates.
    pub async fn delete_webhook(&self) -> Result<(), String> {
        self.call("deleteWebhook", serde_json::json!({})).await
    }

    /// Send a text message to a chat via sendMessage API.
    pub async fn send_message(&self, chat_id: ConversationId, text: &str) -> Result<(), String> {
        let body = serde_json::json!({ "chat_id": chat_id.0, "text": text });
        self.call("sendMessage", body).await
    }

    /// sendMessage with a single-row inline keyboard.
    pub async fn send_choices(
        &self,
        chat_id: ConversationId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), String> {
        let body = serde_json::json!({
            "chat_id": chat_id.0,
            "text": text,
            "reply_markup": inline_keyboard(choices),
        });
        self.call("sendMessage", body).await
    }

    pub async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<(), String> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(t) = text {
            body["text"] = serde_json::Value::String(t.to_string());
        }
        self.call("answerCallbackQuery", body).await
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<(), String> {
        let url = self.method_url(method)?;
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("{} failed: {} {}", method, status, body));
        }
        Ok(())
    }
}

fn parse_updates(data: GetUpdatesResponse) -> Result<(Vec<Update>, Option<i64>), String> {
    if !data.ok {
        return Err(format!(
            "getUpdates returned ok: false ({})",
            data.description.unwrap_or_default()
        ));
    }
    let next_offset = data
        .result
        .iter()
        .map(|u| u.update_id)
        .max()
        .map(|id| id + 1);
    Ok((data.result, next_offset))
}

fn inline_keyboard(choices: &[Choice]) -> serde_json::Value {
    let row: Vec<serde_json::Value> = choices
        .iter()
        .map(|c| serde_json::json!({ "text": c.label, "callback_data": c.data }))
        .collect();
    serde_json::json!({ "inline_keyboard": [row] })
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, updates_tx: mpsc::Sender<Update>) {
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                if next.is_some() {
                    offset = next;
                }
                for u in updates {
                    if updates_tx.send(u).await.is_err() {
                        log::debug!("telegram: update channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, conversation: ConversationId, text: &str) -> Result<(), String> {
        TelegramChannel::send_message(self, conversation, text).await
    }

    async fn send_choices(
        &self,
        conversation: ConversationId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), String> {
        TelegramChannel::send_choices(self, conversation, text, choices).await
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), String> {
        self.answer_callback_query(callback_id, text).await
    }
}

/// Resolve Telegram bot API base URL (TELEGRAM_API_BASE overrides, for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE")
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
