//! Command router and the bundled question flows. Runs only for updates no pending
//! question claimed.

use qna::channels::{ChannelHandle, Choice};
use qna::questions::{Answers, Manager, QuestionError};
use qna::update::{CallbackQuery, ConversationId, Message, Update};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HELP_TEXT: &str = "Commands:\n/survey - answer a couple of questions\n/menu - rate this bot\n/cancel - stop the current question";
const RATE_DATA: &str = "rate";

#[derive(Clone)]
pub struct Router {
    manager: Manager,
    channel: Arc<dyn ChannelHandle>,
    answer_timeout: Duration,
}

impl Router {
    pub fn new(manager: Manager, channel: Arc<dyn ChannelHandle>, answer_timeout: Duration) -> Self {
        Self {
            manager,
            channel,
            answer_timeout,
        }
    }

    pub async fn route(&self, update: Update) {
        if let Some(ref message) = update.message {
            self.route_message(message).await;
        } else if let Some(ref callback) = update.callback_query {
            self.route_callback(callback).await;
        }
    }

    async fn route_message(&self, message: &Message) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let chat = message.chat.id;
        match command_name(text) {
            Some("start") | Some("help") => self.reply(chat, HELP_TEXT).await,
            Some("survey") => {
                let timeout = self.answer_timeout;
                let res = self
                    .manager
                    .ask_question(self.channel.clone(), message, move |ctx, channel, answers| {
                        survey(ctx, channel, answers, timeout)
                    })
                    .await;
                self.report_ask(chat, res.map(|_| ())).await;
            }
            Some("menu") => {
                let choices = [Choice::new("Rate this bot", RATE_DATA)];
                if let Err(e) = self.channel.send_choices(chat, "What next?", &choices).await {
                    log::warn!("menu: send_choices failed: {}", e);
                }
            }
            Some("cancel") => self.reply(chat, "Nothing to cancel.").await,
            _ => log::debug!("unrouted message in chat {}", chat),
        }
    }

    async fn route_callback(&self, callback: &CallbackQuery) {
        if let Err(e) = self.channel.answer_callback(&callback.id, None).await {
            log::debug!("answer_callback failed: {}", e);
        }
        if callback.data.as_deref() != Some(RATE_DATA) {
            log::debug!("unrouted callback {:?}", callback.data);
            return;
        }
        let Some(chat) = callback.message.as_ref().map(|m| m.chat.id) else {
            return;
        };
        let timeout = self.answer_timeout;
        let res = self
            .manager
            .ask_callback_question(self.channel.clone(), callback, move |ctx, channel, answers| {
                rating(ctx, channel, answers, timeout)
            })
            .await;
        self.report_ask(chat, res.map(|_| ())).await;
    }

    async fn report_ask(&self, chat: ConversationId, res: Result<(), QuestionError>) {
        match res {
            Ok(()) => {}
            Err(QuestionError::AlreadyPending(_)) => {
                self.reply(chat, "Please answer the current question first.").await
            }
            Err(QuestionError::AtCapacity) => {
                self.reply(chat, "Too busy right now, try again in a moment.").await
            }
            Err(e) => log::warn!("could not start question in chat {}: {}", chat, e),
        }
    }

    async fn reply(&self, chat: ConversationId, text: &str) {
        if let Err(e) = self.channel.send_message(chat, text).await {
            log::warn!("send_message to {} failed: {}", chat, e);
        }
    }
}

/// "/survey@my_bot arg" -> "survey"
fn command_name(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    let cmd = first.strip_prefix('/')?;
    Some(cmd.split('@').next().unwrap_or(cmd))
}

/// Next text answer, or None when the user gave up (/cancel, timeout, shutdown).
async fn next_text(
    ctx: &CancellationToken,
    channel: &Arc<dyn ChannelHandle>,
    answers: &Answers,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let chat = answers.key().conversation;
    let res = tokio::time::timeout(timeout, answers.next_or_cancel(ctx)).await;
    let answer = match res {
        Ok(Ok(answer)) => answer,
        // closed or cancelled
        Ok(Err(_)) => return Ok(None),
        Err(_) => {
            channel
                .send_message(chat, "No answer received, question closed.")
                .await
                .map_err(anyhow::Error::msg)?;
            return Ok(None);
        }
    };
    let text = answer.text().unwrap_or_default().trim().to_string();
    if command_name(&text) == Some("cancel") {
        channel
            .send_message(chat, "Cancelled.")
            .await
            .map_err(anyhow::Error::msg)?;
        return Ok(None);
    }
    Ok(Some(text))
}

/// Multi-turn message question: name, then age (re-asked until it parses).
async fn survey(
    ctx: CancellationToken,
    channel: Arc<dyn ChannelHandle>,
    answers: Answers,
    timeout: Duration,
) -> anyhow::Result<()> {
    let chat = answers.key().conversation;
    channel
        .send_message(chat, "What's your name?")
        .await
        .map_err(anyhow::Error::msg)?;
    let Some(name) = next_text(&ctx, &channel, &answers, timeout).await? else {
        return Ok(());
    };

    channel
        .send_message(chat, &format!("Nice to meet you, {}. How old are you?", name))
        .await
        .map_err(anyhow::Error::msg)?;
    let age = loop {
        let Some(text) = next_text(&ctx, &channel, &answers, timeout).await? else {
            return Ok(());
        };
        match text.parse::<u32>() {
            Ok(age) if age < 150 => break age,
            _ => channel
                .send_message(chat, "Please send your age as a number.")
                .await
                .map_err(anyhow::Error::msg)?,
        }
    };

    channel
        .send_message(chat, &format!("Thanks! {}, {} years old.", name, age))
        .await
        .map_err(anyhow::Error::msg)
}

/// Callback question: offer 1-5 buttons and wait for the same user to press one.
async fn rating(
    ctx: CancellationToken,
    channel: Arc<dyn ChannelHandle>,
    answers: Answers,
    timeout: Duration,
) -> anyhow::Result<()> {
    let chat = answers.key().conversation;
    let choices: Vec<Choice> = (1..=5)
        .map(|n| Choice::new(n.to_string(), format!("stars:{}", n)))
        .collect();
    channel
        .send_choices(chat, "How many stars?", &choices)
        .await
        .map_err(anyhow::Error::msg)?;

    loop {
        let answer = match tokio::time::timeout(timeout, answers.next_or_cancel(&ctx)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Ok(()),
            Err(_) => {
                return channel
                    .send_message(chat, "Rating closed.")
                    .await
                    .map_err(anyhow::Error::msg)
            }
        };
        let Some(callback) = answer.as_callback() else {
            continue;
        };
        if let Err(e) = channel.answer_callback(&callback.id, None).await {
            log::debug!("answer_callback failed: {}", e);
        }
        if let Some(stars) = callback.data.as_deref().and_then(|d| d.strip_prefix("stars:")) {
            return channel
                .send_message(chat, &format!("Thanks for the {} star rating!", stars))
                .await
                .map_err(anyhow::Error::msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qna::questions::PendingRegistry;
    use qna::update::{Chat, CorrelationKey, InteractionKind, ParticipantId, User};
    use std::sync::Mutex;

    /// Records sent text; acknowledging a button press always fails.
    #[derive(Default)]
    struct FlakyChannel {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelHandle for FlakyChannel {
        fn id(&self) -> &str {
            "flaky"
        }

        fn stop(&self) {}

        async fn send_message(&self, _conversation: ConversationId, text: &str) -> Result<(), String> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_choices(
            &self,
            _conversation: ConversationId,
            text: &str,
            _choices: &[Choice],
        ) -> Result<(), String> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> Result<(), String> {
            Err("query is too old".to_string())
        }
    }

    fn press(chat: i64, from: i64, data: &str) -> CallbackQuery {
        CallbackQuery {
            id: "cb".to_string(),
            from: User {
                id: ParticipantId(from),
                first_name: None,
                username: None,
            },
            message: Some(Message {
                message_id: 1,
                chat: Chat {
                    id: ConversationId(chat),
                },
                from: None,
                text: None,
            }),
            data: Some(data.to_string()),
        }
    }

    #[tokio::test]
    async fn rating_finishes_when_acknowledging_the_press_fails() {
        let manager = Manager::with_defaults(CancellationToken::new());
        let flaky = Arc::new(FlakyChannel::default());
        let mut outcomes = manager.subscribe();
        manager
            .ask_callback_question(flaky.clone(), &press(7, 3, RATE_DATA), |ctx, channel, answers| {
                rating(ctx, channel, answers, Duration::from_secs(5))
            })
            .await
            .unwrap();

        let update = Update {
            update_id: 1,
            message: None,
            callback_query: Some(press(7, 3, "stars:4")),
        };
        manager.intercept(update, |_| async {}).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_ok());
        let sent = flaky.sent.lock().unwrap().clone();
        assert_eq!(sent.last().map(String::as_str), Some("Thanks for the 4 star rating!"));
    }

    #[tokio::test]
    async fn next_text_gives_up_quietly_on_cancel_and_says_so_on_timeout() {
        let registry = PendingRegistry::new(1, CancellationToken::new());
        let key = CorrelationKey::new(9, 9, InteractionKind::Message);
        let (_handle, answers) = registry.register(key).await.unwrap();
        let flaky = Arc::new(FlakyChannel::default());
        let channel: Arc<dyn ChannelHandle> = flaky.clone();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let res = next_text(&cancelled, &channel, &answers, Duration::from_secs(5)).await;
        assert_eq!(res.unwrap(), None);
        assert!(flaky.sent.lock().unwrap().is_empty());

        let live = CancellationToken::new();
        let res = next_text(&live, &channel, &answers, Duration::from_millis(20)).await;
        assert_eq!(res.unwrap(), None);
        assert_eq!(
            flaky.sent.lock().unwrap().as_slice(),
            &["No answer received, question closed.".to_string()]
        );
    }

    #[test]
    fn command_name_strips_slash_and_bot_suffix() {
        assert_eq!(command_name("/survey"), Some("survey"));
        assert_eq!(command_name("  /menu@qna_bot now"), Some("menu"));
        assert_eq!(command_name("hello"), None);
        assert_eq!(command_name(""), None);
    }
}
