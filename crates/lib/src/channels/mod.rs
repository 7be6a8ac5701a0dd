//! Communication channels (e.g. Telegram).
//!
//! `ChannelHandle` is the send side handed to question handlers; the Telegram connector
//! also produces the inbound `Update` stream the question manager intercepts.

mod handle;
mod telegram;

pub use handle::{ChannelHandle, Choice};
pub use telegram::{telegram_api_base, TelegramChannel};
