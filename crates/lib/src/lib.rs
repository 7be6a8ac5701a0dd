//! qna core library: question correlation for chat bots, plus the Telegram channel and
//! config used by the `qna-bot` host.

pub mod channels;
pub mod config;
pub mod questions;
pub mod update;
