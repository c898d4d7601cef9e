//! Telegram bot: routes updates to Gemini, the chart service and SQLite.

pub mod chart;
pub mod commands;
pub mod database;
pub mod dispatch;
pub mod gemini;
pub mod handlers;
pub mod keyboard;
pub mod message;
pub mod telegram;

pub use commands::Command;
pub use database::Database;
pub use dispatch::schema;
pub use gemini::GeminiClient;
pub use handlers::BotState;
pub use telegram::TelegramClient;
