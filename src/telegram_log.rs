//! Mirror INFO+ log events into a Telegram chat.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::bot::message::truncate_chars;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BUFFERED_LINES: usize = 50;
const MAX_LOG_CHARS: usize = 4000;

/// Log message with priority.
#[derive(Debug, PartialEq)]
enum LogMessage {
    /// WARN/ERROR - sent immediately
    Urgent(String),
    /// INFO - batched
    Info(String),
}

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl TelegramLogLayer {
    /// Must be called from inside a tokio runtime: spawns the forwarder task.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        tokio::spawn(async move {
            let mut info_buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(LogMessage::Urgent(text)) => {
                            // Keep ordering: anything buffered goes out first.
                            flush_buffer(&bot, chat_id, &mut info_buffer).await;
                            send_log(&bot, chat_id, &text).await;
                        }
                        Some(LogMessage::Info(text)) => {
                            info_buffer.push(text);
                            if info_buffer.len() >= MAX_BUFFERED_LINES {
                                flush_buffer(&bot, chat_id, &mut info_buffer).await;
                            }
                        }
                        None => {
                            flush_buffer(&bot, chat_id, &mut info_buffer).await;
                            break;
                        }
                    },
                    _ = interval.tick() => {
                        flush_buffer(&bot, chat_id, &mut info_buffer).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    let text = clamp(text);
    // Sending errors can't go through tracing without feeding back into this layer.
    if let Err(e) = bot.send_message(chat_id, text).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

async fn flush_buffer(bot: &Bot, chat_id: ChatId, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(bot, chat_id, &combined).await;
}

fn clamp(text: &str) -> String {
    let head = truncate_chars(text, MAX_LOG_CHARS);
    if head.len() < text.len() {
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Map a level and rendered message to what gets forwarded, if anything.
fn classify(level: Level, target: &str, message: String) -> Option<LogMessage> {
    // Only INFO and above, and never HTTP client chatter (it would log our own log sends).
    if level > Level::INFO || target.starts_with("reqwest") || target.starts_with("hyper") {
        return None;
    }
    Some(match level {
        Level::ERROR => LogMessage::Urgent(format!("❌ {message}")),
        Level::WARN => LogMessage::Urgent(format!("⚠️ {message}")),
        _ => LogMessage::Info(message),
    })
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message.push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(msg) = classify(*metadata.level(), metadata.target(), visitor.message)
            && self.tx.send(msg).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
