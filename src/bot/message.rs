//! Conversation turns and reply text helpers.

use serde::{Deserialize, Serialize};

/// Telegram's hard limit on message text length (in characters).
pub const TELEGRAM_MAX_CHARS: usize = 4096;

/// Who produced a turn. Names match Gemini's `role` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "model" => Some(Role::Model),
            _ => None,
        }
    }
}

/// One stored conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: Role::Model, text: text.into() }
    }
}

/// Per-user usage summary shown by /stats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserStats {
    pub requests: u64,
    pub tokens: u64,
    pub images: u64,
    pub turns: u64,
    pub first_seen: Option<String>,
}

/// Take at most `max_chars` characters, respecting UTF-8 boundaries.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Split reply text into Telegram-sized chunks.
///
/// Splits on line boundaries where possible; a single line longer than the
/// limit is hard-split at character boundaries. Empty input yields no chunks.
pub fn split_for_telegram(text: &str) -> Vec<String> {
    split_with_limit(text, TELEGRAM_MAX_CHARS)
}

fn split_with_limit(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let mut rest = line;
        loop {
            let rest_len = rest.chars().count();
            // +1 for the newline joining it to `current`
            let needed = if current.is_empty() { rest_len } else { rest_len + 1 };

            if current_len + needed <= limit {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(rest);
                current_len += needed;
                break;
            }

            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }

            let head = truncate_chars(rest, limit);
            chunks.push(head.to_string());
            rest = &rest[head.len()..];
            if rest.is_empty() {
                break;
            }
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

/// Render /stats output.
pub fn format_stats(username: &str, stats: &UserStats, today: u64, limit: u32) -> String {
    let mut out = format!("Usage for {username}\n");
    out.push_str(&format!("Requests: {}\n", stats.requests));
    out.push_str(&format!("Tokens: {}\n", stats.tokens));
    out.push_str(&format!("Images generated: {}\n", stats.images));
    out.push_str(&format!("Turns in this chat: {}\n", stats.turns));
    if limit > 0 {
        out.push_str(&format!("Today: {today}/{limit}\n"));
    } else {
        out.push_str(&format!("Today: {today}\n"));
    }
    if let Some(ref first) = stats.first_seen {
        out.push_str(&format!("First seen: {first}"));
    }
    out.trim_end().to_string()
}
