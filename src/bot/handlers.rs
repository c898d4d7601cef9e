//! Update handlers. Each one sends at most one reply; failures are turned
//! into a plain-text notice here and never reach the dispatcher.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardMarkup, Me, MessageId, User};
use teloxide::utils::command::BotCommands;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bot::chart::{ChartError, ChartRenderer, chart_spec, daily_series};
use crate::bot::commands::Command;
use crate::bot::database::{Database, UsageKind};
use crate::bot::dispatch::addressed_message_text;
use crate::bot::gemini::{self, GeminiClient};
use crate::bot::keyboard::{CallbackAction, chart_keyboard, clear_keyboard, model_keyboard};
use crate::bot::message::{Turn, format_stats, truncate_chars};
use crate::bot::telegram::TelegramClient;
use crate::config::Config;

const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";

/// Shared state handed to every handler.
pub struct BotState {
    pub config: Config,
    pub gemini: GeminiClient,
    pub charts: ChartRenderer,
    pub database: Database,
    pub telegram: TelegramClient,
    /// Users already told they have no access, so they are told only once.
    denied: Mutex<HashSet<UserId>>,
}

impl BotState {
    pub fn new(config: Config, database: Database, bot: Bot) -> Self {
        Self {
            gemini: GeminiClient::new(config.gemini_api_key.clone()),
            charts: ChartRenderer::new(config.chart_endpoint.clone()),
            telegram: TelegramClient::new(bot),
            database,
            config,
            denied: Mutex::new(HashSet::new()),
        }
    }

    /// The model this user asked for, if still offered, else the default.
    fn model_for(&self, user_id: i64) -> Result<String, HandlerError> {
        let chosen = self.database.user_model(user_id)?;
        Ok(chosen
            .filter(|m| self.config.models.contains(m))
            .unwrap_or_else(|| self.config.default_model.clone()))
    }
}

#[derive(Debug)]
pub enum HandlerError {
    Gemini(gemini::Error),
    Chart(ChartError),
    Database(rusqlite::Error),
    Telegram(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gemini(e) => write!(f, "{e}"),
            Self::Chart(e) => write!(f, "{e}"),
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Telegram(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<gemini::Error> for HandlerError {
    fn from(e: gemini::Error) -> Self {
        Self::Gemini(e)
    }
}

impl From<ChartError> for HandlerError {
    fn from(e: ChartError) -> Self {
        Self::Chart(e)
    }
}

impl From<rusqlite::Error> for HandlerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e)
    }
}

impl From<String> for HandlerError {
    fn from(e: String) -> Self {
        Self::Telegram(e)
    }
}

impl HandlerError {
    /// Short reason shown to the user. Internal details stay in the log.
    pub fn user_message(&self) -> String {
        match self {
            Self::Gemini(gemini::Error::Blocked(reason)) => {
                format!("Gemini declined to answer that ({reason}).")
            }
            Self::Gemini(gemini::Error::Empty) => "Gemini returned nothing.".to_string(),
            Self::Gemini(gemini::Error::Api { status: 429, .. }) => {
                "Gemini is rate limiting us, try again in a minute.".to_string()
            }
            Self::Gemini(_) => "Gemini is unavailable right now.".to_string(),
            Self::Chart(_) => "The chart service is unavailable right now.".to_string(),
            Self::Database(_) => "Could not read or write history.".to_string(),
            Self::Telegram(_) => "Could not talk to Telegram.".to_string(),
        }
    }
}

/// Report a failed handler to the user as plain text.
async fn report(state: &BotState, chat_id: ChatId, reply_to: Option<MessageId>, result: Result<(), HandlerError>) {
    if let Err(e) = result {
        warn!("Handler failed in chat {}: {}", chat_id, e);
        let notice = format!("Sorry, that failed: {}", e.user_message());
        if let Err(send_err) = state.telegram.send_text(chat_id, &notice, reply_to).await {
            warn!("Could not deliver failure notice: {send_err}");
        }
    }
}

fn display_name(user: &User) -> &str {
    user.username.as_deref().unwrap_or(&user.first_name)
}

/// Midnight of `now`'s local day in `tz`, as UTC.
pub fn day_start_utc(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_midnight = now.with_timezone(&tz).date_naive().and_hms_opt(0, 0, 0);
    local_midnight
        .and_then(|m| tz.from_local_datetime(&m).earliest())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(now - Duration::hours(24))
}

/// Outcome of the access and quota rules for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// Not on the allow-list. `notify` is true only the first time.
    Deny { notify: bool },
    OverQuota { limit: u32 },
}

/// Allow-list check. Remembers denied users in `denied` so each is told once.
pub fn access(config: &Config, denied: &mut HashSet<UserId>, user: UserId) -> Admission {
    if config.is_allowed(user) {
        Admission::Proceed
    } else {
        Admission::Deny { notify: denied.insert(user) }
    }
}

/// The daily request limit that applies to `user`; None when unlimited or exempt.
pub fn quota_limit(config: &Config, user: UserId) -> Option<u32> {
    match config.daily_request_limit {
        0 => None,
        _ if config.is_owner(user) => None,
        limit => Some(limit),
    }
}

pub fn quota(config: &Config, user: UserId, used_today: u64) -> Admission {
    match quota_limit(config, user) {
        Some(limit) if used_today >= limit as u64 => Admission::OverQuota { limit },
        _ => Admission::Proceed,
    }
}

/// Allow-list gate run first by every message route.
/// Returns false when the message must be ignored.
async fn gate(state: &BotState, msg: &Message, user: &User) -> Result<bool, HandlerError> {
    let decision = {
        let mut denied = state.denied.lock().await;
        access(&state.config, &mut denied, user.id)
    };

    match decision {
        Admission::Deny { notify } => {
            if notify {
                info!("Denied {} ({})", display_name(user), user.id);
                state.telegram.send_text(msg.chat.id, "Access denied.", None).await?;
            }
            Ok(false)
        }
        _ => Ok(true),
    }
}

/// Record the user and apply the daily limit to a request that costs an API call.
/// Returns false when the user has been told they are over the limit.
async fn within_quota(state: &BotState, msg: &Message, user: &User) -> Result<bool, HandlerError> {
    let now = Utc::now();
    let uid = user.id.0 as i64;
    state.database.touch_user(uid, user.username.as_deref(), &user.first_name, now)?;

    if quota_limit(&state.config, user.id).is_none() {
        return Ok(true);
    }
    let used = state.database.usage_since(uid, day_start_utc(now, state.config.timezone))?;
    if let Admission::OverQuota { limit } = quota(&state.config, user.id, used) {
        info!("Quota reached for {} ({}/{})", display_name(user), used, limit);
        state
            .telegram
            .send_text(
                msg.chat.id,
                &format!("You've used all {limit} requests for today. Try again tomorrow."),
                Some(msg.id),
            )
            .await?;
        return Ok(false);
    }
    Ok(true)
}

// ==================== COMMANDS ====================

pub async fn start(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let name = msg.from.as_ref().map(|u| u.first_name.as_str()).unwrap_or("there");
    let text = format!(
        "Hi {name}! Ask me anything, send a photo to have it described, \
         or say \"draw ...\" for a picture.\n\n{}",
        Command::descriptions()
    );
    let result = do_send_text(&state, &msg, &text).await;
    report(&state, msg.chat.id, None, result).await;
    Ok(())
}

pub async fn help(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let text = Command::descriptions().to_string();
    let result = do_send_text(&state, &msg, &text).await;
    report(&state, msg.chat.id, None, result).await;
    Ok(())
}

pub async fn ask(msg: Message, state: Arc<BotState>, prompt: String) -> ResponseResult<()> {
    let result = do_ask(&state, &msg, prompt.trim()).await;
    report(&state, msg.chat.id, Some(msg.id), result).await;
    Ok(())
}

pub async fn image(msg: Message, state: Arc<BotState>, prompt: String) -> ResponseResult<()> {
    let result = do_image(&state, &msg, prompt.trim()).await;
    report(&state, msg.chat.id, Some(msg.id), result).await;
    Ok(())
}

pub async fn stats(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let result = do_stats(&state, &msg).await;
    report(&state, msg.chat.id, Some(msg.id), result).await;
    Ok(())
}

pub async fn chart_menu(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let result = do_send_menu(&state, &msg, "Chart which period?", chart_keyboard()).await;
    report(&state, msg.chat.id, None, result).await;
    Ok(())
}

pub async fn model_menu(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let result = do_model_menu(&state, &msg).await;
    report(&state, msg.chat.id, None, result).await;
    Ok(())
}

pub async fn clear_menu(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let result = do_send_menu(&state, &msg, "Forget this chat's conversation history?", clear_keyboard()).await;
    report(&state, msg.chat.id, None, result).await;
    Ok(())
}

async fn do_send_text(state: &BotState, msg: &Message, text: &str) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    if !gate(state, msg, user).await? {
        return Ok(());
    }
    state.telegram.send_text(msg.chat.id, text, None).await?;
    Ok(())
}

async fn do_send_menu(
    state: &BotState,
    msg: &Message,
    text: &str,
    keyboard: InlineKeyboardMarkup,
) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    if !gate(state, msg, user).await? {
        return Ok(());
    }
    state.telegram.send_keyboard(msg.chat.id, text, keyboard, Some(msg.id)).await?;
    Ok(())
}

// ==================== FREE TEXT & PHOTOS ====================

pub async fn text(msg: Message, me: Me, state: Arc<BotState>) -> ResponseResult<()> {
    // Unknown or foreign-bot commands
    if msg.text().is_some_and(|t| t.starts_with('/')) {
        return Ok(());
    }
    let Some(prompt) = addressed_message_text(&msg, &me) else {
        return Ok(());
    };

    let result = match state.config.image_prompt(&prompt) {
        Some(image_prompt) => do_image(&state, &msg, image_prompt).await,
        None => do_ask(&state, &msg, &prompt).await,
    };
    report(&state, msg.chat.id, Some(msg.id), result).await;
    Ok(())
}

pub async fn photo(msg: Message, me: Me, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(prompt) = addressed_message_text(&msg, &me) else {
        return Ok(());
    };

    let result = do_describe(&state, &msg, &prompt).await;
    report(&state, msg.chat.id, Some(msg.id), result).await;
    Ok(())
}

async fn do_ask(state: &BotState, msg: &Message, prompt: &str) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    if !gate(state, msg, user).await? {
        return Ok(());
    }

    if prompt.is_empty() {
        state.telegram.send_text(msg.chat.id, "Usage: /ask <question>", Some(msg.id)).await?;
        return Ok(());
    }
    if !within_quota(state, msg, user).await? {
        return Ok(());
    }

    let uid = user.id.0 as i64;
    let chat_id = msg.chat.id.0;
    let preview = truncate_chars(prompt, 100);
    info!("💬 {} ({}): \"{}\"", display_name(user), uid, preview);

    state.telegram.send_typing(msg.chat.id, ChatAction::Typing).await;

    let model = state.model_for(uid)?;
    let history = state.database.recent_turns(chat_id, state.config.history_turns)?;
    let reply = state
        .gemini
        .generate(&model, state.config.system_prompt.as_deref(), &history, prompt)
        .await?;

    let now = Utc::now();
    state.database.add_turn(chat_id, uid, &Turn::user(prompt), now)?;
    state.database.add_turn(chat_id, uid, &Turn::model(reply.text.as_str()), now)?;
    state.database.record_usage(uid, UsageKind::Text, reply.tokens, now)?;

    state.telegram.send_text(msg.chat.id, &reply.text, Some(msg.id)).await?;
    Ok(())
}

async fn do_image(state: &BotState, msg: &Message, prompt: &str) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    if !gate(state, msg, user).await? {
        return Ok(());
    }

    if prompt.is_empty() {
        state.telegram.send_text(msg.chat.id, "Usage: /image <description>", Some(msg.id)).await?;
        return Ok(());
    }
    if !within_quota(state, msg, user).await? {
        return Ok(());
    }

    state.telegram.send_typing(msg.chat.id, ChatAction::UploadPhoto).await;

    let image = state.gemini.generate_image(&state.config.image_model, prompt).await?;
    state.database.record_usage(user.id.0 as i64, UsageKind::Image, 0, Utc::now())?;

    state
        .telegram
        .send_photo(msg.chat.id, image.data, image.caption.as_deref(), Some(msg.id))
        .await?;
    Ok(())
}

async fn do_describe(state: &BotState, msg: &Message, prompt: &str) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    // Telegram lists sizes smallest first.
    let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) else {
        return Ok(());
    };
    if !gate(state, msg, user).await? || !within_quota(state, msg, user).await? {
        return Ok(());
    }

    let prompt = if prompt.is_empty() { DEFAULT_IMAGE_PROMPT } else { prompt };
    state.telegram.send_typing(msg.chat.id, ChatAction::Typing).await;

    let (bytes, mime) = state.telegram.download(photo.file.id.clone()).await?;
    let uid = user.id.0 as i64;
    let model = state.model_for(uid)?;
    let reply = state.gemini.describe_image(&model, &bytes, &mime, prompt).await?;
    state.database.record_usage(uid, UsageKind::Vision, reply.tokens, Utc::now())?;

    state.telegram.send_text(msg.chat.id, &reply.text, Some(msg.id)).await?;
    Ok(())
}

async fn do_model_menu(state: &BotState, msg: &Message) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    if !gate(state, msg, user).await? {
        return Ok(());
    }
    let current = state.model_for(user.id.0 as i64)?;
    let text = format!("Current model: {current}\nPick one:");
    state
        .telegram
        .send_keyboard(msg.chat.id, &text, model_keyboard(&state.config.models, &current), Some(msg.id))
        .await?;
    Ok(())
}

async fn do_stats(state: &BotState, msg: &Message) -> Result<(), HandlerError> {
    let Some(ref user) = msg.from else { return Ok(()) };
    if !gate(state, msg, user).await? {
        return Ok(());
    }

    let uid = user.id.0 as i64;
    let now = Utc::now();
    state.database.touch_user(uid, user.username.as_deref(), &user.first_name, now)?;
    let stats = state.database.user_stats(uid, msg.chat.id.0)?;
    let today = state.database.usage_since(uid, day_start_utc(now, state.config.timezone))?;
    let limit = quota_limit(&state.config, user.id).unwrap_or(0);

    let text = format_stats(display_name(user), &stats, today, limit);
    state.telegram.send_text(msg.chat.id, &text, Some(msg.id)).await?;
    Ok(())
}

// ==================== CALLBACKS ====================

pub async fn callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    let action = q.data.as_deref().map(CallbackAction::parse).unwrap_or(CallbackAction::Unknown);
    let Some(message) = q.regular_message() else {
        bot.answer_callback_query(q.id.clone()).text("This menu has expired.").await?;
        return Ok(());
    };
    let chat_id = message.chat.id;
    let message_id = message.id;

    if !state.config.is_allowed(q.from.id) {
        bot.answer_callback_query(q.id.clone()).text("Access denied.").await?;
        return Ok(());
    }

    info!("🔘 {} pressed {:?}", display_name(&q.from), action);

    let result = match action {
        CallbackAction::Chart(days) => {
            bot.answer_callback_query(q.id.clone()).text("Rendering…").await?;
            do_chart(&state, &q.from, chat_id, days).await
        }
        CallbackAction::Model(ref name) => {
            let known = state.config.models.contains(name);
            let notice = if known { "Model updated." } else { "That model is no longer offered." };
            bot.answer_callback_query(q.id.clone()).text(notice).await?;
            if known {
                do_set_model(&state, &q.from, chat_id, message_id, name).await
            } else {
                Ok(())
            }
        }
        CallbackAction::ClearConfirm => {
            bot.answer_callback_query(q.id.clone()).await?;
            do_clear(&state, chat_id, message_id).await
        }
        CallbackAction::ClearCancel => {
            bot.answer_callback_query(q.id.clone()).await?;
            state
                .telegram
                .edit_text(chat_id, message_id, "Kept the history.")
                .await
                .map_err(HandlerError::from)
        }
        CallbackAction::Unknown => {
            bot.answer_callback_query(q.id.clone()).text("Nothing to do.").await?;
            Ok(())
        }
    };

    report(&state, chat_id, None, result).await;
    Ok(())
}

async fn do_chart(state: &BotState, user: &User, chat_id: ChatId, days: u32) -> Result<(), HandlerError> {
    let uid = user.id.0 as i64;
    let tz = state.config.timezone;
    let now = Utc::now();
    let since = day_start_utc(now - Duration::days(days as i64 - 1), tz);

    // Owners chart the whole bot, everyone else charts themselves.
    let (scope, title) = if state.config.is_owner(user.id) {
        (None, format!("All requests, last {days} days"))
    } else {
        (Some(uid), format!("Requests by {}, last {days} days", display_name(user)))
    };

    let counts = state.database.daily_counts(scope, since, tz)?;
    let series = daily_series(&counts, days, now.with_timezone(&tz).date_naive());
    let png = state.charts.render(&chart_spec(&series, &title)).await?;

    state.database.touch_user(uid, user.username.as_deref(), &user.first_name, now)?;
    state.database.record_usage(uid, UsageKind::Chart, 0, now)?;
    state.telegram.send_photo(chat_id, png, None, None).await?;
    Ok(())
}

async fn do_set_model(
    state: &BotState,
    user: &User,
    chat_id: ChatId,
    message_id: MessageId,
    model: &str,
) -> Result<(), HandlerError> {
    let uid = user.id.0 as i64;
    state.database.touch_user(uid, user.username.as_deref(), &user.first_name, Utc::now())?;
    state.database.set_user_model(uid, model)?;
    info!("🤖 {} now uses {}", display_name(user), model);

    state
        .telegram
        .edit_text(chat_id, message_id, &format!("Model set to {model}."))
        .await?;
    Ok(())
}

async fn do_clear(state: &BotState, chat_id: ChatId, message_id: MessageId) -> Result<(), HandlerError> {
    let removed = state.database.clear_turns(chat_id.0)?;
    let text = match removed {
        0 => "There was nothing to forget.".to_string(),
        1 => "Forgot 1 message.".to_string(),
        n => format!("Forgot {n} messages."),
    };
    state.telegram.edit_text(chat_id, message_id, &text).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_config(extra: &str) -> Config {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"telegram_bot_token": "123:abc", "gemini_api_key": "key", "owner_ids": [1]{extra}}}"#
        )
        .unwrap();
        Config::load(file.path()).unwrap()
    }

    #[test]
    fn test_denied_user_is_told_once() {
        let config = load_config(r#", "allowed_users": [2]"#);
        let mut denied = HashSet::new();

        assert_eq!(access(&config, &mut denied, UserId(3)), Admission::Deny { notify: true });
        assert_eq!(access(&config, &mut denied, UserId(3)), Admission::Deny { notify: false });
        assert_eq!(access(&config, &mut denied, UserId(4)), Admission::Deny { notify: true });

        assert_eq!(access(&config, &mut denied, UserId(1)), Admission::Proceed);
        assert_eq!(access(&config, &mut denied, UserId(2)), Admission::Proceed);
        assert_eq!(denied.len(), 2);
    }

    #[test]
    fn test_empty_allow_list_admits_everyone() {
        let config = load_config("");
        let mut denied = HashSet::new();
        assert_eq!(access(&config, &mut denied, UserId(99)), Admission::Proceed);
        assert!(denied.is_empty());
    }

    #[test]
    fn test_quota_refuses_at_limit() {
        let config = load_config(r#", "daily_request_limit": 3"#);
        assert_eq!(quota_limit(&config, UserId(5)), Some(3));
        assert_eq!(quota(&config, UserId(5), 2), Admission::Proceed);
        assert_eq!(quota(&config, UserId(5), 3), Admission::OverQuota { limit: 3 });
        assert_eq!(quota(&config, UserId(5), 10), Admission::OverQuota { limit: 3 });
    }

    #[test]
    fn test_owners_exempt_from_quota() {
        let config = load_config(r#", "daily_request_limit": 3"#);
        assert_eq!(quota_limit(&config, UserId(1)), None);
        assert_eq!(quota(&config, UserId(1), 500), Admission::Proceed);
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let config = load_config("");
        assert_eq!(config.daily_request_limit, 0);
        assert_eq!(quota_limit(&config, UserId(5)), None);
        assert_eq!(quota(&config, UserId(5), 10_000), Admission::Proceed);
    }

    fn utc(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap().and_utc()
    }

    #[test]
    fn test_day_start_utc() {
        assert_eq!(day_start_utc(utc("2026-03-10 15:45:00"), chrono_tz::UTC), utc("2026-03-10 00:00:00"));
        // 01:00 UTC is already 10:00 in Tokyo (UTC+9), whose day began at 15:00 UTC the day before.
        assert_eq!(
            day_start_utc(utc("2026-03-10 01:00:00"), chrono_tz::Asia::Tokyo),
            utc("2026-03-09 15:00:00")
        );
        // 02:00 UTC is still the previous evening in New York (UTC-5 in winter).
        let ny = day_start_utc(utc("2026-01-10 02:00:00"), chrono_tz::America::New_York);
        assert_eq!(ny, utc("2026-01-09 05:00:00"));
    }

    #[test]
    fn test_user_messages_hide_internals() {
        let e = HandlerError::Gemini(gemini::Error::Api { status: 500, message: "secret detail".into() });
        assert!(!e.user_message().contains("secret"));
        assert!(e.to_string().contains("secret detail"));

        let e = HandlerError::Gemini(gemini::Error::Api { status: 429, message: String::new() });
        assert!(e.user_message().contains("rate limiting"));

        let e = HandlerError::Gemini(gemini::Error::Blocked("SAFETY".into()));
        assert!(e.user_message().contains("SAFETY"));

        let e = HandlerError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(e.user_message(), "Could not read or write history.");
    }
}
