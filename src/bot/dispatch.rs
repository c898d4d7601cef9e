//! Update routing: exact command match first, then photos, then free text.

use regex::RegexBuilder;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{ChatKind, Me};

use crate::bot::commands::Command;
use crate::bot::handlers;

pub fn schema() -> UpdateHandler<teloxide::RequestError> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Start].endpoint(handlers::start))
        .branch(case![Command::Help].endpoint(handlers::help))
        .branch(case![Command::Ask(prompt)].endpoint(handlers::ask))
        .branch(case![Command::Image(prompt)].endpoint(handlers::image))
        .branch(case![Command::Chart].endpoint(handlers::chart_menu))
        .branch(case![Command::Stats].endpoint(handlers::stats))
        .branch(case![Command::Model].endpoint(handlers::model_menu))
        .branch(case![Command::Clear].endpoint(handlers::clear_menu));

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(dptree::filter(|msg: Message| msg.photo().is_some()).endpoint(handlers::photo))
        .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handlers::text));

    let callback_handler = Update::filter_callback_query().endpoint(handlers::callback);

    dptree::entry()
        .branch(message_handler)
        .branch(callback_handler)
}

/// Whether a message is addressed to the bot, and the text with the mention removed.
///
/// Private chats are always addressed. In groups the bot must be @mentioned
/// or the message must reply to one of the bot's messages.
pub fn addressed_text(text: &str, is_private: bool, bot_username: &str, replies_to_bot: bool) -> Option<String> {
    let stripped = match find_mention(text, bot_username) {
        Some((start, end)) => format!("{} {}", &text[..start], &text[end..]),
        None => {
            if !is_private && !replies_to_bot {
                return None;
            }
            text.to_string()
        }
    };

    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(cleaned)
}

/// Byte range of the first `@username` in `text`, matched case-insensitively
/// and only when not followed by another word character.
fn find_mention(text: &str, bot_username: &str) -> Option<(usize, usize)> {
    if bot_username.is_empty() {
        return None;
    }
    let pattern = format!(r"@{}\b", regex::escape(bot_username));
    let re = RegexBuilder::new(&pattern).case_insensitive(true).build().ok()?;
    re.find(text).map(|m| (m.start(), m.end()))
}

/// `addressed_text` for a teloxide message (text or photo caption).
pub fn addressed_message_text(msg: &Message, me: &Me) -> Option<String> {
    let text = msg.text().or_else(|| msg.caption()).unwrap_or("");
    let is_private = matches!(msg.chat.kind, ChatKind::Private(_));
    let replies_to_bot = msg
        .reply_to_message()
        .and_then(|r| r.from.as_ref())
        .is_some_and(|u| u.id == me.id);
    addressed_text(text, is_private, me.username(), replies_to_bot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_chat_always_addressed() {
        assert_eq!(addressed_text("hello", true, "gbot", false), Some("hello".to_string()));
    }

    #[test]
    fn test_group_requires_mention_or_reply() {
        assert_eq!(addressed_text("hello all", false, "gbot", false), None);
        assert_eq!(addressed_text("hello all", false, "gbot", true), Some("hello all".to_string()));
    }

    #[test]
    fn test_mention_is_stripped_case_insensitively() {
        assert_eq!(
            addressed_text("@GBot what is rust?", false, "gbot", false),
            Some("what is rust?".to_string())
        );
        assert_eq!(
            addressed_text("hey @gbot, summarize this", false, "gbot", false),
            Some("hey , summarize this".to_string())
        );
    }

    #[test]
    fn test_mention_of_other_bot_ignored_in_group() {
        assert_eq!(addressed_text("@otherbot hi", false, "gbot", false), None);
    }

    #[test]
    fn test_mention_after_non_ascii_text() {
        // Both letters change byte length when lowercased.
        assert_eq!(
            addressed_text("İİ @gbot hi there", false, "gbot", false),
            Some("İİ hi there".to_string())
        );
        assert_eq!(
            addressed_text("\u{212A}elvin @GBOT convert 300K", false, "gbot", false),
            Some("\u{212A}elvin convert 300K".to_string())
        );
    }

    #[test]
    fn test_longer_username_is_not_a_mention() {
        assert_eq!(addressed_text("@gbotfan hi", false, "gbot", false), None);
        assert_eq!(
            addressed_text("@gbotfan hi", true, "gbot", false),
            Some("@gbotfan hi".to_string())
        );
        assert_eq!(addressed_text("hi @gbot!", false, "gbot", false), Some("hi !".to_string()));
    }

    #[test]
    fn test_bare_mention_yields_empty_prompt() {
        assert_eq!(addressed_text("@gbot", false, "gbot", false), Some(String::new()));
    }
}
