//! Telegram client using teloxide.

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InlineKeyboardMarkup, InputFile, MessageId, ReplyParameters};
use tracing::{info, warn};

use crate::bot::message::split_for_telegram;

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Send plain text, split into as many messages as needed.
    /// Only the first chunk is sent as a reply.
    pub async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<(), String> {
        let chunks = split_for_telegram(text);
        if chunks.len() > 1 {
            info!("✂️ Reply split into {} messages", chunks.len());
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let mut request = self.bot.send_message(chat_id, chunk);
            if i == 0
                && let Some(msg_id) = reply_to
            {
                request = request.reply_parameters(ReplyParameters::new(msg_id));
            }

            request.await.map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })?;
        }
        Ok(())
    }

    pub async fn send_keyboard(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
        reply_to: Option<MessageId>,
    ) -> Result<(), String> {
        let mut request = self.bot.send_message(chat_id, text).reply_markup(keyboard);
        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(msg_id));
        }

        request.await.map(|_| ()).map_err(|e| {
            let msg = format!("Failed to send keyboard: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Replace the text of a message the bot sent earlier (drops its keyboard).
    pub async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), String> {
        self.bot
            .edit_message_text(chat_id, message_id, text)
            .await
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to edit message: {e}");
                warn!("{}", msg);
                msg
            })
    }

    /// Send an image from bytes.
    pub async fn send_photo(
        &self,
        chat_id: ChatId,
        image_data: Vec<u8>,
        caption: Option<&str>,
        reply_to: Option<MessageId>,
    ) -> Result<(), String> {
        info!("📷 Sending image to chat {} ({} bytes)", chat_id, image_data.len());

        let input_file = InputFile::memory(image_data).file_name("image.png");
        let mut request = self.bot.send_photo(chat_id, input_file);

        if let Some(cap) = caption {
            // Photo captions are capped at 1024 characters.
            request = request.caption(crate::bot::message::truncate_chars(cap, 1024));
        }

        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(msg_id));
        }

        request.await.map(|_| ()).map_err(|e| {
            let msg = format!("Failed to send image: {e}");
            warn!("{}", msg);
            msg
        })
    }

    /// Download a file by id. Returns (bytes, media_type).
    pub async fn download(&self, file_id: FileId) -> Result<(Vec<u8>, String), String> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        let media_type = media_type_for(&file.path);
        info!("📥 Downloaded file ({} bytes, {})", data.len(), media_type);
        Ok((data, media_type.to_string()))
    }

    /// Best effort; failures are only logged.
    pub async fn send_typing(&self, chat_id: ChatId, action: ChatAction) {
        if let Err(e) = self.bot.send_chat_action(chat_id, action).await {
            warn!("Failed to send chat action: {e}");
        }
    }
}

/// Guess a media type from a Telegram file path.
pub fn media_type_for(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else {
        // Telegram re-encodes photos as JPEG
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_for() {
        assert_eq!(media_type_for("photos/file_1.jpg"), "image/jpeg");
        assert_eq!(media_type_for("photos/file_2.PNG"), "image/png");
        assert_eq!(media_type_for("stickers/file_3.webp"), "image/webp");
        assert_eq!(media_type_for("photos/file_4"), "image/jpeg");
    }
}
