//! Telegram side of the solver: private replies, public posts, attachments.

use std::time::Duration;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatMemberKind, FileId, MessageId, ParseMode, ReplyParameters, User};
use tracing::{debug, info, warn};

use crate::config::{Config, ProviderLimits};
use crate::solver::pipeline::window_label;
use crate::solver::post::html_escape;
use crate::solver::{AnswerPost, ChatSurface, FetchError, ImageRef, ImageSource};

/// Downloads attachments through the Bot API file endpoint.
pub struct TelegramImageSource {
    bot: Bot,
}

impl TelegramImageSource {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl ImageSource for TelegramImageSource {
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        let file = self
            .bot
            .get_file(FileId(image.file_id.clone()))
            .await
            .map_err(|e| FetchError::Lookup(e.to_string()))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| FetchError::Download(e.to_string()))?;

        info!("📥 Downloaded image ({} bytes)", data.len());
        Ok(data)
    }
}

/// One `/solve` invocation, as seen from Telegram.
///
/// Private replies go to the caller's DM. Callers who never started a chat
/// with the bot get them as a reply in the group instead.
pub struct Interaction<'a> {
    bot: &'a Bot,
    config: &'a Config,
    chat_id: ChatId,
    message_id: MessageId,
    user_id: UserId,
}

impl<'a> Interaction<'a> {
    pub fn new(bot: &'a Bot, config: &'a Config, msg: &Message, user_id: UserId) -> Self {
        Self {
            bot,
            config,
            chat_id: msg.chat.id,
            message_id: msg.id,
            user_id,
        }
    }
}

impl ChatSurface for Interaction<'_> {
    type Receipt = (ChatId, MessageId);

    async fn is_privileged(&self) -> bool {
        if self.config.is_moderator_id(self.user_id) {
            return true;
        }

        let member = match self.bot.get_chat_member(self.chat_id, self.user_id).await {
            Ok(member) => member,
            Err(e) => {
                warn!("Failed to get chat member {}: {e}", self.user_id);
                return false;
            }
        };

        let title = match &member.kind {
            ChatMemberKind::Owner(o) => o.custom_title.as_deref(),
            ChatMemberKind::Administrator(a) => a.custom_title.as_deref(),
            _ => None,
        };
        title.is_some_and(|t| self.config.is_moderator_title(t))
    }

    async fn reply_private(&self, text: &str) -> Result<(ChatId, MessageId), String> {
        let dm = ChatId(self.user_id.0 as i64);
        match self.bot.send_message(dm, text).await {
            Ok(sent) => return Ok((dm, sent.id)),
            Err(e) => debug!("DM to {} failed, replying in chat: {e}", self.user_id),
        }

        self.bot
            .send_message(self.chat_id, text)
            .reply_parameters(ReplyParameters::new(self.message_id))
            .await
            .map(|sent| (self.chat_id, sent.id))
            .map_err(|e| format!("Failed to send: {e}"))
    }

    async fn edit_private(&self, receipt: &(ChatId, MessageId), text: &str) -> Result<(), String> {
        let (chat_id, message_id) = *receipt;
        self.bot
            .edit_message_text(chat_id, message_id, text)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to edit: {e}"))
    }

    async fn publish(&self, post: &AnswerPost) -> Result<(), String> {
        self.bot
            .send_message(self.chat_id, post.render_html())
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to publish: {e}"))
    }
}

/// The image a `/solve` message refers to: its own photo or image file, or
/// the one in the message it replies to.
pub fn attached_image(msg: &Message) -> Option<ImageRef> {
    own_image(msg).or_else(|| msg.reply_to_message().and_then(own_image))
}

fn own_image(msg: &Message) -> Option<ImageRef> {
    if let Some(sizes) = msg.photo() {
        // Largest size last; Telegram re-encodes photos as JPEG.
        let photo = sizes.last()?;
        return Some(ImageRef {
            file_name: "photo.jpg".to_string(),
            file_id: photo.file.id.0.clone(),
        });
    }

    msg.document().map(|doc| ImageRef {
        file_name: doc.file_name.clone().unwrap_or_default(),
        file_id: doc.file.id.0.clone(),
    })
}

/// `@username` when set, otherwise the full name.
pub fn display_name(user: &User) -> String {
    match &user.username {
        Some(username) => format!("@{username}"),
        None => user.full_name(),
    }
}

/// Public `/info` text, HTML formatted.
pub fn info_text(
    bot_name: &str,
    channel_label: &str,
    max_requests: u32,
    window: Duration,
    moderator_role: &str,
    provider_limits: Option<&ProviderLimits>,
) -> String {
    let bot_name = html_escape(bot_name);
    let mut text = format!(
        "<b>{bot_name} • Info</b>\n\
         {bot_name} is a <b>maths question solver</b>. Send a question as text or a screenshot \
         and it replies with only the <b>final answer</b>, posted publicly.\n\n\
         <b>How to use</b>\n\
         Use /solve in {channel}.\n\
         • Text: <code>/solve 2x + 3 = 7</code>\n\
         • Image: send a photo with /solve as the caption, or reply /solve to a photo\n\
         • Both: add the text after /solve in the caption\n\n\
         <b>Rate limits</b>\n\
         • Per person: <b>{max_requests} requests per {window}</b>\n\
         • Admins titled <code>{role}</code>: unlimited",
        channel = html_escape(channel_label),
        window = window_label(window),
        role = html_escape(moderator_role),
    );

    if let Some(limits) = provider_limits {
        let provider = html_escape(&limits.provider);
        text.push_str(&format!(
            "\n• {provider} for <code>{model}</code>: <b>{} RPM</b>, <b>{} RPD</b>, \
             <b>{} TPM</b>, <b>{} TPD</b>\n\n\
             Provider limits are <b>org-level</b> and may vary by account tier.",
            limits.rpm,
            limits.rpd,
            limits.tpm,
            limits.tpd,
            model = html_escape(&limits.model),
        ));
    }
    text
}
