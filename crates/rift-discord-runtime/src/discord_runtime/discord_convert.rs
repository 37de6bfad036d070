//! Conversions between serenity models and the engine's message model.

use rift_mirror::{
    AttachmentRef, Author, ChannelId, Embed, MessageId, MessageReference, RiftError,
    SourceMessage, UserId,
};
use serenity::all::{
    ChannelId as DiscordChannelId, CreateEmbed, Embed as DiscordEmbed, Message,
    MessageId as DiscordMessageId, User,
};

const STATUS_FORBIDDEN: u16 = 403;
const STATUS_NOT_FOUND: u16 = 404;

pub(super) fn discord_channel(channel_id: ChannelId) -> DiscordChannelId {
    DiscordChannelId::new(channel_id.get())
}

pub(super) fn discord_message(message_id: MessageId) -> DiscordMessageId {
    DiscordMessageId::new(message_id.get())
}

pub(super) fn author_from_user(user: &User, nickname: Option<&str>) -> Author {
    Author {
        id: UserId::new(user.id.get()),
        username: user.name.clone(),
        discriminator: user.discriminator.map(|value| value.get()),
        nickname: nickname.map(str::to_string),
        avatar_url: Some(user.face()),
        is_bot: user.bot,
    }
}

pub(super) fn source_message_from(message: &Message) -> SourceMessage {
    let nickname = message
        .member
        .as_ref()
        .and_then(|member| member.nick.as_deref());
    let reference = message.message_reference.as_ref().and_then(|reference| {
        reference.message_id.map(|message_id| MessageReference {
            channel_id: ChannelId::new(reference.channel_id.get()),
            message_id: MessageId::new(message_id.get()),
        })
    });
    SourceMessage {
        id: MessageId::new(message.id.get()),
        channel_id: ChannelId::new(message.channel_id.get()),
        author: author_from_user(&message.author, nickname),
        content: message.content.clone(),
        embeds: message.embeds.iter().filter_map(embed_to_value).collect(),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| AttachmentRef {
                id: attachment.id.get(),
                filename: attachment.filename.clone(),
                url: attachment.url.clone(),
                size: u64::from(attachment.size),
            })
            .collect(),
        reference,
        referenced: message
            .referenced_message
            .as_deref()
            .map(|referenced| Box::new(source_message_from(referenced))),
        webhook_id: message.webhook_id.map(|webhook_id| webhook_id.get()),
        created_at: *message.timestamp,
    }
}

pub(super) fn embed_to_value(embed: &DiscordEmbed) -> Option<Embed> {
    match serde_json::to_value(embed) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(%error, "dropping embed that failed to serialize");
            None
        }
    }
}

/// Rebuilds outbound embeds, dropping any the platform model rejects.
pub(super) fn create_embeds(embeds: &[Embed]) -> Vec<CreateEmbed> {
    embeds
        .iter()
        .filter_map(
            |value| match serde_json::from_value::<DiscordEmbed>(value.clone()) {
                Ok(embed) => Some(CreateEmbed::from(embed)),
                Err(error) => {
                    tracing::debug!(%error, "dropping embed that failed to decode");
                    None
                }
            },
        )
        .collect()
}

pub(super) fn http_status(error: &serenity::Error) -> Option<u16> {
    match error {
        serenity::Error::Http(http_error) => http_error.status_code().map(|status| status.as_u16()),
        _ => None,
    }
}

/// Message-level failure: 404 is NotFound, anything else is transient.
pub(super) fn message_error(
    status: Option<u16>,
    channel_id: ChannelId,
    what: impl std::fmt::Display,
    error: impl std::fmt::Display,
) -> RiftError {
    if status == Some(STATUS_NOT_FOUND) {
        RiftError::not_found(what.to_string())
    } else {
        RiftError::transient(channel_id, error.to_string())
    }
}

/// Channel-level failure: missing or forbidden channels are unreachable.
pub(super) fn channel_error(
    status: Option<u16>,
    channel_id: ChannelId,
    error: impl std::fmt::Display,
) -> RiftError {
    match status {
        Some(STATUS_FORBIDDEN | STATUS_NOT_FOUND) => RiftError::unreachable(channel_id, error.to_string()),
        _ => RiftError::transient(channel_id, error.to_string()),
    }
}

pub(super) fn is_not_found_status(status: Option<u16>) -> bool {
    status == Some(STATUS_NOT_FOUND)
}
