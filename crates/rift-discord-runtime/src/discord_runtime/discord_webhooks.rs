//! Channel webhooks as the relay's outbound identity.

use std::sync::Arc;

use async_trait::async_trait;
use rift_mirror::{
    ChannelId, Embed, MessageId, MirrorMessage, OutboundHandle, OutboundIdentityProvider,
    OutboundPayload, RiftError, RiftResult,
};
use serenity::all::{
    CreateAllowedMentions, CreateAttachment, CreateWebhook, EditWebhookMessage, ExecuteWebhook,
    Http, Webhook,
};

use super::discord_convert::{
    channel_error, create_embeds, discord_channel, discord_message, http_status,
    is_not_found_status, message_error,
};

/// Finds the named webhook in a destination channel, creating it when absent.
pub struct WebhookIdentityProvider {
    http: Arc<Http>,
    webhook_name: String,
}

impl WebhookIdentityProvider {
    pub fn new(http: Arc<Http>, webhook_name: impl Into<String>) -> Self {
        Self {
            http,
            webhook_name: webhook_name.into(),
        }
    }
}

#[async_trait]
impl OutboundIdentityProvider for WebhookIdentityProvider {
    async fn resolve(&self, channel_id: ChannelId) -> RiftResult<Arc<dyn OutboundHandle>> {
        let channel = discord_channel(channel_id);
        let existing = channel
            .webhooks(&self.http)
            .await
            .map_err(|error| channel_error(http_status(&error), channel_id, error))?
            .into_iter()
            .find(|webhook| {
                webhook.name.as_deref() == Some(self.webhook_name.as_str()) && webhook.token.is_some()
            });
        let webhook = match existing {
            Some(webhook) => webhook,
            None => {
                tracing::info!(%channel_id, name = %self.webhook_name, "creating relay webhook");
                channel
                    .create_webhook(&self.http, CreateWebhook::new(&self.webhook_name))
                    .await
                    .map_err(|error| channel_error(http_status(&error), channel_id, error))?
            }
        };
        Ok(Arc::new(WebhookHandle {
            http: Arc::clone(&self.http),
            channel_id,
            webhook,
        }))
    }
}

struct WebhookHandle {
    http: Arc<Http>,
    channel_id: ChannelId,
    webhook: Webhook,
}

impl WebhookHandle {
    fn failure(&self, mirror_id: MessageId, error: serenity::Error) -> RiftError {
        message_error(
            http_status(&error),
            self.channel_id,
            format!("mirror {mirror_id}"),
            error,
        )
    }
}

#[async_trait]
impl OutboundHandle for WebhookHandle {
    fn identity_id(&self) -> u64 {
        self.webhook.id.get()
    }

    async fn send(&self, payload: &OutboundPayload) -> RiftResult<MessageId> {
        let mut builder = ExecuteWebhook::new()
            .content(payload.content.as_str())
            .username(payload.display_name.as_str())
            .embeds(create_embeds(&payload.embeds))
            .add_files(
                payload
                    .attachments
                    .iter()
                    .map(|attachment| {
                        CreateAttachment::bytes(attachment.bytes.to_vec(), attachment.filename.as_str())
                    })
                    .collect::<Vec<_>>(),
            );
        if let Some(avatar_url) = payload.avatar_url.as_deref() {
            builder = builder.avatar_url(avatar_url);
        }
        if payload.suppress_mentions {
            builder = builder.allowed_mentions(CreateAllowedMentions::new());
        }

        let sent = self
            .webhook
            .execute(&self.http, true, builder)
            .await
            .map_err(|error| {
                if is_not_found_status(http_status(&error)) {
                    RiftError::not_found(format!("webhook in channel {}", self.channel_id))
                } else {
                    RiftError::transient(self.channel_id, error.to_string())
                }
            })?;
        sent.map(|message| MessageId::new(message.id.get()))
            .ok_or_else(|| RiftError::transient(self.channel_id, "webhook returned no message"))
    }

    async fn edit(&self, mirror_id: MessageId, content: &str, embeds: &[Embed]) -> RiftResult<()> {
        let builder = EditWebhookMessage::new()
            .content(content)
            .embeds(create_embeds(embeds));
        self.webhook
            .edit_message(&self.http, discord_message(mirror_id), builder)
            .await
            .map(|_| ())
            .map_err(|error| self.failure(mirror_id, error))
    }

    async fn delete(&self, mirror_id: MessageId) -> RiftResult<()> {
        self.webhook
            .delete_message(&self.http, None, discord_message(mirror_id))
            .await
            .map_err(|error| self.failure(mirror_id, error))
    }

    async fn fetch(&self, mirror_id: MessageId) -> RiftResult<Option<MirrorMessage>> {
        match self
            .webhook
            .get_message(&self.http, None, discord_message(mirror_id))
            .await
        {
            Ok(message) => Ok(Some(MirrorMessage {
                id: mirror_id,
                content: message.content,
                display_name: message.author.name,
            })),
            Err(error) if is_not_found_status(http_status(&error)) => Ok(None),
            Err(error) => Err(self.failure(mirror_id, error)),
        }
    }
}
