//! Read/delete access to Discord channels for the mirror engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rift_mirror::{
    AttachmentRef, ChannelId, ChannelLabels, EmojiTable, GuildEmoji, MessageId, PlatformGateway,
    RiftError, RiftResult, SourceMessage, UserId,
};
use serenity::all::{GetMessages, GuildId, Http};

use super::discord_convert::{
    channel_error, discord_channel, discord_message, http_status, is_not_found_status,
    message_error, source_message_from,
};

const EMOJI_TABLE_TTL: Duration = Duration::from_secs(600);
const MAX_HISTORY_PAGE: usize = 100;

/// [`PlatformGateway`] backed by Discord's REST API.
pub struct DiscordGateway {
    http: Arc<Http>,
    downloads: reqwest::Client,
    relay_user: OnceLock<UserId>,
    guilds: Mutex<Vec<GuildId>>,
    emoji_table: tokio::sync::Mutex<Option<(Instant, EmojiTable)>>,
    labels: Mutex<HashMap<ChannelId, ChannelLabels>>,
}

impl DiscordGateway {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            downloads: reqwest::Client::new(),
            relay_user: OnceLock::new(),
            guilds: Mutex::new(Vec::new()),
            emoji_table: tokio::sync::Mutex::new(None),
            labels: Mutex::new(HashMap::new()),
        }
    }

    /// Records who the relay is logged in as and which guilds it can see.
    /// Any cached emoji table is dropped so it is rebuilt for those guilds.
    pub async fn record_ready(&self, relay_user: UserId, guilds: Vec<GuildId>) {
        if self.relay_user.set(relay_user).is_err() && self.relay_user.get() != Some(&relay_user) {
            tracing::warn!(%relay_user, "relay account changed between sessions");
        }
        *self.guilds.lock().unwrap_or_else(PoisonError::into_inner) = guilds;
        *self.emoji_table.lock().await = None;
    }

    pub async fn invalidate_emoji_table(&self) {
        *self.emoji_table.lock().await = None;
    }

    async fn load_emoji_table(&self) -> EmojiTable {
        let guilds = self
            .guilds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut table = EmojiTable::default();
        for guild_id in guilds {
            match guild_id.emojis(&self.http).await {
                Ok(emojis) => {
                    for emoji in emojis {
                        table.insert(GuildEmoji {
                            id: emoji.id.get(),
                            name: emoji.name,
                            animated: emoji.animated,
                        });
                    }
                }
                Err(error) => tracing::warn!(%error, %guild_id, "failed to list guild emoji"),
            }
        }
        tracing::debug!(emoji = table.len(), "loaded guild emoji table");
        table
    }

    async fn fetch_labels(&self, channel_id: ChannelId) -> Option<ChannelLabels> {
        let channel = discord_channel(channel_id)
            .to_channel(&self.http)
            .await
            .map_err(|error| tracing::debug!(%error, %channel_id, "failed to read channel"))
            .ok()?
            .guild()?;
        let guild_name = match channel.guild_id.to_partial_guild(&self.http).await {
            Ok(guild) => guild.name,
            Err(error) => {
                tracing::debug!(%error, guild_id = %channel.guild_id, "failed to read guild");
                channel.guild_id.to_string()
            }
        };
        Some(ChannelLabels {
            guild_name,
            channel_name: channel.name,
        })
    }
}

#[async_trait]
impl PlatformGateway for DiscordGateway {
    fn relay_user_id(&self) -> Option<UserId> {
        self.relay_user.get().copied()
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> RiftResult<Option<SourceMessage>> {
        match discord_channel(channel_id)
            .message(&self.http, discord_message(message_id))
            .await
        {
            Ok(message) => Ok(Some(source_message_from(&message))),
            Err(error) if is_not_found_status(http_status(&error)) => Ok(None),
            Err(error) => Err(channel_error(http_status(&error), channel_id, error)),
        }
    }

    async fn history_before(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> RiftResult<Vec<SourceMessage>> {
        let limit = u8::try_from(limit.clamp(1, MAX_HISTORY_PAGE)).unwrap_or(u8::MAX);
        let mut request = GetMessages::new().limit(limit);
        if let Some(before) = before {
            request = request.before(discord_message(before));
        }
        let page = discord_channel(channel_id)
            .messages(&self.http, request)
            .await
            .map_err(|error| channel_error(http_status(&error), channel_id, error))?;
        Ok(page.iter().map(source_message_from).collect())
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> RiftResult<()> {
        discord_channel(channel_id)
            .delete_message(&self.http, discord_message(message_id))
            .await
            .map_err(|error| {
                message_error(
                    http_status(&error),
                    channel_id,
                    format!("message {message_id}"),
                    error,
                )
            })
    }

    async fn download_attachment(&self, attachment: &AttachmentRef) -> RiftResult<Vec<u8>> {
        let failed = |reason: String| RiftError::AttachmentDownload {
            filename: attachment.filename.clone(),
            reason,
        };
        let response = self
            .downloads
            .get(&attachment.url)
            .send()
            .await
            .map_err(|error| failed(error.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RiftError::not_found(format!("attachment {}", attachment.filename)));
        }
        let bytes = response
            .error_for_status()
            .map_err(|error| failed(error.to_string()))?
            .bytes()
            .await
            .map_err(|error| failed(error.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn emoji_table(&self) -> EmojiTable {
        let mut cached = self.emoji_table.lock().await;
        if let Some((loaded_at, table)) = cached.as_ref() {
            if loaded_at.elapsed() < EMOJI_TABLE_TTL {
                return table.clone();
            }
        }
        let table = self.load_emoji_table().await;
        *cached = Some((Instant::now(), table.clone()));
        table
    }

    async fn channel_labels(&self, channel_id: ChannelId) -> ChannelLabels {
        if let Some(labels) = self
            .labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel_id)
        {
            return labels.clone();
        }
        match self.fetch_labels(channel_id).await {
            Some(labels) => {
                self.labels
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(channel_id, labels.clone());
                labels
            }
            None => ChannelLabels::unknown(channel_id),
        }
    }
}
