//! Gateway event handler feeding the mirror engine's queue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rift_mirror::{ChannelId, EngineEvent, MessageId, UserId};
use serenity::all::{
    ChannelId as DiscordChannelId, Context, Emoji, EmojiId, EventHandler, GuildId, Message,
    MessageId as DiscordMessageId, MessageUpdateEvent, Ready, ResumedEvent,
    ShardStageUpdateEvent,
};
use serenity::gateway::ConnectionStage;
use tokio::sync::mpsc;

use super::discord_convert::source_message_from;
use super::discord_gateway::DiscordGateway;

/// Translates serenity callbacks into [`EngineEvent`]s. The engine has no
/// message cache of its own, so edits always take the refetch path.
pub struct RiftEventHandler {
    events: mpsc::Sender<EngineEvent>,
    gateway: Arc<DiscordGateway>,
}

impl RiftEventHandler {
    pub fn new(events: mpsc::Sender<EngineEvent>, gateway: Arc<DiscordGateway>) -> Self {
        Self { events, gateway }
    }

    async fn forward(&self, event: EngineEvent) {
        if let Err(error) = self.events.send(event).await {
            tracing::warn!(%error, "mirror engine is no longer receiving events");
        }
    }

    async fn forward_delete(&self, channel_id: DiscordChannelId, message_id: DiscordMessageId) {
        self.forward(EngineEvent::MessageDeleted {
            channel_id: ChannelId::new(channel_id.get()),
            message_id: MessageId::new(message_id.get()),
            cached: false,
        })
        .await;
    }
}

#[async_trait]
impl EventHandler for RiftEventHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            relay_user = %ready.user.name,
            guilds = ready.guilds.len(),
            "discord connected"
        );
        self.gateway
            .record_ready(
                UserId::new(ready.user.id.get()),
                ready.guilds.iter().map(|guild| guild.id).collect(),
            )
            .await;
        self.forward(EngineEvent::ConnectionEstablished).await;
    }

    async fn resume(&self, _ctx: Context, _event: ResumedEvent) {
        tracing::info!("discord session resumed");
    }

    async fn shard_stage_update(&self, _ctx: Context, event: ShardStageUpdateEvent) {
        tracing::debug!(shard = ?event.shard_id, old = ?event.old, new = ?event.new, "shard stage changed");
        if matches!(event.new, ConnectionStage::Disconnected) {
            self.forward(EngineEvent::ConnectionLost).await;
        }
    }

    async fn guild_emojis_update(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        _current_state: HashMap<EmojiId, Emoji>,
    ) {
        tracing::debug!(%guild_id, "guild emoji changed");
        self.gateway.invalidate_emoji_table().await;
    }

    async fn message(&self, _ctx: Context, message: Message) {
        if message.guild_id.is_none() {
            return;
        }
        self.forward(EngineEvent::MessageCreated(source_message_from(&message)))
            .await;
    }

    async fn message_update(
        &self,
        _ctx: Context,
        _old_if_available: Option<Message>,
        new: Option<Message>,
        event: MessageUpdateEvent,
    ) {
        self.forward(EngineEvent::MessageEdited {
            channel_id: ChannelId::new(event.channel_id.get()),
            message_id: MessageId::new(event.id.get()),
            updated: new.as_ref().map(source_message_from),
        })
        .await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: DiscordChannelId,
        deleted_message_id: DiscordMessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.forward_delete(channel_id, deleted_message_id).await;
    }

    async fn message_delete_bulk(
        &self,
        _ctx: Context,
        channel_id: DiscordChannelId,
        multiple_deleted_messages_ids: Vec<DiscordMessageId>,
        _guild_id: Option<GuildId>,
    ) {
        for message_id in multiple_deleted_messages_ids {
            self.forward_delete(channel_id, message_id).await;
        }
    }
}
