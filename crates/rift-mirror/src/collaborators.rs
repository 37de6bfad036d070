//! Interfaces the engine needs from the platform it runs on.

use std::sync::Arc;

use async_trait::async_trait;

use crate::content_transform::EmojiTable;
use crate::error::RiftResult;
use crate::model::{
    AttachmentRef, ChannelId, ChannelLabels, Embed, MessageId, MirrorMessage, OutboundPayload,
    SourceMessage, UserId,
};

/// Reusable outbound identity bound to one destination channel.
#[async_trait]
pub trait OutboundHandle: Send + Sync {
    /// Platform id of the identity; messages it posts carry it as their webhook id.
    fn identity_id(&self) -> u64;

    async fn send(&self, payload: &OutboundPayload) -> RiftResult<MessageId>;

    async fn edit(&self, mirror_id: MessageId, content: &str, embeds: &[Embed]) -> RiftResult<()>;

    async fn delete(&self, mirror_id: MessageId) -> RiftResult<()>;

    /// `Ok(None)` when the mirror no longer exists.
    async fn fetch(&self, mirror_id: MessageId) -> RiftResult<Option<MirrorMessage>>;
}

/// Finds or creates the named outbound identity in a destination channel.
#[async_trait]
pub trait OutboundIdentityProvider: Send + Sync {
    async fn resolve(&self, channel_id: ChannelId) -> RiftResult<Arc<dyn OutboundHandle>>;
}

/// Read/delete access to channels plus the relay account's own identity.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// The account the relay is logged in as, once the connection is up.
    fn relay_user_id(&self) -> Option<UserId>;

    /// `Ok(None)` when the message was deleted.
    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> RiftResult<Option<SourceMessage>>;

    /// One page of history strictly older than `before`, newest first.
    /// An empty page means history is exhausted.
    async fn history_before(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> RiftResult<Vec<SourceMessage>>;

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> RiftResult<()>;

    async fn download_attachment(&self, attachment: &AttachmentRef) -> RiftResult<Vec<u8>>;

    async fn emoji_table(&self) -> EmojiTable;

    async fn channel_labels(&self, channel_id: ChannelId) -> ChannelLabels;
}
