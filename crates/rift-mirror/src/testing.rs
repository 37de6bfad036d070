//! In-memory collaborators for exercising the engine without a platform.
//!
//! [`FakePlatform`] holds channel histories. [`FakeOutbound`] posts mirrors
//! into those same histories under a per-channel identity, so reconciliation
//! sees relayed messages the way it would on the real platform.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::collaborators::{OutboundHandle, OutboundIdentityProvider, PlatformGateway};
use crate::content_transform::EmojiTable;
use crate::error::{RiftError, RiftResult};
use crate::model::{
    AttachmentRef, Author, ChannelId, ChannelLabels, Embed, MessageId, MessageReference,
    MirrorMessage, OutboundPayload, SourceMessage, UserId,
};

const IDENTITY_BASE: u64 = 7_000_000;
const FIRST_MIRROR_ID: u64 = 10_000;

pub fn author(id: u64, username: &str) -> Author {
    Author {
        id: UserId::new(id),
        username: username.to_string(),
        discriminator: None,
        nickname: None,
        avatar_url: Some(format!("https://cdn.example/avatars/{id}.png")),
        is_bot: false,
    }
}

/// A plain message from `user1` created just now.
pub fn source_message(id: u64, channel_id: u64, content: &str) -> SourceMessage {
    SourceMessage {
        id: MessageId::new(id),
        channel_id: ChannelId::new(channel_id),
        author: author(1, "user1"),
        content: content.to_string(),
        embeds: Vec::new(),
        attachments: Vec::new(),
        reference: None,
        referenced: None,
        webhook_id: None,
        created_at: Utc::now(),
    }
}

/// `message` turned into a reply to `target_id` in `target_channel`, without
/// the referenced message inlined.
pub fn reply_to(mut message: SourceMessage, target_channel: u64, target_id: u64) -> SourceMessage {
    message.reference = Some(MessageReference {
        channel_id: ChannelId::new(target_channel),
        message_id: MessageId::new(target_id),
    });
    message
}

pub fn identity_for(channel_id: ChannelId) -> u64 {
    IDENTITY_BASE + channel_id.get()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PlatformState {
    channels: BTreeMap<ChannelId, BTreeMap<MessageId, SourceMessage>>,
    deleted: Vec<(ChannelId, MessageId)>,
    unreachable: HashSet<ChannelId>,
    relay_user: Option<UserId>,
    emoji_table: EmojiTable,
    attachment_bytes: HashMap<u64, Vec<u8>>,
    downloads: usize,
}

/// Channel histories keyed by id, newest id last.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `message` to its channel's history.
    pub fn post(&self, message: SourceMessage) {
        lock(&self.state)
            .channels
            .entry(message.channel_id)
            .or_default()
            .insert(message.id, message);
    }

    /// Removes a message without recording it, as if deleted by a user.
    pub fn remove(&self, channel_id: ChannelId, message_id: MessageId) -> Option<SourceMessage> {
        lock(&self.state)
            .channels
            .get_mut(&channel_id)
            .and_then(|history| history.remove(&message_id))
    }

    pub fn message(&self, channel_id: ChannelId, message_id: MessageId) -> Option<SourceMessage> {
        lock(&self.state)
            .channels
            .get(&channel_id)
            .and_then(|history| history.get(&message_id))
            .cloned()
    }

    pub fn messages_in(&self, channel_id: ChannelId) -> Vec<SourceMessage> {
        lock(&self.state)
            .channels
            .get(&channel_id)
            .map(|history| history.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_relay_user(&self, user_id: UserId) {
        lock(&self.state).relay_user = Some(user_id);
    }

    pub fn set_unreachable(&self, channel_id: ChannelId) {
        lock(&self.state).unreachable.insert(channel_id);
    }

    pub fn set_emoji_table(&self, table: EmojiTable) {
        lock(&self.state).emoji_table = table;
    }

    pub fn set_attachment_bytes(&self, attachment_id: u64, bytes: Vec<u8>) {
        lock(&self.state).attachment_bytes.insert(attachment_id, bytes);
    }

    /// Messages removed through [`PlatformGateway::delete_message`].
    pub fn deleted(&self) -> Vec<(ChannelId, MessageId)> {
        lock(&self.state).deleted.clone()
    }

    pub fn download_count(&self) -> usize {
        lock(&self.state).downloads
    }

    fn ensure_reachable(&self, channel_id: ChannelId) -> RiftResult<()> {
        if lock(&self.state).unreachable.contains(&channel_id) {
            return Err(RiftError::unreachable(channel_id, "missing access"));
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformGateway for FakePlatform {
    fn relay_user_id(&self) -> Option<UserId> {
        lock(&self.state).relay_user
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> RiftResult<Option<SourceMessage>> {
        self.ensure_reachable(channel_id)?;
        Ok(self.message(channel_id, message_id))
    }

    async fn history_before(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> RiftResult<Vec<SourceMessage>> {
        self.ensure_reachable(channel_id)?;
        let state = lock(&self.state);
        let Some(history) = state.channels.get(&channel_id) else {
            return Ok(Vec::new());
        };
        let page = match before {
            Some(before) => history
                .range(..before)
                .rev()
                .take(limit)
                .map(|(_, message)| message.clone())
                .collect(),
            None => history
                .values()
                .rev()
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(page)
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> RiftResult<()> {
        self.ensure_reachable(channel_id)?;
        if self.remove(channel_id, message_id).is_none() {
            return Err(RiftError::not_found(format!("message {message_id}")));
        }
        lock(&self.state).deleted.push((channel_id, message_id));
        Ok(())
    }

    async fn download_attachment(&self, attachment: &AttachmentRef) -> RiftResult<Vec<u8>> {
        let mut state = lock(&self.state);
        state.downloads += 1;
        Ok(state
            .attachment_bytes
            .get(&attachment.id)
            .cloned()
            .unwrap_or_else(|| attachment.filename.as_bytes().to_vec()))
    }

    async fn emoji_table(&self) -> EmojiTable {
        lock(&self.state).emoji_table.clone()
    }

    async fn channel_labels(&self, channel_id: ChannelId) -> ChannelLabels {
        ChannelLabels {
            guild_name: "Test Guild".to_string(),
            channel_name: format!("channel-{channel_id}"),
        }
    }
}

#[derive(Default)]
struct OutboundState {
    next_mirror_id: u64,
    sends: Vec<(ChannelId, OutboundPayload)>,
    edits: Vec<(ChannelId, MessageId, String)>,
    deletes: Vec<(ChannelId, MessageId)>,
    failing: HashSet<ChannelId>,
    unresolvable: HashSet<ChannelId>,
    resolves: HashMap<ChannelId, usize>,
}

struct OutboundShared {
    platform: Arc<FakePlatform>,
    state: Mutex<OutboundState>,
}

/// Outbound identities that post into a [`FakePlatform`] and record calls.
pub struct FakeOutbound {
    shared: Arc<OutboundShared>,
}

impl Default for FakeOutbound {
    fn default() -> Self {
        Self::new(Arc::new(FakePlatform::new()))
    }
}

impl FakeOutbound {
    pub fn new(platform: Arc<FakePlatform>) -> Self {
        Self {
            shared: Arc::new(OutboundShared {
                platform,
                state: Mutex::new(OutboundState {
                    next_mirror_id: FIRST_MIRROR_ID,
                    ..OutboundState::default()
                }),
            }),
        }
    }

    pub fn platform(&self) -> &Arc<FakePlatform> {
        &self.shared.platform
    }

    /// Sends to `channel_id` fail with a transient error from now on.
    pub fn fail_sends_to(&self, channel_id: ChannelId) {
        lock(&self.shared.state).failing.insert(channel_id);
    }

    pub fn refuse_identity_in(&self, channel_id: ChannelId) {
        lock(&self.shared.state).unresolvable.insert(channel_id);
    }

    /// Places a relay-identity message in `channel_id` dated one minute ago.
    pub fn seed_mirror(&self, channel_id: ChannelId, mirror_id: MessageId, content: &str) {
        let mut message = mirror_message(channel_id, mirror_id, "Relay", content, Vec::new());
        message.created_at = Utc::now() - ChronoDuration::minutes(1);
        self.shared.platform.post(message);
    }

    pub fn resolve_count(&self, channel_id: ChannelId) -> usize {
        lock(&self.shared.state)
            .resolves
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn sends(&self) -> Vec<(ChannelId, OutboundPayload)> {
        lock(&self.shared.state).sends.clone()
    }

    pub fn sends_to(&self, channel_id: ChannelId) -> Vec<OutboundPayload> {
        self.sends()
            .into_iter()
            .filter(|(channel, _)| *channel == channel_id)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn edits(&self) -> Vec<(ChannelId, MessageId, String)> {
        lock(&self.shared.state).edits.clone()
    }

    pub fn deleted(&self) -> Vec<(ChannelId, MessageId)> {
        lock(&self.shared.state).deletes.clone()
    }

    /// Current content of a mirror, `None` once it is gone.
    pub fn mirror_content(&self, channel_id: ChannelId, mirror_id: MessageId) -> Option<String> {
        self.shared
            .platform
            .message(channel_id, mirror_id)
            .map(|message| message.content)
    }
}

fn mirror_message(
    channel_id: ChannelId,
    mirror_id: MessageId,
    display_name: &str,
    content: &str,
    embeds: Vec<Embed>,
) -> SourceMessage {
    let identity = identity_for(channel_id);
    SourceMessage {
        id: mirror_id,
        channel_id,
        author: Author {
            id: UserId::new(identity),
            username: display_name.to_string(),
            discriminator: None,
            nickname: None,
            avatar_url: None,
            is_bot: true,
        },
        content: content.to_string(),
        embeds,
        attachments: Vec::new(),
        reference: None,
        referenced: None,
        webhook_id: Some(identity),
        created_at: Utc::now(),
    }
}

#[async_trait]
impl OutboundIdentityProvider for FakeOutbound {
    async fn resolve(&self, channel_id: ChannelId) -> RiftResult<Arc<dyn OutboundHandle>> {
        let mut state = lock(&self.shared.state);
        if state.unresolvable.contains(&channel_id) {
            return Err(RiftError::unreachable(channel_id, "cannot manage webhooks"));
        }
        *state.resolves.entry(channel_id).or_default() += 1;
        Ok(Arc::new(FakeHandle {
            channel_id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeHandle {
    channel_id: ChannelId,
    shared: Arc<OutboundShared>,
}

impl FakeHandle {
    fn ensure_exists(&self, mirror_id: MessageId) -> RiftResult<SourceMessage> {
        self.shared
            .platform
            .message(self.channel_id, mirror_id)
            .filter(|message| message.webhook_id == Some(self.identity_id()))
            .ok_or_else(|| RiftError::not_found(format!("mirror {mirror_id}")))
    }
}

#[async_trait]
impl OutboundHandle for FakeHandle {
    fn identity_id(&self) -> u64 {
        identity_for(self.channel_id)
    }

    async fn send(&self, payload: &OutboundPayload) -> RiftResult<MessageId> {
        let mirror_id = {
            let mut state = lock(&self.shared.state);
            if state.failing.contains(&self.channel_id) {
                return Err(RiftError::transient(self.channel_id, "rate limited"));
            }
            let mirror_id = MessageId::new(state.next_mirror_id);
            state.next_mirror_id += 1;
            state.sends.push((self.channel_id, payload.clone()));
            mirror_id
        };
        self.shared.platform.post(mirror_message(
            self.channel_id,
            mirror_id,
            &payload.display_name,
            &payload.content,
            payload.embeds.clone(),
        ));
        Ok(mirror_id)
    }

    async fn edit(&self, mirror_id: MessageId, content: &str, embeds: &[Embed]) -> RiftResult<()> {
        let mut message = self.ensure_exists(mirror_id)?;
        message.content = content.to_string();
        message.embeds = embeds.to_vec();
        self.shared.platform.post(message);
        lock(&self.shared.state)
            .edits
            .push((self.channel_id, mirror_id, content.to_string()));
        Ok(())
    }

    async fn delete(&self, mirror_id: MessageId) -> RiftResult<()> {
        self.ensure_exists(mirror_id)?;
        self.shared.platform.remove(self.channel_id, mirror_id);
        lock(&self.shared.state)
            .deletes
            .push((self.channel_id, mirror_id));
        Ok(())
    }

    async fn fetch(&self, mirror_id: MessageId) -> RiftResult<Option<MirrorMessage>> {
        Ok(self
            .shared
            .platform
            .message(self.channel_id, mirror_id)
            .map(|message| MirrorMessage {
                id: message.id,
                content: message.content,
                display_name: message.author.username,
            }))
    }
}
