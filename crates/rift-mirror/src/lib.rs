//! Mirror synchronization engine for the Rift channel relay.
//!
//! Messages posted in source channels are fanned out to destination channels
//! through a per-channel outbound identity. The engine keeps a bidirectional
//! registry between originals and their mirrors so edits and deletes follow
//! the original, rebuilds that registry from a snapshot at startup, and
//! purges both sides once the retention window elapses.
//!
//! Platform access is abstracted behind [`PlatformGateway`] and
//! [`OutboundIdentityProvider`]; `rift-discord-runtime` provides the Discord
//! implementation.

pub mod channel_router;
pub mod collaborators;
pub mod content_transform;
pub mod edit_delete_sync;
pub mod error;
pub mod mirror_engine;
pub mod mirror_registry;
pub mod model;
pub mod reconciliation;
pub mod relay_pipeline;
pub mod retention;
pub mod snapshot_store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use channel_router::{ChannelRouter, ChannelRoutes, MirrorRef};
pub use collaborators::{OutboundHandle, OutboundIdentityProvider, PlatformGateway};
pub use content_transform::{
    render_display_name, render_reply_preview, rewrite_emoji_tokens, shorten_for_reply_preview,
    should_suppress_embeds, EmojiTable, GuildEmoji, REPLY_PREVIEW_BASE_CHARS,
    REPLY_PREVIEW_ELLIPSIS,
};
pub use edit_delete_sync::{DeleteOutcome, EditOutcome};
pub use error::{RiftError, RiftResult};
pub use mirror_engine::{
    EngineEvent, EngineEventLoop, EngineStats, MirrorEngine, MirrorEngineConfig,
};
pub use mirror_registry::MirrorRegistry;
pub use model::{
    AttachmentRef, Author, ChannelId, ChannelLabels, Embed, MessageId, MessageReference,
    MirrorEntry, MirrorMessage, OutboundAttachment, OutboundPayload, SourceMessage, UserId,
};
pub use reconciliation::{DeferredEvent, ReconciliationGate, ReconciliationReport};
pub use relay_pipeline::{RelayOutcome, RelaySkip, RelayStage};
pub use retention::RetentionScheduler;
pub use snapshot_store::{RegistrySnapshot, SnapshotMirror, SnapshotStore, SnapshotWrite};
