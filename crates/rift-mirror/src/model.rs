//! Platform-neutral message model shared by the engine and its collaborators.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

snowflake_id!(
    /// Platform-assigned message id. Roughly time ordered, never trusted to be strict.
    MessageId
);
snowflake_id!(ChannelId);
snowflake_id!(UserId);

/// Embeds travel as the platform's own JSON form; the engine never looks inside.
pub type Embed = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: UserId,
    pub username: String,
    /// Legacy `#1234` suffix. `None` or `Some(0)` means the account has migrated.
    pub discriminator: Option<u16>,
    /// Guild-local nickname, when the platform could resolve one.
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub id: u64,
    pub filename: String,
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReference {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: Author,
    pub content: String,
    pub embeds: Vec<Embed>,
    pub attachments: Vec<AttachmentRef>,
    /// Set when the message is a reply.
    pub reference: Option<MessageReference>,
    /// The replied-to message when the platform delivered it inline.
    pub referenced: Option<Box<SourceMessage>>,
    /// Present on messages posted through a webhook, including our own mirrors.
    pub webhook_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl SourceMessage {
    pub fn created_unix_ms(&self) -> u64 {
        u64::try_from(self.created_at.timestamp_millis()).unwrap_or_default()
    }
}

/// One mirrored artifact for one original at one destination channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MirrorEntry {
    pub mirror_id: MessageId,
    pub destination_channel_id: ChannelId,
    /// Original this mirror is a reply preview for; `None` for a primary mirror.
    pub reply_anchor: Option<MessageId>,
}

impl MirrorEntry {
    pub fn primary(mirror_id: MessageId, destination_channel_id: ChannelId) -> Self {
        Self {
            mirror_id,
            destination_channel_id,
            reply_anchor: None,
        }
    }

    pub fn reply_preview(
        mirror_id: MessageId,
        destination_channel_id: ChannelId,
        anchor: MessageId,
    ) -> Self {
        Self {
            mirror_id,
            destination_channel_id,
            reply_anchor: Some(anchor),
        }
    }

    pub fn is_reply_preview(&self) -> bool {
        self.reply_anchor.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAttachment {
    pub filename: String,
    /// Shared so every destination reuses the single download.
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPayload {
    pub content: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub embeds: Vec<Embed>,
    pub attachments: Vec<OutboundAttachment>,
    pub suppress_mentions: bool,
}

/// A mirror as read back through an outbound handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorMessage {
    pub id: MessageId,
    pub content: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLabels {
    pub guild_name: String,
    pub channel_name: String,
}

impl ChannelLabels {
    pub fn unknown(channel_id: ChannelId) -> Self {
        Self {
            guild_name: "unknown".to_string(),
            channel_name: channel_id.to_string(),
        }
    }
}
