use std::path::PathBuf;

use thiserror::Error;

use crate::model::ChannelId;

pub type RiftResult<T> = Result<T, RiftError>;

#[derive(Debug, Error)]
/// Failure taxonomy shared by the engine and its collaborators.
pub enum RiftError {
    /// Target message or channel no longer exists.
    #[error("{what} not found")]
    NotFound { what: String },
    /// Network or rate-limit failure on a single destination.
    #[error("send to channel {channel_id} failed: {reason}")]
    TransientSendFailure { channel_id: ChannelId, reason: String },
    /// The snapshot on disk cannot be trusted.
    #[error("corrupt persistent state in {}: {reason}", path.display())]
    CorruptPersistentState { path: PathBuf, reason: String },
    /// A configured channel is no longer accessible.
    #[error("channel {channel_id} is unreachable: {reason}")]
    UnreachableChannel { channel_id: ChannelId, reason: String },
    /// Attachment bytes could not be read from the platform's CDN.
    #[error("failed to download attachment {filename}: {reason}")]
    AttachmentDownload { filename: String, reason: String },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RiftError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn transient(channel_id: ChannelId, reason: impl Into<String>) -> Self {
        Self::TransientSendFailure {
            channel_id,
            reason: reason.into(),
        }
    }

    pub fn unreachable(channel_id: ChannelId, reason: impl Into<String>) -> Self {
        Self::UnreachableChannel {
            channel_id,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
