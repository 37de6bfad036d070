//! Durable snapshot of the registry's forward links.
//!
//! Layout: a JSON object keyed by the stringified original id whose values
//! are `[mirrorId, replyAnchor]` pairs, `0` standing for "no anchor". An
//! absent file is an empty registry; an unreadable one is fatal because it
//! is the only durable record of live links.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rift_core::write_text_atomic;

use crate::error::{RiftError, RiftResult};
use crate::mirror_registry::MirrorRegistry;
use crate::model::MessageId;

const NO_ANCHOR: u64 = 0;

type SnapshotFile = BTreeMap<String, Vec<(u64, u64)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMirror {
    pub mirror_id: MessageId,
    pub reply_anchor: Option<MessageId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub originals: BTreeMap<MessageId, Vec<SnapshotMirror>>,
}

impl RegistrySnapshot {
    pub fn from_registry(registry: &MirrorRegistry) -> Self {
        let originals = registry
            .originals()
            .into_iter()
            .map(|(original_id, mirrors)| {
                let mirrors = mirrors
                    .iter()
                    .map(|mirror| SnapshotMirror {
                        mirror_id: mirror.mirror_id,
                        reply_anchor: mirror.reply_anchor,
                    })
                    .collect();
                (original_id, mirrors)
            })
            .collect();
        Self { originals }
    }

    /// Every id the snapshot mentions, originals and mirrors.
    pub fn mentioned_ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.originals.iter().flat_map(|(original_id, mirrors)| {
            std::iter::once(*original_id).chain(mirrors.iter().map(|mirror| mirror.mirror_id))
        })
    }

    /// Original that lists `mirror_id` among its mirrors.
    pub fn owner_of(&self, mirror_id: MessageId) -> Option<MessageId> {
        self.originals
            .iter()
            .find(|(_, mirrors)| mirrors.iter().any(|mirror| mirror.mirror_id == mirror_id))
            .map(|(original_id, _)| *original_id)
    }

    /// Adds the mirrors of `other` this snapshot does not already carry,
    /// keeping this snapshot's entries first.
    pub fn merge_missing(&mut self, other: &RegistrySnapshot) {
        for (original_id, mirrors) in &other.originals {
            let merged = self.originals.entry(*original_id).or_default();
            for mirror in mirrors {
                if !merged.iter().any(|known| known.mirror_id == mirror.mirror_id) {
                    merged.push(*mirror);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }

    pub fn mirror_count(&self) -> usize {
        self.originals.values().map(Vec::len).sum()
    }

    fn encode(&self) -> RiftResult<String> {
        let file: SnapshotFile = self
            .originals
            .iter()
            .filter(|(_, mirrors)| !mirrors.is_empty())
            .map(|(original_id, mirrors)| {
                let pairs = mirrors
                    .iter()
                    .map(|mirror| {
                        (
                            mirror.mirror_id.get(),
                            mirror.reply_anchor.map_or(NO_ANCHOR, MessageId::get),
                        )
                    })
                    .collect();
                (original_id.to_string(), pairs)
            })
            .collect();
        let mut payload = serde_json::to_string_pretty(&file).map_err(|error| {
            RiftError::CorruptPersistentState {
                path: PathBuf::new(),
                reason: format!("failed to encode snapshot: {error}"),
            }
        })?;
        payload.push('\n');
        Ok(payload)
    }

    fn decode(path: &Path, raw: &str) -> RiftResult<Self> {
        let corrupt = |reason: String| RiftError::CorruptPersistentState {
            path: path.to_path_buf(),
            reason,
        };
        let file: SnapshotFile =
            serde_json::from_str(raw).map_err(|error| corrupt(error.to_string()))?;

        let mut originals = BTreeMap::new();
        for (key, pairs) in file {
            let original_id = key
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|raw| *raw != NO_ANCHOR)
                .map(MessageId::new)
                .ok_or_else(|| corrupt(format!("invalid original id key '{key}'")))?;
            let mut mirrors = Vec::with_capacity(pairs.len());
            for (mirror_id, anchor) in pairs {
                if mirror_id == NO_ANCHOR {
                    return Err(corrupt(format!("original {original_id} lists mirror id 0")));
                }
                mirrors.push(SnapshotMirror {
                    mirror_id: MessageId::new(mirror_id),
                    reply_anchor: (anchor != NO_ANCHOR).then(|| MessageId::new(anchor)),
                });
            }
            if !mirrors.is_empty() {
                originals.insert(original_id, mirrors);
            }
        }
        Ok(Self { originals })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotWrite {
    Written { originals: usize, mirrors: usize },
    /// Nothing to persist; any previous file was removed.
    Removed,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no snapshot exists.
    pub fn load(&self) -> RiftResult<Option<RegistrySnapshot>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RiftError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        RegistrySnapshot::decode(&self.path, &raw).map(Some)
    }

    pub fn save(&self, snapshot: &RegistrySnapshot) -> RiftResult<SnapshotWrite> {
        if snapshot.is_empty() {
            return match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(SnapshotWrite::Removed),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    Ok(SnapshotWrite::Removed)
                }
                Err(source) => Err(RiftError::Io {
                    path: self.path.clone(),
                    source,
                }),
            };
        }

        let payload = snapshot.encode()?;
        write_text_atomic(&self.path, &payload).map_err(|error| RiftError::Io {
            path: self.path.clone(),
            source: std::io::Error::other(format!("{error:#}")),
        })?;
        Ok(SnapshotWrite::Written {
            originals: snapshot.originals.len(),
            mirrors: snapshot.mirror_count(),
        })
    }
}
