//! Bidirectional registry linking originals to their mirrors.
//!
//! Forward and reverse links share one key space, so an id can never be both
//! an original and a mirror at the same time. Every mutation updates both
//! directions before returning.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::model::{ChannelId, MessageId, MirrorEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistryValue {
    /// Mirrors of this original in emission order. Never empty.
    Forward(Vec<MirrorEntry>),
    /// Owning original of this mirror.
    Reverse(MessageId),
}

#[derive(Debug, Default, Clone)]
pub struct MirrorRegistry {
    entries: HashMap<MessageId, RegistryValue>,
}

impl MirrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends mirrors to `original_id`, creating the entry when absent.
    ///
    /// Re-delivering an already linked mirror is a no-op. A mirror linked to a
    /// different original is moved here. Ids that would make a key both an
    /// original and a mirror are refused. Returns how many links were added.
    pub fn track(
        &mut self,
        original_id: MessageId,
        entries: impl IntoIterator<Item = MirrorEntry>,
    ) -> usize {
        if let Some(RegistryValue::Reverse(owner)) = self.entries.get(&original_id) {
            tracing::warn!(
                original_id = %original_id,
                owner = %owner,
                "refusing to track mirrors under an id that is itself a mirror"
            );
            return 0;
        }

        let mut added = 0;
        for entry in entries {
            if self.link_one(original_id, entry) {
                added += 1;
            }
        }
        added
    }

    fn link_one(&mut self, original_id: MessageId, entry: MirrorEntry) -> bool {
        let mirror_id = entry.mirror_id;
        if mirror_id == original_id {
            tracing::warn!(%original_id, "refusing to link an original as its own mirror");
            return false;
        }
        match self.entries.get(&mirror_id) {
            Some(RegistryValue::Forward(_)) => {
                tracing::warn!(
                    %original_id,
                    %mirror_id,
                    "refusing to link a tracked original as a mirror"
                );
                return false;
            }
            Some(RegistryValue::Reverse(owner)) if *owner == original_id => {
                if self.mirrors_of(original_id).iter().any(|m| m.mirror_id == mirror_id) {
                    return false;
                }
            }
            Some(RegistryValue::Reverse(previous_owner)) => {
                let previous_owner = *previous_owner;
                self.remove_from_forward(previous_owner, mirror_id);
            }
            None => {}
        }

        match self
            .entries
            .entry(original_id)
            .or_insert_with(|| RegistryValue::Forward(Vec::new()))
        {
            RegistryValue::Forward(mirrors) => mirrors.push(entry),
            RegistryValue::Reverse(_) => return false,
        }
        self.entries
            .insert(mirror_id, RegistryValue::Reverse(original_id));
        true
    }

    /// The original that owns `id`: itself when it is an original, its owner
    /// when it is a mirror.
    pub fn resolve_owner(&self, id: MessageId) -> Option<MessageId> {
        match self.entries.get(&id)? {
            RegistryValue::Forward(_) => Some(id),
            RegistryValue::Reverse(owner) => Some(*owner),
        }
    }

    pub fn mirrors_of(&self, original_id: MessageId) -> &[MirrorEntry] {
        match self.entries.get(&original_id) {
            Some(RegistryValue::Forward(mirrors)) => mirrors,
            _ => &[],
        }
    }

    pub fn is_original(&self, id: MessageId) -> bool {
        matches!(self.entries.get(&id), Some(RegistryValue::Forward(_)))
    }

    pub fn is_mirror(&self, id: MessageId) -> bool {
        matches!(self.entries.get(&id), Some(RegistryValue::Reverse(_)))
    }

    /// The entry for `id` when `id` is a reply-preview stub rather than a
    /// primary mirror.
    pub fn find_reply_anchor_mirror(&self, id: MessageId) -> Option<&MirrorEntry> {
        let Some(RegistryValue::Reverse(owner)) = self.entries.get(&id) else {
            return None;
        };
        let mirrors = self.mirrors_of(*owner);
        debug_assert!(
            mirrors.iter().any(|mirror| mirror.mirror_id == id),
            "reverse link {id} has no matching forward entry under {owner}"
        );
        mirrors
            .iter()
            .find(|mirror| mirror.mirror_id == id && mirror.reply_anchor.is_some())
    }

    /// Links a reply preview under whatever original ultimately owns
    /// `anchor_id`. Replying to a mirror resolves to that mirror's original so
    /// reply chains never fragment across owners. The stored anchor is the
    /// resolved owner. Returns the owner the preview was linked under.
    pub fn link_reply_into(
        &mut self,
        anchor_id: MessageId,
        reply_mirror: MirrorEntry,
    ) -> Option<MessageId> {
        let owner = match self.entries.get(&anchor_id) {
            Some(RegistryValue::Reverse(owner)) => *owner,
            _ => anchor_id,
        };
        let entry = MirrorEntry {
            reply_anchor: Some(owner),
            ..reply_mirror
        };
        (self.track(owner, [entry]) > 0).then_some(owner)
    }

    /// Moves every mirror tracked under `former` to `original_id`, rewriting
    /// anchors that pointed at `former`. Used once `former` is known to be a
    /// mirror of `original_id`. Returns how many links were moved.
    pub fn fold_into(&mut self, original_id: MessageId, former: MessageId) -> usize {
        if original_id == former || !self.is_original(former) {
            return 0;
        }
        let moved: Vec<MirrorEntry> = self
            .untrack(former)
            .into_iter()
            .map(|mirror| MirrorEntry {
                reply_anchor: mirror
                    .reply_anchor
                    .map(|anchor| if anchor == former { original_id } else { anchor }),
                ..mirror
            })
            .collect();
        self.track(original_id, moved)
    }

    /// Drops an original with all its reverse links and hands the mirrors back.
    pub fn untrack(&mut self, original_id: MessageId) -> Vec<MirrorEntry> {
        let mirrors = match self.entries.entry(original_id) {
            Entry::Occupied(occupied) if matches!(occupied.get(), RegistryValue::Forward(_)) => {
                match occupied.remove() {
                    RegistryValue::Forward(mirrors) => mirrors,
                    RegistryValue::Reverse(_) => Vec::new(),
                }
            }
            _ => return Vec::new(),
        };
        for mirror in &mirrors {
            let removed = self.entries.remove(&mirror.mirror_id);
            debug_assert_eq!(
                removed,
                Some(RegistryValue::Reverse(original_id)),
                "mirror {} was not reverse-linked to {original_id}",
                mirror.mirror_id
            );
        }
        mirrors
    }

    /// Removes one mirror from its owner without touching the others. The
    /// owner entry goes away with its last mirror.
    pub fn detach_mirror(
        &mut self,
        original_id: MessageId,
        mirror_id: MessageId,
    ) -> Option<MirrorEntry> {
        if self.entries.get(&mirror_id) != Some(&RegistryValue::Reverse(original_id)) {
            return None;
        }
        let removed = self.remove_from_forward(original_id, mirror_id);
        self.entries.remove(&mirror_id);
        removed
    }

    fn remove_from_forward(
        &mut self,
        original_id: MessageId,
        mirror_id: MessageId,
    ) -> Option<MirrorEntry> {
        let Some(RegistryValue::Forward(mirrors)) = self.entries.get_mut(&original_id) else {
            return None;
        };
        let position = mirrors.iter().position(|m| m.mirror_id == mirror_id)?;
        let removed = mirrors.remove(position);
        if mirrors.is_empty() {
            self.entries.remove(&original_id);
        }
        Some(removed)
    }

    /// Originals with their mirrors, in ascending id order.
    pub fn originals(&self) -> Vec<(MessageId, &[MirrorEntry])> {
        let mut originals: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(id, value)| match value {
                RegistryValue::Forward(mirrors) => Some((*id, mirrors.as_slice())),
                RegistryValue::Reverse(_) => None,
            })
            .collect();
        originals.sort_by_key(|(id, _)| *id);
        originals
    }

    /// Whether `mirror_id` is a mirror this registry placed in `channel_id`.
    pub fn is_mirror_in(&self, mirror_id: MessageId, channel_id: ChannelId) -> bool {
        let Some(RegistryValue::Reverse(owner)) = self.entries.get(&mirror_id) else {
            return false;
        };
        self.mirrors_of(*owner)
            .iter()
            .any(|m| m.mirror_id == mirror_id && m.destination_channel_id == channel_id)
    }

    pub fn original_count(&self) -> usize {
        self.entries
            .values()
            .filter(|value| matches!(value, RegistryValue::Forward(_)))
            .count()
    }

    pub fn mirror_count(&self) -> usize {
        self.entries.len() - self.original_count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that forward and reverse views agree in both directions.
    pub fn is_symmetric(&self) -> bool {
        let forward_ok = self.entries.iter().all(|(id, value)| match value {
            RegistryValue::Forward(mirrors) => {
                !mirrors.is_empty()
                    && mirrors.iter().all(|mirror| {
                        self.entries.get(&mirror.mirror_id) == Some(&RegistryValue::Reverse(*id))
                    })
            }
            RegistryValue::Reverse(owner) => self
                .mirrors_of(*owner)
                .iter()
                .any(|mirror| mirror.mirror_id == *id),
        });
        let linked: usize = self
            .entries
            .values()
            .map(|value| match value {
                RegistryValue::Forward(mirrors) => mirrors.len(),
                RegistryValue::Reverse(_) => 0,
            })
            .sum();
        forward_ok && linked == self.mirror_count()
    }
}
