//! Propagates edits and deletes of originals to their mirrors.

use crate::content_transform::{render_display_name, render_mirror_body, render_reply_preview};
use crate::mirror_engine::MirrorEngine;
use crate::model::{ChannelId, MessageId, MirrorEntry, SourceMessage};
use crate::reconciliation::DeferredEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The id is still pending reconciliation; the edit was queued.
    Deferred,
    Untracked,
    /// A mirror was edited directly; mirrors are never re-propagated.
    MirrorEdited,
    /// The id is a reply-preview stub. Chained replies are not re-propagated.
    ChainedReplyStub,
    /// The original vanished before its new content could be read.
    SourceGone,
    Propagated {
        edited: usize,
        skipped: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deferred,
    Untracked,
    CascadeDeleted {
        deleted: usize,
        already_gone: usize,
        failed: usize,
    },
    /// A single mirror was removed from its owner, which stays tracked.
    MirrorDetached { owner: MessageId },
}

enum EditPlan {
    Done(EditOutcome),
    Propagate(Vec<MirrorEntry>),
}

enum DeletePlan {
    Done(DeleteOutcome),
    Cascade(Vec<MirrorEntry>),
}

impl MirrorEngine {
    /// Applies an edit of `message_id`. `updated` carries the post-edit
    /// message when the platform had it; otherwise it is refetched.
    /// Ids still pending reconciliation are queued even when a reply has
    /// already given them a registry entry.
    pub async fn handle_edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        mut updated: Option<SourceMessage>,
    ) -> EditOutcome {
        let deferred = self.with_state(|state| {
            let pending = state.gate.is_pending(message_id);
            if pending {
                state.gate.defer(DeferredEvent::Edit {
                    channel_id,
                    message_id,
                    updated: updated.take(),
                });
            }
            pending
        });
        if deferred {
            tracing::debug!(%message_id, "deferred edit until reconciliation completes");
            return EditOutcome::Deferred;
        }
        self.apply_edit(channel_id, message_id, updated).await
    }

    pub(crate) async fn apply_edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        updated: Option<SourceMessage>,
    ) -> EditOutcome {
        let plan = self.with_state(|state| {
            let registry = &state.registry;
            if registry.is_original(message_id) {
                return EditPlan::Propagate(registry.mirrors_of(message_id).to_vec());
            }
            if registry.find_reply_anchor_mirror(message_id).is_some() {
                return EditPlan::Done(EditOutcome::ChainedReplyStub);
            }
            if registry.is_mirror(message_id) {
                return EditPlan::Done(EditOutcome::MirrorEdited);
            }
            EditPlan::Done(EditOutcome::Untracked)
        });
        let mirrors = match plan {
            EditPlan::Done(outcome) => return outcome,
            EditPlan::Propagate(mirrors) => mirrors,
        };

        let updated = match updated {
            Some(updated) => updated,
            None => match self.inner.gateway.fetch_message(channel_id, message_id).await {
                Ok(Some(updated)) => updated,
                Ok(None) => return EditOutcome::SourceGone,
                Err(error) => {
                    tracing::warn!(%error, %message_id, "failed to refetch edited message");
                    return EditOutcome::SourceGone;
                }
            },
        };

        let emoji_table = self.inner.gateway.emoji_table().await;
        let (body, embeds) = render_mirror_body(&updated, &emoji_table);
        let preview = render_reply_preview(&render_display_name(&updated.author), &updated.content);

        let router = &self.inner.router;
        let (mut edited, mut skipped, mut failed) = (0, 0, 0);
        for mirror in mirrors {
            let result = match mirror.reply_anchor {
                None => router.mirror_ref(mirror).edit(router, &body, &embeds).await,
                Some(anchor) if anchor == message_id => {
                    router.mirror_ref(mirror).edit(router, &preview, &[]).await
                }
                Some(_) => {
                    skipped += 1;
                    continue;
                }
            };
            match result {
                Ok(()) => edited += 1,
                Err(error) if error.is_not_found() => {
                    tracing::debug!(mirror_id = %mirror.mirror_id, "mirror already gone, nothing to edit");
                    skipped += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        mirror_id = %mirror.mirror_id,
                        channel_id = %mirror.destination_channel_id,
                        "failed to edit mirror"
                    );
                    failed += 1;
                }
            }
        }
        EditOutcome::Propagated {
            edited,
            skipped,
            failed,
        }
    }

    /// Applies a delete of `message_id`: an original takes all its mirrors
    /// with it, a deleted mirror is only detached from its owner.
    pub async fn handle_delete(&self, channel_id: ChannelId, message_id: MessageId) -> DeleteOutcome {
        let deferred = self.with_state(|state| {
            let pending = state.gate.is_pending(message_id);
            if pending {
                state.gate.defer(DeferredEvent::Delete {
                    channel_id,
                    message_id,
                });
            }
            pending
        });
        if deferred {
            tracing::debug!(%message_id, "deferred delete until reconciliation completes");
            return DeleteOutcome::Deferred;
        }
        self.apply_delete(message_id).await
    }

    pub(crate) async fn apply_delete(&self, message_id: MessageId) -> DeleteOutcome {
        let plan = self.with_state(|state| {
            if state.registry.is_original(message_id) {
                return DeletePlan::Cascade(state.registry.untrack(message_id));
            }
            if let Some(owner) = state.registry.resolve_owner(message_id) {
                state.registry.detach_mirror(owner, message_id);
                return DeletePlan::Done(DeleteOutcome::MirrorDetached { owner });
            }
            DeletePlan::Done(DeleteOutcome::Untracked)
        });
        let mirrors = match plan {
            DeletePlan::Done(outcome) => {
                self.inner.retention.cancel(message_id);
                return outcome;
            }
            DeletePlan::Cascade(mirrors) => mirrors,
        };
        self.inner.retention.cancel(message_id);

        let router = &self.inner.router;
        let (mut deleted, mut already_gone, mut failed) = (0, 0, 0);
        for mirror in mirrors {
            match router.mirror_ref(mirror).delete(router).await {
                Ok(()) => deleted += 1,
                Err(error) if error.is_not_found() => already_gone += 1,
                Err(error) => {
                    tracing::warn!(
                        %error,
                        mirror_id = %mirror.mirror_id,
                        channel_id = %mirror.destination_channel_id,
                        "failed to delete mirror"
                    );
                    failed += 1;
                }
            }
        }
        tracing::info!(%message_id, deleted, already_gone, failed, "deleted mirrors of original");
        DeleteOutcome::CascadeDeleted {
            deleted,
            already_gone,
            failed,
        }
    }
}
