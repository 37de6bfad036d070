//! Startup reconciliation of the loaded snapshot against live history.
//!
//! While reconciliation runs, every id mentioned in the snapshot is pending.
//! Edits and deletes that target a pending id are queued as
//! [`DeferredEvent`]s and replayed in arrival order once the registry has
//! been rebuilt. Ids stay pending until the queue is empty, so live events
//! arriving during the replay line up behind it. New messages are relayed
//! normally in the meantime.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rift_core::{current_unix_timestamp_ms, retention_remaining};

use crate::collaborators::OutboundHandle;
use crate::mirror_engine::MirrorEngine;
use crate::mirror_registry::MirrorRegistry;
use crate::model::{ChannelId, MessageId, MirrorEntry, SourceMessage};
use crate::snapshot_store::RegistrySnapshot;

/// An edit or delete held back until reconciliation finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredEvent {
    Edit {
        channel_id: ChannelId,
        message_id: MessageId,
        updated: Option<SourceMessage>,
    },
    Delete {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

impl DeferredEvent {
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Edit { message_id, .. } | Self::Delete { message_id, .. } => *message_id,
        }
    }
}

/// Pending ids and the deferred work queue.
#[derive(Debug, Default)]
pub struct ReconciliationGate {
    snapshot: Option<RegistrySnapshot>,
    pending: HashSet<MessageId>,
    deferred: VecDeque<DeferredEvent>,
}

impl ReconciliationGate {
    /// Marks every id mentioned by `snapshot` as pending.
    pub fn begin(&mut self, snapshot: RegistrySnapshot) {
        self.pending = snapshot.mentioned_ids().collect();
        self.snapshot = Some(snapshot);
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.is_some() || !self.pending.is_empty()
    }

    pub fn is_pending(&self, message_id: MessageId) -> bool {
        self.pending.contains(&message_id)
    }

    pub fn pending_ids(&self) -> &HashSet<MessageId> {
        &self.pending
    }

    /// The loaded snapshot, until [`ReconciliationGate::finish_rebuild`].
    pub fn snapshot(&self) -> Option<&RegistrySnapshot> {
        self.snapshot.as_ref()
    }

    /// Original that the loaded snapshot records as owning `mirror_id`.
    pub fn snapshot_owner(&self, mirror_id: MessageId) -> Option<MessageId> {
        self.snapshot.as_ref()?.owner_of(mirror_id)
    }

    pub fn defer(&mut self, event: DeferredEvent) {
        self.deferred.push_back(event);
    }

    /// Drops the loaded snapshot once the registry carries its links. Ids
    /// stay pending until the deferred queue has been drained.
    pub fn finish_rebuild(&mut self) {
        self.snapshot = None;
    }

    /// Next queued event in arrival order. An empty queue clears the pending
    /// set in the same step, so nothing can be queued after the last replay.
    pub fn next_deferred(&mut self) -> Option<DeferredEvent> {
        let next = self.deferred.pop_front();
        if next.is_none() {
            self.snapshot = None;
            self.pending.clear();
        }
        next
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub pending_ids: usize,
    pub found_alive: usize,
    pub restored_originals: usize,
    pub restored_links: usize,
    pub dropped_originals: usize,
    pub replayed_events: usize,
    pub orphans_deleted: usize,
    pub retention_rescheduled: usize,
    pub unreachable_channels: Vec<ChannelId>,
}

impl MirrorEngine {
    /// Runs reconciliation once per engine. Later calls return `None`.
    pub async fn reconcile(&self) -> Option<ReconciliationReport> {
        if !self.mark_reconciliation_started() {
            return None;
        }
        Some(self.run_reconciliation().await)
    }

    pub(crate) async fn run_reconciliation(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        let snapshot = self.with_state(|state| state.gate.snapshot().cloned());

        if let Some(snapshot) = snapshot {
            let pending = self.with_state(|state| state.gate.pending_ids().clone());
            report.pending_ids = pending.len();
            let alive = self.locate_pending(pending, &mut report).await;
            report.found_alive = alive.len();
            let deferred = self.with_state(|state| {
                rebuild_registry(&snapshot, &alive, &mut state.registry, &mut report);
                state.gate.finish_rebuild();
                state.gate.deferred_len()
            });
            tracing::info!(
                restored_originals = report.restored_originals,
                restored_links = report.restored_links,
                dropped_originals = report.dropped_originals,
                deferred,
                "registry rebuilt from snapshot"
            );
        }

        while let Some(event) = self.with_state(|state| state.gate.next_deferred()) {
            report.replayed_events += 1;
            match event {
                DeferredEvent::Edit {
                    channel_id,
                    message_id,
                    updated,
                } => {
                    let outcome = self.apply_edit(channel_id, message_id, updated).await;
                    tracing::debug!(%message_id, ?outcome, "replayed deferred edit");
                }
                DeferredEvent::Delete { message_id, .. } => {
                    let outcome = self.apply_delete(message_id).await;
                    tracing::debug!(%message_id, ?outcome, "replayed deferred delete");
                }
            }
        }

        self.sweep(&mut report).await;
        report
    }

    /// Walks the history of every configured channel until each pending id
    /// has been seen or history runs out. Returns the live ids with the
    /// channel they were found in.
    async fn locate_pending(
        &self,
        mut remaining: HashSet<MessageId>,
        report: &mut ReconciliationReport,
    ) -> HashMap<MessageId, ChannelId> {
        let mut alive = HashMap::new();
        for channel_id in self.inner.router.routes().all_channels() {
            if remaining.is_empty() {
                break;
            }
            let mut before = None;
            loop {
                let page = match self
                    .inner
                    .gateway
                    .history_before(channel_id, before, self.inner.config.history_page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(error) => {
                        tracing::warn!(%error, %channel_id, "skipping unreachable channel");
                        if !report.unreachable_channels.contains(&channel_id) {
                            report.unreachable_channels.push(channel_id);
                        }
                        break;
                    }
                };
                let Some(oldest) = page.last().map(|message| message.id) else {
                    break;
                };
                for message in &page {
                    if remaining.remove(&message.id) {
                        alive.insert(message.id, channel_id);
                    }
                }
                if remaining.is_empty() {
                    break;
                }
                before = Some(oldest);
            }
        }
        if !remaining.is_empty() {
            tracing::info!(missing = remaining.len(), "snapshot ids not found in history");
        }
        alive
    }

    /// Second history pass: deletes relay-identity messages nobody owns and
    /// (re)schedules retention for every original still present.
    async fn sweep(&self, report: &mut ReconciliationReport) {
        let started_at = Utc::now();
        let routes = self.inner.router.routes();
        let destinations = routes.destination_channels();

        for channel_id in routes.all_channels() {
            let handle = if destinations.contains(&channel_id) {
                match self.inner.router.resolve_outbound_handle(channel_id).await {
                    Ok(handle) => Some(handle),
                    Err(error) => {
                        tracing::warn!(%error, %channel_id, "no outbound identity for sweep");
                        None
                    }
                }
            } else {
                None
            };
            let is_source = !routes.destinations_for(channel_id).is_empty();

            let mut before = None;
            loop {
                let page = match self
                    .inner
                    .gateway
                    .history_before(channel_id, before, self.inner.config.history_page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(error) => {
                        tracing::warn!(%error, %channel_id, "skipping unreachable channel in sweep");
                        if !report.unreachable_channels.contains(&channel_id) {
                            report.unreachable_channels.push(channel_id);
                        }
                        break;
                    }
                };
                let Some(oldest) = page.last().map(|message| message.id) else {
                    break;
                };
                for message in &page {
                    self.sweep_message(message, handle.as_ref(), is_source, started_at, report)
                        .await;
                }
                before = Some(oldest);
            }
        }
        tracing::info!(
            orphans_deleted = report.orphans_deleted,
            retention_rescheduled = report.retention_rescheduled,
            "reconciliation sweep finished"
        );
    }

    async fn sweep_message(
        &self,
        message: &SourceMessage,
        handle: Option<&Arc<dyn OutboundHandle>>,
        is_source: bool,
        started_at: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) {
        if let Some(webhook_id) = message.webhook_id {
            let Some(handle) = handle.filter(|handle| handle.identity_id() == webhook_id) else {
                return;
            };
            // Mirrors posted after the sweep began may not be tracked yet.
            if message.created_at >= started_at
                || self.with_state(|state| state.registry.is_mirror(message.id))
            {
                return;
            }
            match handle.delete(message.id).await {
                Ok(()) => report.orphans_deleted += 1,
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    tracing::warn!(%error, mirror_id = %message.id, "failed to delete orphan mirror")
                }
            }
            return;
        }

        if !is_source || self.inner.gateway.relay_user_id() == Some(message.author.id) {
            return;
        }
        let delay = retention_remaining(
            message.created_unix_ms(),
            self.inner.config.retention.as_secs(),
            current_unix_timestamp_ms(),
        );
        self.inner
            .retention
            .schedule(message.channel_id, message.id, delay);
        report.retention_rescheduled += 1;
    }
}

/// Restores originals found alive with whichever of their mirrors survived,
/// keeping each mirror's recorded reply anchor. Anything already linked under
/// a surviving mirror's id while it was pending is folded into its original.
pub(crate) fn rebuild_registry(
    snapshot: &RegistrySnapshot,
    alive: &HashMap<MessageId, ChannelId>,
    registry: &mut MirrorRegistry,
    report: &mut ReconciliationReport,
) {
    for (original_id, mirrors) in &snapshot.originals {
        if !alive.contains_key(original_id) {
            report.dropped_originals += 1;
            continue;
        }
        let surviving: Vec<MirrorEntry> = mirrors
            .iter()
            .filter_map(|mirror| {
                alive.get(&mirror.mirror_id).map(|channel_id| MirrorEntry {
                    mirror_id: mirror.mirror_id,
                    destination_channel_id: *channel_id,
                    reply_anchor: mirror.reply_anchor,
                })
            })
            .collect();
        if surviving.is_empty() {
            report.dropped_originals += 1;
            continue;
        }
        for mirror in &surviving {
            let folded = registry.fold_into(*original_id, mirror.mirror_id);
            if folded > 0 {
                tracing::info!(
                    %original_id,
                    mirror_id = %mirror.mirror_id,
                    folded,
                    "moved links made during reconciliation under their original"
                );
            }
        }
        let linked = registry.track(*original_id, surviving);
        if linked > 0 {
            report.restored_originals += 1;
            report.restored_links += linked;
        } else {
            tracing::warn!(%original_id, "no snapshot mirror could be relinked");
            report.dropped_originals += 1;
        }
    }
}
