//! Engine wiring: shared state, event dispatch, stats and shutdown.
//!
//! Platform events are consumed one at a time from a single queue. Handlers
//! suspend on network calls, so registry access goes through short critical
//! sections that are never held across an `.await`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rift_core::AuditLog;
use tokio::sync::mpsc;

use crate::channel_router::{ChannelRouter, ChannelRoutes};
use crate::collaborators::{OutboundIdentityProvider, PlatformGateway};
use crate::error::{RiftError, RiftResult};
use crate::mirror_registry::MirrorRegistry;
use crate::model::{ChannelId, MessageId, SourceMessage};
use crate::reconciliation::ReconciliationGate;
use crate::retention::RetentionScheduler;
use crate::snapshot_store::{RegistrySnapshot, SnapshotStore, SnapshotWrite};

const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const DEFAULT_HISTORY_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct MirrorEngineConfig {
    pub routes: ChannelRoutes,
    pub retention: Duration,
    pub snapshot_path: PathBuf,
    pub audit_log: Option<AuditLog>,
    pub history_page_size: usize,
}

impl MirrorEngineConfig {
    pub fn new(routes: ChannelRoutes, retention: Duration, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            routes,
            retention,
            snapshot_path: snapshot_path.into(),
            audit_log: None,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }

    pub fn with_audit_log(mut self, audit_log: AuditLog) -> Self {
        self.audit_log = Some(audit_log);
        self
    }
}

/// Everything the engine reacts to, in arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    MessageCreated(SourceMessage),
    /// `updated` is the post-edit message when the platform had it cached;
    /// otherwise the engine refetches it.
    MessageEdited {
        channel_id: ChannelId,
        message_id: MessageId,
        updated: Option<SourceMessage>,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
        cached: bool,
    },
    RetentionExpired {
        channel_id: ChannelId,
        message_id: MessageId,
        generation: u64,
    },
    ConnectionEstablished,
    ConnectionLost,
    Shutdown,
}

/// Receiving end of the engine's event queue, consumed by [`MirrorEngine::run`].
pub struct EngineEventLoop {
    receiver: mpsc::Receiver<EngineEvent>,
}

impl EngineEventLoop {
    /// Next queued event, for callers driving the engine by hand.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub tracked_originals: usize,
    pub mirror_links: usize,
    pub pending_ids: usize,
    pub deferred_events: usize,
    pub scheduled_deletions: usize,
}

pub(crate) struct EngineState {
    pub(crate) registry: MirrorRegistry,
    pub(crate) gate: ReconciliationGate,
}

pub(crate) struct EngineInner {
    pub(crate) config: MirrorEngineConfig,
    pub(crate) gateway: Arc<dyn PlatformGateway>,
    pub(crate) router: ChannelRouter,
    pub(crate) retention: RetentionScheduler,
    state: Mutex<EngineState>,
    snapshots: SnapshotStore,
    events: mpsc::Sender<EngineEvent>,
    reconciliation_started: AtomicBool,
}

#[derive(Clone)]
pub struct MirrorEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl MirrorEngine {
    /// Builds the engine and loads the snapshot. Every id in the snapshot is
    /// pending until [`MirrorEngine::reconcile`] runs. A malformed snapshot is
    /// returned as [`RiftError::CorruptPersistentState`] and must abort startup.
    pub fn new(
        config: MirrorEngineConfig,
        gateway: Arc<dyn PlatformGateway>,
        provider: Arc<dyn OutboundIdentityProvider>,
    ) -> RiftResult<(Self, EngineEventLoop)> {
        let snapshots = SnapshotStore::new(config.snapshot_path.clone());
        let mut gate = ReconciliationGate::default();
        if let Some(snapshot) = snapshots.load()? {
            tracing::info!(
                path = %snapshots.path().display(),
                originals = snapshot.originals.len(),
                mirrors = snapshot.mirror_count(),
                "loaded mirror snapshot"
            );
            gate.begin(snapshot);
        }

        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let router = ChannelRouter::new(config.routes.clone(), provider);
        let engine = Self {
            inner: Arc::new(EngineInner {
                retention: RetentionScheduler::new(events.clone()),
                config,
                gateway,
                router,
                state: Mutex::new(EngineState {
                    registry: MirrorRegistry::new(),
                    gate,
                }),
                snapshots,
                events,
                reconciliation_started: AtomicBool::new(false),
            }),
        };
        Ok((engine, EngineEventLoop { receiver }))
    }

    /// Sender for platform adapters to push events into the engine.
    pub fn event_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.inner.events.clone()
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.inner.router
    }

    pub fn retention(&self) -> &RetentionScheduler {
        &self.inner.retention
    }

    pub(crate) fn with_state<R>(&self, apply: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        apply(&mut state)
    }

    /// Read-only access to the registry.
    pub fn inspect_registry<R>(&self, inspect: impl FnOnce(&MirrorRegistry) -> R) -> R {
        self.with_state(|state| inspect(&state.registry))
    }

    pub fn is_reconciling(&self) -> bool {
        self.with_state(|state| state.gate.is_active())
    }

    pub(crate) fn mark_reconciliation_started(&self) -> bool {
        !self
            .inner
            .reconciliation_started
            .swap(true, Ordering::SeqCst)
    }

    pub fn stats(&self) -> EngineStats {
        let (tracked_originals, mirror_links, pending_ids, deferred_events) =
            self.with_state(|state| {
                (
                    state.registry.original_count(),
                    state.registry.mirror_count(),
                    state.gate.pending_len(),
                    state.gate.deferred_len(),
                )
            });
        EngineStats {
            tracked_originals,
            mirror_links,
            pending_ids,
            deferred_events,
            scheduled_deletions: self.inner.retention.len(),
        }
    }

    /// Processes queued events until [`EngineEvent::Shutdown`] arrives, then
    /// persists the snapshot.
    pub async fn run(&self, mut events: EngineEventLoop) -> RiftResult<SnapshotWrite> {
        while let Some(event) = events.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                tracing::info!("engine shutdown requested");
                break;
            }
            self.handle_event(event).await;
        }
        self.shutdown()
    }

    pub async fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::MessageCreated(message) => {
                let message_id = message.id;
                let outcome = self.relay_message(message).await;
                tracing::debug!(%message_id, ?outcome, "message created");
            }
            EngineEvent::MessageEdited {
                channel_id,
                message_id,
                updated,
            } => {
                let cached = updated.is_some();
                let outcome = self.handle_edit(channel_id, message_id, updated).await;
                tracing::debug!(%message_id, cached, ?outcome, "message edited");
            }
            EngineEvent::MessageDeleted {
                channel_id,
                message_id,
                cached,
            } => {
                let outcome = self.handle_delete(channel_id, message_id).await;
                tracing::debug!(%message_id, cached, ?outcome, "message deleted");
            }
            EngineEvent::RetentionExpired {
                channel_id,
                message_id,
                generation,
            } => {
                self.handle_retention_expired(channel_id, message_id, generation)
                    .await;
            }
            EngineEvent::ConnectionEstablished => {
                tracing::info!("platform connection established");
                if self.mark_reconciliation_started() {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let report = engine.run_reconciliation().await;
                        tracing::info!(?report, "reconciliation finished");
                    });
                }
            }
            EngineEvent::ConnectionLost => {
                tracing::warn!("platform connection lost");
            }
            EngineEvent::Shutdown => {}
        }
    }

    /// Snapshot of live links. While reconciliation is still running, entries
    /// from the loaded snapshot that have not been rebuilt yet are kept.
    pub fn current_snapshot(&self) -> RegistrySnapshot {
        self.with_state(|state| {
            let mut snapshot = RegistrySnapshot::from_registry(&state.registry);
            if let Some(unreconciled) = state.gate.snapshot() {
                snapshot.merge_missing(unreconciled);
            }
            snapshot
        })
    }

    pub fn save_snapshot(&self) -> RiftResult<SnapshotWrite> {
        let written = self.inner.snapshots.save(&self.current_snapshot())?;
        tracing::info!(
            path = %self.inner.snapshots.path().display(),
            ?written,
            "mirror snapshot saved"
        );
        Ok(written)
    }

    /// Cancels pending retention timers and writes the snapshot.
    pub fn shutdown(&self) -> RiftResult<SnapshotWrite> {
        let stats = self.stats();
        tracing::info!(?stats, "engine shutting down");
        self.inner.retention.cancel_all();
        self.save_snapshot()
    }

    async fn handle_retention_expired(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        generation: u64,
    ) {
        if !self.inner.retention.claim(message_id, generation) {
            tracing::debug!(%message_id, generation, "ignoring superseded retention expiry");
            return;
        }
        match self.inner.gateway.delete_message(channel_id, message_id).await {
            Ok(()) => tracing::debug!(%message_id, "retention deleted original"),
            Err(error) if error.is_not_found() => {
                tracing::debug!(%message_id, "original already gone at retention expiry")
            }
            Err(error) => {
                tracing::warn!(%error, %message_id, "failed to delete original at retention expiry")
            }
        }
        let outcome = self.handle_delete(channel_id, message_id).await;
        tracing::debug!(%message_id, ?outcome, "retention cascade finished");
    }
}

/// A send that comes back NotFound means the outbound identity itself was
/// removed, so the memoized handle is dropped and recreated on next use.
pub(crate) fn note_send_failure(
    router: &ChannelRouter,
    channel_id: ChannelId,
    error: &RiftError,
    payload_kind: &str,
) {
    if error.is_not_found() {
        router.forget(channel_id);
    }
    tracing::warn!(%error, %channel_id, payload_kind, "send to destination failed");
}

#[cfg(test)]
mod tests;
