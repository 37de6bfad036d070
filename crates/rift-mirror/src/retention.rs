//! Cancellable delayed deletions keyed by message id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mirror_engine::EngineEvent;
use crate::model::{ChannelId, MessageId};

struct ScheduledDeletion {
    generation: u64,
    handle: JoinHandle<()>,
}

/// At most one pending deletion exists per message id; rescheduling aborts
/// the previous timer. Expiry is delivered as [`EngineEvent::RetentionExpired`]
/// so it is processed on the engine's event stream.
pub struct RetentionScheduler {
    events: mpsc::Sender<EngineEvent>,
    tasks: Mutex<HashMap<MessageId, ScheduledDeletion>>,
    next_generation: AtomicU64,
}

impl RetentionScheduler {
    pub fn new(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events,
            tasks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// (Re)schedules deletion of `message_id` after `delay` and returns the
    /// generation the expiry event will carry.
    pub fn schedule(&self, channel_id: ChannelId, message_id: MessageId, delay: Duration) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let expired = EngineEvent::RetentionExpired {
                channel_id,
                message_id,
                generation,
            };
            if events.send(expired).await.is_err() {
                tracing::debug!(%message_id, "engine stopped before retention expiry");
            }
        });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id, ScheduledDeletion { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        generation
    }

    pub fn cancel(&self, message_id: MessageId) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message_id);
        match removed {
            Some(scheduled) => {
                scheduled.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consumes the schedule entry when `generation` is still current. A stale
    /// expiry from a timer that was replaced returns false.
    pub fn claim(&self, message_id: MessageId, generation: u64) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(&message_id) {
            Some(scheduled) if scheduled.generation == generation => {
                tasks.remove(&message_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self, message_id: MessageId) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, scheduled) in drained {
            scheduled.handle.abort();
        }
    }
}
