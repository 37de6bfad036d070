//! Source → destination routing and memoized outbound identities.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::collaborators::{OutboundHandle, OutboundIdentityProvider};
use crate::error::RiftResult;
use crate::model::{ChannelId, Embed, MessageId, MirrorEntry, MirrorMessage};

/// Static routing table from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRoutes {
    routes: BTreeMap<ChannelId, Vec<ChannelId>>,
}

impl ChannelRoutes {
    /// Builds the table, dropping self-routes and repeated destinations while
    /// keeping first-seen order.
    pub fn new(routes: impl IntoIterator<Item = (ChannelId, Vec<ChannelId>)>) -> Self {
        let mut table: BTreeMap<ChannelId, Vec<ChannelId>> = BTreeMap::new();
        for (source, destinations) in routes {
            let slot = table.entry(source).or_default();
            for destination in destinations {
                if destination != source && !slot.contains(&destination) {
                    slot.push(destination);
                }
            }
        }
        table.retain(|_, destinations| !destinations.is_empty());
        Self { routes: table }
    }

    pub fn destinations_for(&self, source: ChannelId) -> &[ChannelId] {
        self.routes.get(&source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn source_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.routes.keys().copied()
    }

    pub fn destination_channels(&self) -> BTreeSet<ChannelId> {
        self.routes.values().flatten().copied().collect()
    }

    /// Every configured channel, sources and destinations alike.
    pub fn all_channels(&self) -> BTreeSet<ChannelId> {
        let mut channels = self.destination_channels();
        channels.extend(self.source_channels());
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

pub struct ChannelRouter {
    routes: ChannelRoutes,
    provider: Arc<dyn OutboundIdentityProvider>,
    handles: Mutex<HashMap<ChannelId, Arc<dyn OutboundHandle>>>,
    resolving: tokio::sync::Mutex<()>,
}

impl ChannelRouter {
    pub fn new(routes: ChannelRoutes, provider: Arc<dyn OutboundIdentityProvider>) -> Self {
        Self {
            routes,
            provider,
            handles: Mutex::new(HashMap::new()),
            resolving: tokio::sync::Mutex::new(()),
        }
    }

    pub fn routes(&self) -> &ChannelRoutes {
        &self.routes
    }

    pub fn destinations_for(&self, source: ChannelId) -> &[ChannelId] {
        self.routes.destinations_for(source)
    }

    pub fn cached_handle(&self, channel_id: ChannelId) -> Option<Arc<dyn OutboundHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel_id)
            .cloned()
    }

    /// Memoized find-or-create of the outbound identity for `channel_id`.
    /// Resolution is serialized so concurrent callers never create two.
    pub async fn resolve_outbound_handle(
        &self,
        channel_id: ChannelId,
    ) -> RiftResult<Arc<dyn OutboundHandle>> {
        if let Some(handle) = self.cached_handle(channel_id) {
            return Ok(handle);
        }
        let _resolving = self.resolving.lock().await;
        if let Some(handle) = self.cached_handle(channel_id) {
            return Ok(handle);
        }
        let handle = self.provider.resolve(channel_id).await?;
        tracing::debug!(
            channel_id = %channel_id,
            identity_id = handle.identity_id(),
            "resolved outbound identity"
        );
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops a memoized handle, e.g. after its identity was deleted remotely.
    pub fn forget(&self, channel_id: ChannelId) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel_id);
    }

    /// True when `webhook_id` is the relay's own identity in `channel_id`.
    pub fn is_relay_identity(&self, channel_id: ChannelId, webhook_id: u64) -> bool {
        self.cached_handle(channel_id)
            .is_some_and(|handle| handle.identity_id() == webhook_id)
    }

    /// Addresses a registry entry, live when its channel handle is already
    /// resolved and lazily otherwise.
    pub fn mirror_ref(&self, entry: MirrorEntry) -> MirrorRef {
        match self.cached_handle(entry.destination_channel_id) {
            Some(handle) => MirrorRef::Live { handle, entry },
            None => MirrorRef::Detached(entry),
        }
    }
}

/// A mirror that can be edited, deleted or read back. `Detached` mirrors
/// (e.g. rebuilt from a snapshot) resolve their channel handle on first use.
#[derive(Clone)]
pub enum MirrorRef {
    Live {
        handle: Arc<dyn OutboundHandle>,
        entry: MirrorEntry,
    },
    Detached(MirrorEntry),
}

impl MirrorRef {
    pub fn entry(&self) -> &MirrorEntry {
        match self {
            Self::Live { entry, .. } | Self::Detached(entry) => entry,
        }
    }

    pub fn mirror_id(&self) -> MessageId {
        self.entry().mirror_id
    }

    async fn handle(&self, router: &ChannelRouter) -> RiftResult<Arc<dyn OutboundHandle>> {
        match self {
            Self::Live { handle, .. } => Ok(Arc::clone(handle)),
            Self::Detached(entry) => {
                router
                    .resolve_outbound_handle(entry.destination_channel_id)
                    .await
            }
        }
    }

    pub async fn edit(
        &self,
        router: &ChannelRouter,
        content: &str,
        embeds: &[Embed],
    ) -> RiftResult<()> {
        self.handle(router)
            .await?
            .edit(self.mirror_id(), content, embeds)
            .await
    }

    pub async fn delete(&self, router: &ChannelRouter) -> RiftResult<()> {
        self.handle(router).await?.delete(self.mirror_id()).await
    }

    pub async fn resolve_message(&self, router: &ChannelRouter) -> RiftResult<Option<MirrorMessage>> {
        self.handle(router).await?.fetch(self.mirror_id()).await
    }
}

impl std::fmt::Debug for MirrorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live { entry, .. } => f.debug_tuple("Live").field(entry).finish(),
            Self::Detached(entry) => f.debug_tuple("Detached").field(entry).finish(),
        }
    }
}
