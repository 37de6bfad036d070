//! New-message relay: transform, fan out, track, schedule retention.

use rift_core::{current_unix_timestamp_ms, format_audit_line, retention_remaining};

use crate::content_transform::{
    render_display_name, render_preview_payload, render_primary_payload, shared_attachment,
};
use crate::mirror_engine::{note_send_failure, MirrorEngine};
use crate::model::{
    ChannelId, MessageId, MirrorEntry, OutboundAttachment, OutboundPayload, SourceMessage,
};

/// Progress markers of a single relay. A relay that stops early reports the
/// last stage it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayStage {
    Received,
    Transformed,
    FannedOut,
    Tracked,
    RetentionScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySkip {
    /// Posted by the relay account itself.
    RelayAuthor,
    /// Posted through a webhook, ours or anyone else's.
    WebhookMessage,
    /// Already known to the registry as a mirror.
    KnownMirror,
    /// The channel has no configured destinations.
    Unrouted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Skipped(RelaySkip),
    Relayed {
        stage: RelayStage,
        primaries: Vec<MirrorEntry>,
        previews: Vec<MirrorEntry>,
        failed_destinations: Vec<ChannelId>,
    },
}

struct ReplyPreview {
    anchor: MessageId,
    payload: OutboundPayload,
}

impl MirrorEngine {
    pub async fn relay_message(&self, message: SourceMessage) -> RelayOutcome {
        if let Some(skip) = self.relay_skip_reason(&message) {
            return RelayOutcome::Skipped(skip);
        }
        let router = &self.inner.router;
        let destinations = router.destinations_for(message.channel_id).to_vec();
        let mut stage = RelayStage::Received;

        let emoji_table = self.inner.gateway.emoji_table().await;
        let attachments = self.download_attachments(&message).await;
        let primary = render_primary_payload(&message, &emoji_table, &attachments);
        let preview = self.build_reply_preview(&message).await;
        stage = stage.max(RelayStage::Transformed);

        let mut primaries = Vec::new();
        let mut previews = Vec::new();
        let mut failed_destinations = Vec::new();
        for destination in destinations {
            let handle = match router.resolve_outbound_handle(destination).await {
                Ok(handle) => handle,
                Err(error) => {
                    tracing::warn!(%error, channel_id = %destination, "skipping unreachable destination");
                    failed_destinations.push(destination);
                    continue;
                }
            };

            if let Some(preview) = &preview {
                match handle.send(&preview.payload).await {
                    Ok(stub_id) => {
                        let stub = MirrorEntry::primary(stub_id, destination);
                        let owner = self.with_state(|state| {
                            let anchor = state
                                .gate
                                .snapshot_owner(preview.anchor)
                                .unwrap_or(preview.anchor);
                            state.registry.link_reply_into(anchor, stub)
                        });
                        if let Some(owner) = owner {
                            previews.push(MirrorEntry::reply_preview(stub_id, destination, owner));
                        }
                    }
                    Err(error) => note_send_failure(router, destination, &error, "reply preview"),
                }
            }

            match handle.send(&primary).await {
                Ok(mirror_id) => {
                    let entry = MirrorEntry::primary(mirror_id, destination);
                    self.with_state(|state| state.registry.track(message.id, [entry]));
                    primaries.push(entry);
                }
                Err(error) => {
                    note_send_failure(router, destination, &error, "primary");
                    failed_destinations.push(destination);
                }
            }
        }
        stage = stage.max(RelayStage::FannedOut);
        if !primaries.is_empty() {
            stage = stage.max(RelayStage::Tracked);
        }

        let delay = retention_remaining(
            message.created_unix_ms(),
            self.inner.config.retention.as_secs(),
            current_unix_timestamp_ms(),
        );
        self.inner
            .retention
            .schedule(message.channel_id, message.id, delay);
        stage = stage.max(RelayStage::RetentionScheduled);

        self.append_audit_record(&message).await;

        tracing::info!(
            message_id = %message.id,
            channel_id = %message.channel_id,
            mirrors = primaries.len(),
            previews = previews.len(),
            failed = failed_destinations.len(),
            "relayed message"
        );
        RelayOutcome::Relayed {
            stage,
            primaries,
            previews,
            failed_destinations,
        }
    }

    fn relay_skip_reason(&self, message: &SourceMessage) -> Option<RelaySkip> {
        if self.inner.gateway.relay_user_id() == Some(message.author.id) {
            return Some(RelaySkip::RelayAuthor);
        }
        if message.webhook_id.is_some() {
            return Some(RelaySkip::WebhookMessage);
        }
        if self.with_state(|state| state.registry.is_mirror(message.id)) {
            return Some(RelaySkip::KnownMirror);
        }
        if self.inner.router.destinations_for(message.channel_id).is_empty() {
            return Some(RelaySkip::Unrouted);
        }
        None
    }

    /// Downloads every attachment once; failed downloads are left out.
    async fn download_attachments(&self, message: &SourceMessage) -> Vec<OutboundAttachment> {
        let mut downloaded = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            match self.inner.gateway.download_attachment(attachment).await {
                Ok(bytes) => downloaded.push(shared_attachment(&attachment.filename, bytes)),
                Err(error) => tracing::warn!(
                    %error,
                    message_id = %message.id,
                    filename = %attachment.filename,
                    "failed to download attachment"
                ),
            }
        }
        downloaded
    }

    /// Quoted preview for a reply, or `None` when the message is not a reply
    /// or its target can no longer be read. Replying to a preview stub quotes
    /// the stub's own anchor instead of nesting a preview of a preview.
    async fn build_reply_preview(&self, message: &SourceMessage) -> Option<ReplyPreview> {
        let reference = message.reference?;

        let stub_anchor = self.with_state(|state| {
            state
                .registry
                .find_reply_anchor_mirror(reference.message_id)
                .and_then(|stub| stub.reply_anchor)
        });
        if let Some(anchor) = stub_anchor {
            let (quoted_author, quoted_text) = self.resolve_anchor_text(anchor).await?;
            return Some(ReplyPreview {
                anchor,
                payload: render_preview_payload(&message.author, &quoted_author, &quoted_text),
            });
        }

        let referenced = match message.referenced.as_deref() {
            Some(referenced) => referenced.clone(),
            None => match self
                .inner
                .gateway
                .fetch_message(reference.channel_id, reference.message_id)
                .await
            {
                Ok(Some(referenced)) => referenced,
                Ok(None) => {
                    tracing::debug!(
                        message_id = %message.id,
                        referenced_id = %reference.message_id,
                        "reply target is gone, relaying without preview"
                    );
                    return None;
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        referenced_id = %reference.message_id,
                        "failed to fetch reply target, relaying without preview"
                    );
                    return None;
                }
            },
        };
        Some(ReplyPreview {
            anchor: reference.message_id,
            payload: render_preview_payload(
                &message.author,
                &render_display_name(&referenced.author),
                &referenced.content,
            ),
        })
    }

    /// Author and text of `anchor`, read back from its first primary mirror.
    pub(crate) async fn resolve_anchor_text(&self, anchor: MessageId) -> Option<(String, String)> {
        let primary = self.with_state(|state| {
            state
                .registry
                .mirrors_of(anchor)
                .iter()
                .find(|mirror| !mirror.is_reply_preview())
                .copied()
        })?;
        let mirror_ref = self.inner.router.mirror_ref(primary);
        match mirror_ref.resolve_message(&self.inner.router).await {
            Ok(Some(mirror)) => Some((mirror.display_name, mirror.content)),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(%error, %anchor, "failed to read back anchor mirror");
                None
            }
        }
    }

    async fn append_audit_record(&self, message: &SourceMessage) {
        let Some(audit_log) = self.inner.config.audit_log.as_ref() else {
            return;
        };
        let labels = self.inner.gateway.channel_labels(message.channel_id).await;
        let line = format_audit_line(
            message.created_at,
            &labels.guild_name,
            &labels.channel_name,
            &render_display_name(&message.author),
            &message.content,
        );
        let audit_log = audit_log.clone();
        let appended = tokio::task::spawn_blocking(move || audit_log.append_line(&line)).await;
        match appended {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(error = %format!("{error:#}"), "failed to append audit line"),
            Err(error) => tracing::warn!(%error, "audit writer task failed"),
        }
    }
}
