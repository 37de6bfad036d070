use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rift_core::{AuditLog, AuditRotationPolicy};
use tempfile::TempDir;

use super::{EngineEvent, EngineEventLoop, MirrorEngine, MirrorEngineConfig};
use crate::channel_router::ChannelRoutes;
use crate::edit_delete_sync::{DeleteOutcome, EditOutcome};
use crate::error::RiftError;
use crate::model::{AttachmentRef, ChannelId, MessageId, MirrorEntry, SourceMessage, UserId};
use crate::reconciliation::{rebuild_registry, ReconciliationReport};
use crate::relay_pipeline::{RelayOutcome, RelaySkip, RelayStage};
use crate::snapshot_store::{SnapshotStore, SnapshotWrite};
use crate::testing::{author, reply_to, source_message, FakeOutbound, FakePlatform};

const RELAY_USER: u64 = 9_999;

fn ch(raw: u64) -> ChannelId {
    ChannelId::new(raw)
}

fn mid(raw: u64) -> MessageId {
    MessageId::new(raw)
}

fn routes(pairs: &[(u64, &[u64])]) -> ChannelRoutes {
    ChannelRoutes::new(
        pairs
            .iter()
            .map(|(source, destinations)| (ch(*source), destinations.iter().map(|d| ch(*d)).collect())),
    )
}

struct Harness {
    engine: MirrorEngine,
    events: EngineEventLoop,
    platform: Arc<FakePlatform>,
    outbound: Arc<FakeOutbound>,
    snapshot_path: PathBuf,
    audit_path: PathBuf,
    _dir: TempDir,
}

struct Setup {
    routes: ChannelRoutes,
    snapshot: Option<&'static str>,
    retention: Duration,
    audit_log: bool,
}

impl Setup {
    fn new(routes: ChannelRoutes) -> Self {
        Self {
            routes,
            snapshot: None,
            retention: Duration::from_secs(3_600),
            audit_log: false,
        }
    }

    fn snapshot(mut self, raw: &'static str) -> Self {
        self.snapshot = Some(raw);
        self
    }

    fn retention_secs(mut self, seconds: u64) -> Self {
        self.retention = Duration::from_secs(seconds);
        self
    }

    fn audit_log(mut self) -> Self {
        self.audit_log = true;
        self
    }

    fn build(self) -> Harness {
        self.try_build().unwrap_or_else(|error| panic!("engine should start: {error}"))
    }

    fn try_build(self) -> Result<Harness, RiftError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshot_path = dir.path().join("rift-snapshot.json");
        let audit_path = dir.path().join("backup.txt");
        if let Some(raw) = self.snapshot {
            std::fs::write(&snapshot_path, raw).expect("write snapshot");
        }
        let platform = Arc::new(FakePlatform::new());
        platform.set_relay_user(UserId::new(RELAY_USER));
        let outbound = Arc::new(FakeOutbound::new(platform.clone()));

        let mut config = MirrorEngineConfig::new(self.routes, self.retention, &snapshot_path);
        if self.audit_log {
            config = config.with_audit_log(AuditLog::new(&audit_path, AuditRotationPolicy::default()));
        }
        let (engine, events) = MirrorEngine::new(config, platform.clone(), outbound.clone())?;
        Ok(Harness {
            engine,
            events,
            platform,
            outbound,
            snapshot_path,
            audit_path,
            _dir: dir,
        })
    }
}

impl Harness {
    async fn relay(&self, message: SourceMessage) -> (Vec<MirrorEntry>, Vec<MirrorEntry>) {
        self.platform.post(message.clone());
        match self.engine.relay_message(message).await {
            RelayOutcome::Relayed {
                primaries,
                previews,
                ..
            } => (primaries, previews),
            other => panic!("expected a relay, got {other:?}"),
        }
    }

    fn links(&self) -> Vec<(MessageId, Vec<MirrorEntry>)> {
        self.engine.inspect_registry(|registry| {
            registry
                .originals()
                .into_iter()
                .map(|(id, mirrors)| (id, mirrors.to_vec()))
                .collect()
        })
    }

    fn owner_of(&self, id: MessageId) -> Option<MessageId> {
        self.engine.inspect_registry(|registry| registry.resolve_owner(id))
    }
}

fn edited(message: &SourceMessage, content: &str) -> SourceMessage {
    let mut updated = message.clone();
    updated.content = content.to_string();
    updated
}

#[tokio::test]
async fn functional_relay_fans_out_to_every_destination_and_tracks() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    let message = source_message(100, 1, "hello");
    h.platform.post(message.clone());

    let RelayOutcome::Relayed {
        stage,
        primaries,
        previews,
        failed_destinations,
    } = h.engine.relay_message(message).await
    else {
        panic!("message should be relayed");
    };

    assert_eq!(stage, RelayStage::RetentionScheduled);
    assert!(previews.is_empty());
    assert!(failed_destinations.is_empty());
    let destinations: Vec<_> = primaries.iter().map(|m| m.destination_channel_id).collect();
    assert_eq!(destinations, vec![ch(2), ch(3)]);
    assert_eq!(h.links(), vec![(mid(100), primaries.clone())]);
    assert!(h.engine.inspect_registry(|registry| registry.is_symmetric()));
    assert!(h.engine.retention().is_scheduled(mid(100)));
    for mirror in &primaries {
        assert_eq!(
            h.outbound
                .mirror_content(mirror.destination_channel_id, mirror.mirror_id)
                .as_deref(),
            Some("hello")
        );
    }
    assert_eq!(h.outbound.sends_to(ch(2))[0].display_name, "user1");
}

#[tokio::test]
async fn functional_relay_skips_relay_account_webhooks_known_mirrors_and_unrouted() {
    let h = Setup::new(routes(&[(1, &[2])])).build();
    let (primaries, _) = h.relay(source_message(100, 1, "hello")).await;

    let mut own = source_message(101, 1, "echo");
    own.author = author(RELAY_USER, "rift");
    let mut hooked = source_message(102, 1, "hooked");
    hooked.webhook_id = Some(55);
    let known = source_message(primaries[0].mirror_id.get(), 2, "mirror");
    let unrouted = source_message(103, 9, "elsewhere");

    assert_eq!(
        h.engine.relay_message(own).await,
        RelayOutcome::Skipped(RelaySkip::RelayAuthor)
    );
    assert_eq!(
        h.engine.relay_message(hooked).await,
        RelayOutcome::Skipped(RelaySkip::WebhookMessage)
    );
    assert_eq!(
        h.engine.relay_message(known).await,
        RelayOutcome::Skipped(RelaySkip::KnownMirror)
    );
    assert_eq!(
        h.engine.relay_message(unrouted).await,
        RelayOutcome::Skipped(RelaySkip::Unrouted)
    );
    assert_eq!(h.outbound.sends().len(), 1);
}

#[tokio::test]
async fn functional_zero_successful_sends_tracks_nothing() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    h.outbound.fail_sends_to(ch(2));
    h.outbound.fail_sends_to(ch(3));
    let message = source_message(100, 1, "hello");
    h.platform.post(message.clone());

    let RelayOutcome::Relayed {
        primaries,
        failed_destinations,
        ..
    } = h.engine.relay_message(message).await
    else {
        panic!("message should be attempted");
    };

    assert!(primaries.is_empty());
    assert_eq!(failed_destinations, vec![ch(2), ch(3)]);
    assert!(h.engine.inspect_registry(|registry| registry.is_empty()));
    assert_eq!(h.engine.stats().tracked_originals, 0);
}

#[tokio::test]
async fn functional_failed_destination_does_not_block_the_others() {
    let h = Setup::new(routes(&[(1, &[2, 3, 4])])).build();
    h.outbound.fail_sends_to(ch(3));
    h.outbound.refuse_identity_in(ch(4));

    let message = source_message(100, 1, "hello");
    h.platform.post(message.clone());
    let RelayOutcome::Relayed {
        primaries,
        failed_destinations,
        ..
    } = h.engine.relay_message(message).await
    else {
        panic!("message should be relayed");
    };

    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].destination_channel_id, ch(2));
    assert_eq!(failed_destinations, vec![ch(3), ch(4)]);
}

#[tokio::test]
async fn functional_attachments_are_downloaded_once_for_all_destinations() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    h.platform.set_attachment_bytes(1, vec![1, 2, 3]);
    let mut message = source_message(100, 1, "");
    message.attachments = vec![
        AttachmentRef {
            id: 1,
            filename: "cat.png".to_string(),
            url: "https://cdn.example/cat.png".to_string(),
            size: 3,
        },
        AttachmentRef {
            id: 2,
            filename: "notes.txt".to_string(),
            url: "https://cdn.example/notes.txt".to_string(),
            size: 9,
        },
    ];

    h.relay(message).await;

    assert_eq!(h.platform.download_count(), 2);
    let to_two = h.outbound.sends_to(ch(2));
    let to_three = h.outbound.sends_to(ch(3));
    assert_eq!(to_two[0].attachments.len(), 2);
    assert_eq!(to_two[0].attachments[0].bytes.as_slice(), &[1, 2, 3]);
    assert!(Arc::ptr_eq(
        &to_two[0].attachments[0].bytes,
        &to_three[0].attachments[0].bytes
    ));
}

#[tokio::test]
async fn functional_relay_appends_audit_line() {
    let h = Setup::new(routes(&[(1, &[2])])).audit_log().build();

    h.relay(source_message(100, 1, "hello")).await;

    let contents = std::fs::read_to_string(&h.audit_path).expect("audit log");
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with('['));
    assert!(lines[0].ends_with("] [Test Guild] [channel-1] [user1] hello"));
}

#[tokio::test]
async fn functional_edit_round_trip_updates_every_plain_mirror() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    let message = source_message(100, 1, "hello");
    let (primaries, _) = h.relay(message.clone()).await;

    let outcome = h
        .engine
        .handle_edit(ch(1), mid(100), Some(edited(&message, "x")))
        .await;

    assert_eq!(
        outcome,
        EditOutcome::Propagated {
            edited: 2,
            skipped: 0,
            failed: 0
        }
    );
    for mirror in &primaries {
        assert_eq!(
            h.outbound
                .mirror_content(mirror.destination_channel_id, mirror.mirror_id)
                .as_deref(),
            Some("x")
        );
    }

    let before = h.links();
    let direct = h
        .engine
        .handle_edit(ch(2), primaries[0].mirror_id, None)
        .await;
    assert_eq!(direct, EditOutcome::MirrorEdited);
    assert_eq!(h.links(), before);
}

#[tokio::test]
async fn functional_uncached_edit_refetches_the_original() {
    let h = Setup::new(routes(&[(1, &[2])])).build();
    let message = source_message(100, 1, "hello");
    let (primaries, _) = h.relay(message.clone()).await;
    h.platform.post(edited(&message, "refetched"));

    let outcome = h.engine.handle_edit(ch(1), mid(100), None).await;

    assert!(matches!(outcome, EditOutcome::Propagated { edited: 1, .. }));
    assert_eq!(
        h.outbound.mirror_content(ch(2), primaries[0].mirror_id).as_deref(),
        Some("refetched")
    );

    h.platform.remove(ch(1), mid(100));
    assert_eq!(
        h.engine.handle_edit(ch(1), mid(100), None).await,
        EditOutcome::SourceGone
    );
}

#[tokio::test]
async fn regression_edit_leaves_previews_of_other_anchors_untouched() {
    let h = Setup::new(routes(&[(1, &[2])])).build();
    let message = source_message(100, 1, "hello");
    h.relay(message.clone()).await;
    h.outbound.seed_mirror(ch(2), mid(20_000), "> **user5**: elsewhere");
    h.engine.with_state(|state| {
        state
            .registry
            .track(mid(100), [MirrorEntry::reply_preview(mid(20_000), ch(2), mid(555))])
    });

    let outcome = h
        .engine
        .handle_edit(ch(1), mid(100), Some(edited(&message, "x")))
        .await;

    assert_eq!(
        outcome,
        EditOutcome::Propagated {
            edited: 1,
            skipped: 1,
            failed: 0
        }
    );
    assert_eq!(
        h.outbound.mirror_content(ch(2), mid(20_000)).as_deref(),
        Some("> **user5**: elsewhere")
    );
}

#[tokio::test]
async fn functional_delete_cascade_removes_original_and_all_links() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    let (primaries, _) = h.relay(source_message(100, 1, "hello")).await;

    let outcome = h.engine.handle_delete(ch(1), mid(100)).await;

    assert_eq!(
        outcome,
        DeleteOutcome::CascadeDeleted {
            deleted: 2,
            already_gone: 0,
            failed: 0
        }
    );
    for mirror in &primaries {
        assert_eq!(h.owner_of(mirror.mirror_id), None);
    }
    assert_eq!(h.owner_of(mid(100)), None);
    assert!(!h.engine.retention().is_scheduled(mid(100)));
    assert_eq!(h.outbound.deleted().len(), 2);
}

#[tokio::test]
async fn functional_delete_counts_vanished_mirrors_as_already_gone() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    let (primaries, _) = h.relay(source_message(100, 1, "hello")).await;
    h.platform.remove(ch(2), primaries[0].mirror_id);

    let outcome = h.engine.handle_delete(ch(1), mid(100)).await;

    assert_eq!(
        outcome,
        DeleteOutcome::CascadeDeleted {
            deleted: 1,
            already_gone: 1,
            failed: 0
        }
    );
    assert!(h.links().is_empty());
}

#[tokio::test]
async fn functional_deleting_a_mirror_detaches_only_that_mirror() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    let (primaries, _) = h.relay(source_message(100, 1, "hello")).await;

    let outcome = h
        .engine
        .handle_delete(ch(2), primaries[0].mirror_id)
        .await;

    assert_eq!(outcome, DeleteOutcome::MirrorDetached { owner: mid(100) });
    assert_eq!(h.links(), vec![(mid(100), vec![primaries[1]])]);
    assert!(h.outbound.deleted().is_empty());
    assert_eq!(
        h.engine.handle_delete(ch(1), mid(999)).await,
        DeleteOutcome::Untracked
    );
}

#[tokio::test]
async fn functional_reply_to_mirror_links_preview_under_resolved_owner() {
    let h = Setup::new(routes(&[(1, &[2]), (2, &[1])])).build();
    let (original_mirrors, _) = h.relay(source_message(100, 1, "hello")).await;
    let relayed = original_mirrors[0].mirror_id;

    let mut reply = reply_to(source_message(200, 2, "agreed"), 2, relayed.get());
    reply.author = author(2, "user2");
    let (primaries, previews) = h.relay(reply).await;

    assert_eq!(previews.len(), 1);
    let stub = previews[0];
    assert_eq!(stub.destination_channel_id, ch(1));
    assert_eq!(stub.reply_anchor, Some(mid(100)));
    assert_eq!(h.owner_of(relayed), Some(mid(100)));
    assert_eq!(h.owner_of(stub.mirror_id), Some(mid(100)));
    assert_eq!(h.owner_of(primaries[0].mirror_id), Some(mid(200)));
    assert!(h.engine.inspect_registry(|registry| registry.is_symmetric()));

    let sent = h.outbound.sends_to(ch(1));
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].content, "> **user1**: hello");
    assert_eq!(sent[0].display_name, "user2");
    assert!(sent[0].suppress_mentions);
    assert_eq!(sent[1].content, "agreed");
}

#[tokio::test]
async fn functional_reply_to_preview_stub_quotes_the_stub_anchor() {
    let h = Setup::new(routes(&[(1, &[2]), (2, &[1])])).build();
    let (original_mirrors, _) = h.relay(source_message(100, 1, "hello")).await;
    let reply = reply_to(source_message(200, 2, "agreed"), 2, original_mirrors[0].mirror_id.get());
    let (_, previews) = h.relay(reply).await;
    let stub = previews[0];

    let mut nested = reply_to(source_message(300, 1, "me too"), 1, stub.mirror_id.get());
    nested.author = author(3, "user3");
    let (_, nested_previews) = h.relay(nested).await;

    assert_eq!(nested_previews.len(), 1);
    assert_eq!(nested_previews[0].reply_anchor, Some(mid(100)));
    assert_eq!(h.owner_of(nested_previews[0].mirror_id), Some(mid(100)));
    let sent = h.outbound.sends_to(ch(2));
    let preview = &sent[sent.len() - 2];
    assert_eq!(preview.content, "> **user1**: hello");
    assert_eq!(sent[sent.len() - 1].content, "me too");
}

#[tokio::test]
async fn functional_edit_rerenders_preview_stubs_anchored_on_the_original() {
    let h = Setup::new(routes(&[(1, &[2]), (2, &[1])])).build();
    let original = source_message(100, 1, "hello");
    let (original_mirrors, _) = h.relay(original.clone()).await;
    let reply = reply_to(source_message(200, 2, "agreed"), 2, original_mirrors[0].mirror_id.get());
    let (_, previews) = h.relay(reply).await;
    let stub = previews[0];

    let outcome = h
        .engine
        .handle_edit(ch(1), mid(100), Some(edited(&original, "hello there")))
        .await;

    assert_eq!(
        outcome,
        EditOutcome::Propagated {
            edited: 2,
            skipped: 0,
            failed: 0
        }
    );
    assert_eq!(
        h.outbound.mirror_content(ch(1), stub.mirror_id).as_deref(),
        Some("> **user1**: hello there")
    );
    assert_eq!(
        h.engine.handle_edit(ch(1), stub.mirror_id, None).await,
        EditOutcome::ChainedReplyStub
    );
}

#[tokio::test]
async fn functional_unresolvable_reply_target_relays_without_preview() {
    let h = Setup::new(routes(&[(1, &[2])])).build();

    let (primaries, previews) = h
        .relay(reply_to(source_message(101, 1, "what?"), 1, 999))
        .await;

    assert!(previews.is_empty());
    assert_eq!(primaries.len(), 1);
    assert_eq!(h.outbound.sends_to(ch(2)).len(), 1);
}

#[tokio::test]
async fn functional_inline_referenced_message_is_quoted_without_fetch() {
    let h = Setup::new(routes(&[(1, &[2])])).build();
    let mut reply = reply_to(source_message(101, 1, "yes"), 1, 50);
    let mut quoted = source_message(50, 1, "is this cached?");
    quoted.author = author(4, "user4");
    reply.referenced = Some(Box::new(quoted));

    let (_, previews) = h.relay(reply).await;

    assert_eq!(previews.len(), 1);
    assert_eq!(previews[0].reply_anchor, Some(mid(50)));
    assert_eq!(
        h.outbound.sends_to(ch(2))[0].content,
        "> **user4**: is this cached?"
    );
}

#[tokio::test]
async fn functional_pending_edit_is_deferred_and_applied_once() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    let original = source_message(500, 1, "before");
    h.platform.post(original.clone());
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");
    assert!(h.engine.is_reconciling());
    assert_eq!(h.engine.stats().pending_ids, 2);

    let outcome = h
        .engine
        .handle_edit(ch(1), mid(500), Some(edited(&original, "after")))
        .await;
    assert_eq!(outcome, EditOutcome::Deferred);
    assert_eq!(h.engine.stats().deferred_events, 1);
    assert!(h.outbound.edits().is_empty());

    let report = h.engine.reconcile().await.expect("first reconciliation");

    assert_eq!(report.pending_ids, 2);
    assert_eq!(report.found_alive, 2);
    assert_eq!(report.restored_originals, 1);
    assert_eq!(report.replayed_events, 1);
    assert_eq!(
        h.outbound.edits(),
        vec![(ch(2), mid(10_500), "after".to_string())]
    );
    assert!(!h.engine.is_reconciling());
    assert!(h.engine.retention().is_scheduled(mid(500)));
    assert!(h.outbound.deleted().is_empty());
    assert!(h.engine.reconcile().await.is_none());
}

#[tokio::test]
async fn functional_delete_during_reconciliation_removes_mirror_exactly_once() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");

    assert_eq!(
        h.engine.handle_delete(ch(1), mid(500)).await,
        DeleteOutcome::Deferred
    );
    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.dropped_originals, 1);
    assert_eq!(report.replayed_events, 1);
    assert_eq!(report.orphans_deleted, 1);
    assert_eq!(h.outbound.deleted(), vec![(ch(2), mid(10_500))]);
    assert!(h.links().is_empty());
}

#[tokio::test]
async fn regression_edit_of_pending_original_with_reply_stub_reaches_restored_mirrors() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    let original = source_message(500, 1, "before");
    h.platform.post(original.clone());
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");

    let mut reply = reply_to(source_message(600, 1, "agreed"), 1, 500);
    reply.author = author(2, "user2");
    let (_, previews) = h.relay(reply).await;
    assert_eq!(previews.len(), 1);
    let stub = previews[0];
    assert_eq!(stub.reply_anchor, Some(mid(500)));
    assert_eq!(h.owner_of(stub.mirror_id), Some(mid(500)));

    let outcome = h
        .engine
        .handle_edit(ch(1), mid(500), Some(edited(&original, "after")))
        .await;
    assert_eq!(outcome, EditOutcome::Deferred);
    assert!(h.outbound.edits().is_empty());

    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.restored_originals, 1);
    assert_eq!(report.replayed_events, 1);
    assert_eq!(report.orphans_deleted, 0);
    assert_eq!(
        h.links(),
        vec![
            (mid(500), vec![stub, MirrorEntry::primary(mid(10_500), ch(2))]),
            (mid(600), vec![MirrorEntry::primary(mid(stub.mirror_id.get() + 1), ch(2))]),
        ]
    );
    assert_eq!(
        h.outbound.mirror_content(ch(2), mid(10_500)).as_deref(),
        Some("after")
    );
    assert_eq!(
        h.outbound.mirror_content(ch(2), stub.mirror_id).as_deref(),
        Some("> **user1**: after")
    );
}

#[tokio::test]
async fn regression_delete_of_pending_original_with_reply_stub_cascades_after_rebuild() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.platform.post(source_message(500, 1, "before"));
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");
    let (_, previews) = h
        .relay(reply_to(source_message(600, 1, "agreed"), 1, 500))
        .await;
    let stub = previews[0];

    h.platform.remove(ch(1), mid(500));
    assert_eq!(
        h.engine.handle_delete(ch(1), mid(500)).await,
        DeleteOutcome::Deferred
    );
    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.replayed_events, 1);
    assert_eq!(h.owner_of(stub.mirror_id), None);
    assert_eq!(h.owner_of(mid(10_500)), None);
    assert!(h.outbound.deleted().contains(&(ch(2), stub.mirror_id)));
    assert!(h.outbound.deleted().contains(&(ch(2), mid(10_500))));
    assert!(h.engine.inspect_registry(|registry| registry.is_symmetric()));
}

#[tokio::test]
async fn regression_reply_to_pending_mirror_links_under_snapshot_original() {
    let h = Setup::new(routes(&[(1, &[2]), (2, &[1])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.platform.post(source_message(500, 1, "before"));
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");

    let mut reply = reply_to(source_message(700, 2, "agreed"), 2, 10_500);
    reply.author = author(2, "user2");
    let (_, previews) = h.relay(reply).await;
    assert_eq!(previews.len(), 1);
    let stub = previews[0];
    assert_eq!(stub.destination_channel_id, ch(1));
    assert_eq!(stub.reply_anchor, Some(mid(500)));
    assert_eq!(h.owner_of(mid(10_500)), None);

    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.restored_originals, 1);
    assert_eq!(report.dropped_originals, 0);
    assert_eq!(report.orphans_deleted, 0);
    assert_eq!(h.owner_of(mid(10_500)), Some(mid(500)));
    assert_eq!(h.owner_of(stub.mirror_id), Some(mid(500)));
    assert!(h.outbound.deleted().is_empty());
    assert!(h.engine.inspect_registry(|registry| registry.is_symmetric()));
}

#[tokio::test]
async fn regression_rebuild_folds_links_made_under_a_pending_mirror_into_its_original() {
    let h = Setup::new(routes(&[(1, &[2]), (2, &[1])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.platform.post(source_message(500, 1, "before"));
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");
    h.outbound.seed_mirror(ch(1), mid(10_700), "> **Relay**: before");
    h.engine.inspect_registry(|registry| assert!(registry.is_empty()));
    h.engine.with_state(|state| {
        state
            .registry
            .link_reply_into(mid(10_500), MirrorEntry::primary(mid(10_700), ch(1)))
    });
    assert_eq!(h.owner_of(mid(10_500)), Some(mid(10_500)));

    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.restored_originals, 1);
    assert_eq!(report.orphans_deleted, 0);
    assert_eq!(
        h.links(),
        vec![(
            mid(500),
            vec![
                MirrorEntry::reply_preview(mid(10_700), ch(1), mid(500)),
                MirrorEntry::primary(mid(10_500), ch(2)),
            ]
        )]
    );
    assert!(h.outbound.deleted().is_empty());
}

#[tokio::test]
async fn regression_live_delete_during_replay_waits_behind_deferred_edit() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    let original = source_message(500, 1, "before");
    h.platform.post(original.clone());
    h.outbound.seed_mirror(ch(2), mid(10_500), "before");
    h.engine
        .handle_edit(ch(1), mid(500), Some(edited(&original, "after")))
        .await;

    let snapshot = h.engine.with_state(|state| state.gate.snapshot().cloned());
    let alive: HashMap<_, _> = [(mid(500), ch(1)), (mid(10_500), ch(2))].into_iter().collect();
    let mut report = ReconciliationReport::default();
    h.engine.with_state(|state| {
        rebuild_registry(
            snapshot.as_ref().expect("loaded snapshot"),
            &alive,
            &mut state.registry,
            &mut report,
        );
        state.gate.finish_rebuild();
    });
    assert!(h.engine.is_reconciling());

    assert_eq!(
        h.engine.handle_delete(ch(1), mid(500)).await,
        DeleteOutcome::Deferred
    );
    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.replayed_events, 2);
    assert_eq!(
        h.outbound.edits(),
        vec![(ch(2), mid(10_500), "after".to_string())]
    );
    assert_eq!(h.outbound.deleted(), vec![(ch(2), mid(10_500))]);
    assert!(h.links().is_empty());
}

#[tokio::test]
async fn functional_reconcile_restores_surviving_links_and_sweeps_orphans() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0], [10502, 500], [10600, 0]], "501": [[10501, 0]]}"#)
        .build();
    h.platform.post(source_message(500, 1, "alive"));
    h.outbound.seed_mirror(ch(2), mid(10_500), "alive");
    h.outbound.seed_mirror(ch(2), mid(10_501), "orphaned");
    h.outbound.seed_mirror(ch(2), mid(10_502), "> **user1**: alive");

    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.restored_originals, 1);
    assert_eq!(report.restored_links, 2);
    assert_eq!(report.dropped_originals, 1);
    assert_eq!(report.orphans_deleted, 1);
    assert_eq!(
        h.links(),
        vec![(
            mid(500),
            vec![
                MirrorEntry::primary(mid(10_500), ch(2)),
                MirrorEntry::reply_preview(mid(10_502), ch(2), mid(500)),
            ]
        )]
    );
    assert_eq!(h.outbound.deleted(), vec![(ch(2), mid(10_501))]);
    assert_eq!(h.owner_of(mid(10_501)), None);
}

#[tokio::test]
async fn functional_reconcile_skips_unreachable_channels() {
    let h = Setup::new(routes(&[(1, &[2, 3])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.platform.set_unreachable(ch(3));
    h.platform.post(source_message(500, 1, "alive"));
    h.outbound.seed_mirror(ch(2), mid(10_500), "alive");

    let report = h.engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.unreachable_channels, vec![ch(3)]);
    assert_eq!(report.restored_originals, 1);
}

#[tokio::test]
async fn functional_connection_established_starts_reconciliation_once() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.platform.post(source_message(500, 1, "alive"));
    h.outbound.seed_mirror(ch(2), mid(10_500), "alive");

    h.engine.handle_event(EngineEvent::ConnectionEstablished).await;
    for _ in 0..100 {
        if !h.engine.is_reconciling() {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert!(!h.engine.is_reconciling());
    assert_eq!(h.owner_of(mid(10_500)), Some(mid(500)));
    assert!(h.engine.reconcile().await.is_none());
}

#[test]
fn functional_corrupt_snapshot_aborts_startup() {
    let Err(error) = Setup::new(routes(&[(1, &[2])]))
        .snapshot("{not json")
        .try_build()
    else {
        panic!("corrupt snapshot must abort startup");
    };
    assert!(matches!(error, RiftError::CorruptPersistentState { .. }));
}

#[tokio::test]
async fn functional_shutdown_with_empty_registry_removes_snapshot_file() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    h.engine.reconcile().await.expect("reconciliation");
    assert!(h.links().is_empty());

    let written = h.engine.shutdown().expect("shutdown");

    assert_eq!(written, SnapshotWrite::Removed);
    assert!(!h.snapshot_path.exists());
}

#[tokio::test]
async fn functional_shutdown_before_reconciliation_keeps_loaded_links() {
    let h = Setup::new(routes(&[(1, &[2])]))
        .snapshot(r#"{"500": [[10500, 0]]}"#)
        .build();
    let (primaries, _) = h.relay(source_message(600, 1, "new")).await;

    let written = h.engine.shutdown().expect("shutdown");

    assert_eq!(
        written,
        SnapshotWrite::Written {
            originals: 2,
            mirrors: 2
        }
    );
    let reloaded = SnapshotStore::new(&h.snapshot_path)
        .load()
        .expect("load")
        .expect("snapshot present");
    assert_eq!(reloaded.originals[&mid(500)][0].mirror_id, mid(10_500));
    assert_eq!(reloaded.originals[&mid(600)][0].mirror_id, primaries[0].mirror_id);
    assert!(h.engine.retention().is_empty());
}

#[tokio::test]
async fn integration_run_loop_relays_until_shutdown_and_persists() {
    let h = Setup::new(routes(&[(1, &[2, 3])])).build();
    let sender = h.engine.event_sender();
    let engine = h.engine.clone();
    let events = h.events;
    let running = tokio::spawn(async move { engine.run(events).await });

    let message = source_message(100, 1, "hello");
    h.platform.post(message.clone());
    sender
        .send(EngineEvent::MessageCreated(message))
        .await
        .expect("queue message");
    sender.send(EngineEvent::Shutdown).await.expect("queue shutdown");

    let written = running.await.expect("join").expect("run");
    assert_eq!(
        written,
        SnapshotWrite::Written {
            originals: 1,
            mirrors: 2
        }
    );
    assert!(h.snapshot_path.exists());
}

#[tokio::test(start_paused = true)]
async fn functional_retention_expiry_deletes_original_and_cascades() {
    let mut h = Setup::new(routes(&[(1, &[2, 3])])).retention_secs(60).build();
    h.relay(source_message(100, 1, "short lived")).await;

    let event = h.events.recv().await.expect("retention expiry");
    assert!(matches!(
        event,
        EngineEvent::RetentionExpired { message_id, .. } if message_id == mid(100)
    ));
    h.engine.handle_event(event).await;

    assert_eq!(h.platform.deleted(), vec![(ch(1), mid(100))]);
    assert_eq!(h.outbound.deleted().len(), 2);
    assert!(h.links().is_empty());
    assert!(h.engine.retention().is_empty());
}

#[tokio::test]
async fn regression_stale_retention_expiry_is_ignored() {
    let h = Setup::new(routes(&[(1, &[2])])).build();
    h.relay(source_message(100, 1, "hello")).await;

    h.engine
        .handle_event(EngineEvent::RetentionExpired {
            channel_id: ch(1),
            message_id: mid(100),
            generation: 0,
        })
        .await;

    assert!(h.platform.deleted().is_empty());
    assert_eq!(h.owner_of(mid(100)), Some(mid(100)));
    assert!(h.engine.retention().is_scheduled(mid(100)));
}
