use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rift_core::{AuditLog, AuditRotationPolicy};
use rift_mirror::testing::{reply_to, source_message, FakeOutbound, FakePlatform};
use rift_mirror::{
    ChannelId, ChannelRoutes, DeleteOutcome, EditOutcome, EngineEvent, EngineEventLoop,
    MessageId, MirrorEngine, MirrorEngineConfig, MirrorEntry, RelayOutcome, RelaySkip,
    SnapshotWrite, SourceMessage, UserId,
};
use tempfile::TempDir;

const RELAY_USER: u64 = 9_999;

fn ch(raw: u64) -> ChannelId {
    ChannelId::new(raw)
}

fn mid(raw: u64) -> MessageId {
    MessageId::new(raw)
}

/// Platform and webhook state that outlives a single relay process.
struct World {
    platform: Arc<FakePlatform>,
    outbound: Arc<FakeOutbound>,
    dir: TempDir,
}

impl World {
    fn new() -> Self {
        let platform = Arc::new(FakePlatform::new());
        platform.set_relay_user(UserId::new(RELAY_USER));
        let outbound = Arc::new(FakeOutbound::new(platform.clone()));
        Self {
            platform,
            outbound,
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.path().join("rift-snapshot.json")
    }

    fn audit_path(&self) -> PathBuf {
        self.dir.path().join("backup.txt")
    }

    /// Starts a fresh engine process against the shared world.
    fn start(&self, routes: &[(u64, &[u64])], retention: Duration) -> (MirrorEngine, EngineEventLoop) {
        let routes = ChannelRoutes::new(routes.iter().map(|(source, destinations)| {
            (ch(*source), destinations.iter().map(|d| ch(*d)).collect())
        }));
        let config = MirrorEngineConfig::new(routes, retention, self.snapshot_path())
            .with_audit_log(AuditLog::new(self.audit_path(), AuditRotationPolicy::default()));
        MirrorEngine::new(config, self.platform.clone(), self.outbound.clone())
            .unwrap_or_else(|error| panic!("engine should start: {error}"))
    }

    fn post(&self, message: &SourceMessage) -> EngineEvent {
        self.platform.post(message.clone());
        EngineEvent::MessageCreated(message.clone())
    }
}

fn links_of(engine: &MirrorEngine, original: MessageId) -> Vec<MirrorEntry> {
    engine.inspect_registry(|registry| registry.mirrors_of(original).to_vec())
}

fn audit_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("audit log")
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn integration_links_survive_restart_and_follow_edits_and_deletes() {
    let world = World::new();
    let retention = Duration::from_secs(3_600);

    let (engine, events) = world.start(&[(1, &[2, 3])], retention);
    let sender = engine.event_sender();
    let running = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(events).await }
    });
    let original = source_message(100, 1, "hello");
    let reply = reply_to(source_message(101, 1, "agreed"), 1, 100);
    sender.send(world.post(&original)).await.expect("queue original");
    sender.send(world.post(&reply)).await.expect("queue reply");
    sender.send(EngineEvent::Shutdown).await.expect("queue shutdown");

    let written = running.await.expect("join").expect("first process stops");
    assert_eq!(
        written,
        SnapshotWrite::Written {
            originals: 2,
            mirrors: 6
        }
    );
    assert_eq!(world.outbound.sends().len(), 6);
    assert_eq!(audit_lines(&world.audit_path()).len(), 2);

    world.outbound.seed_mirror(ch(2), mid(90_000), "left behind by a crash");
    let (engine, _events) = world.start(&[(1, &[2, 3])], retention);
    assert!(engine.is_reconciling());

    let report = engine.reconcile().await.expect("reconciliation runs once");
    assert_eq!(report.restored_originals, 2);
    assert_eq!(report.restored_links, 6);
    assert_eq!(report.dropped_originals, 0);
    assert_eq!(report.orphans_deleted, 1);
    assert!(report.unreachable_channels.is_empty());
    assert_eq!(world.outbound.deleted(), vec![(ch(2), mid(90_000))]);
    assert!(engine.retention().is_scheduled(mid(100)));
    assert!(engine.retention().is_scheduled(mid(101)));

    let restored = links_of(&engine, mid(100));
    assert_eq!(restored.len(), 4);
    assert_eq!(
        restored.iter().filter(|entry| entry.is_reply_preview()).count(),
        2
    );

    let mut updated = original.clone();
    updated.content = "hello again".to_string();
    world.platform.post(updated.clone());
    let edit = engine.handle_edit(ch(1), mid(100), Some(updated)).await;
    assert_eq!(
        edit,
        EditOutcome::Propagated {
            edited: 4,
            skipped: 0,
            failed: 0
        }
    );
    for entry in restored.iter().filter(|entry| !entry.is_reply_preview()) {
        assert_eq!(
            world
                .outbound
                .mirror_content(entry.destination_channel_id, entry.mirror_id)
                .as_deref(),
            Some("hello again")
        );
    }
    for stub in restored.iter().filter(|entry| entry.is_reply_preview()) {
        let content = world
            .outbound
            .mirror_content(stub.destination_channel_id, stub.mirror_id)
            .expect("stub still posted");
        assert!(content.contains("hello again"), "stub was {content:?}");
    }

    world.platform.remove(ch(1), mid(100));
    let delete = engine.handle_delete(ch(1), mid(100)).await;
    assert_eq!(
        delete,
        DeleteOutcome::CascadeDeleted {
            deleted: 4,
            already_gone: 0,
            failed: 0
        }
    );
    for entry in &restored {
        assert_eq!(
            world
                .outbound
                .mirror_content(entry.destination_channel_id, entry.mirror_id),
            None
        );
    }
    assert!(!engine.retention().is_scheduled(mid(100)));
    assert_eq!(links_of(&engine, mid(101)).len(), 2);
    assert!(engine.inspect_registry(|registry| registry.is_symmetric()));

    let written = engine.shutdown().expect("second process stops");
    assert_eq!(
        written,
        SnapshotWrite::Written {
            originals: 1,
            mirrors: 2
        }
    );
}

#[tokio::test]
async fn integration_bidirectional_routes_never_echo_mirrors() {
    let world = World::new();
    let (engine, _events) = world.start(&[(1, &[2]), (2, &[1])], Duration::from_secs(600));
    engine.reconcile().await.expect("empty reconciliation");

    world.platform.post(source_message(100, 1, "ping"));
    let RelayOutcome::Relayed { primaries, .. } =
        engine.relay_message(source_message(100, 1, "ping")).await
    else {
        panic!("original should be relayed");
    };
    let mirror = primaries[0];
    let echoed = world
        .platform
        .message(mirror.destination_channel_id, mirror.mirror_id)
        .expect("mirror visible in destination history");

    assert_eq!(
        engine.relay_message(echoed).await,
        RelayOutcome::Skipped(RelaySkip::WebhookMessage)
    );

    let answer = source_message(200, 2, "pong");
    world.platform.post(answer.clone());
    let RelayOutcome::Relayed { primaries, .. } = engine.relay_message(answer).await else {
        panic!("answer should be relayed back");
    };
    assert_eq!(primaries[0].destination_channel_id, ch(1));
    assert_eq!(world.outbound.sends().len(), 2);
}

#[tokio::test]
async fn integration_missing_originals_are_dropped_and_their_mirrors_swept() {
    let world = World::new();
    std::fs::write(
        world.snapshot_path(),
        r#"{"500": [[10500, 0]], "501": [[10501, 0]]}"#,
    )
    .expect("seed snapshot");
    world.platform.post(source_message(500, 1, "still here"));
    world.outbound.seed_mirror(ch(2), mid(10_500), "still here");
    world.outbound.seed_mirror(ch(2), mid(10_501), "original was deleted offline");

    let (engine, _events) = world.start(&[(1, &[2])], Duration::from_secs(600));
    let report = engine.reconcile().await.expect("reconciliation");

    assert_eq!(report.pending_ids, 4);
    assert_eq!(report.found_alive, 3);
    assert_eq!(report.restored_originals, 1);
    assert_eq!(report.dropped_originals, 1);
    assert_eq!(report.orphans_deleted, 1);
    assert_eq!(
        links_of(&engine, mid(500)),
        vec![MirrorEntry::primary(mid(10_500), ch(2))]
    );
    assert_eq!(world.outbound.mirror_content(ch(2), mid(10_501)), None);
}

#[tokio::test(start_paused = true)]
async fn integration_retention_expiry_after_restart_purges_both_sides() {
    let world = World::new();
    let retention = Duration::from_secs(60);

    let (engine, _events) = world.start(&[(1, &[2])], retention);
    engine.reconcile().await.expect("empty reconciliation");
    world.platform.post(source_message(100, 1, "short lived"));
    engine
        .relay_message(source_message(100, 1, "short lived"))
        .await;
    let mirror = links_of(&engine, mid(100))[0];
    engine.shutdown().expect("first process stops");
    assert!(engine.retention().is_empty());

    let (engine, mut events) = world.start(&[(1, &[2])], retention);
    let report = engine.reconcile().await.expect("reconciliation");
    assert_eq!(report.restored_originals, 1);
    assert!(engine.retention().is_scheduled(mid(100)));

    let expiry = events.recv().await.expect("retention expiry");
    assert!(matches!(
        expiry,
        EngineEvent::RetentionExpired { message_id, .. } if message_id == mid(100)
    ));
    engine.handle_event(expiry).await;

    assert_eq!(world.platform.message(ch(1), mid(100)), None);
    assert_eq!(
        world
            .outbound
            .mirror_content(mirror.destination_channel_id, mirror.mirror_id),
        None
    );
    assert!(engine.inspect_registry(|registry| registry.is_empty()));
}
