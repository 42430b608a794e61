//! Integration tests for recording lifecycle operations
//!
//! A RecordingManager over a loopback target, an in-memory archive store
//! and a broadcast sink for observing notifications.

use control_plane::config::ConnectionConfig;
use control_plane::connection::ConnectionManager;
use control_plane::loopback::{LoopbackFactory, LoopbackTarget, SnapshotBehavior};
use control_plane::notifications::{BroadcastNotificationSink, Notification, NotificationCategory};
use control_plane::recordings::{
    ArchiveStore, MemoryArchiveStore, RecordingManager, ReplacementPolicy, StartRequest,
};
use control_plane::target_control::{EventSettings, RecordingOptions, RecordingState};
use control_plane::RecordingError;
use rule_engine::{ConnectionDescriptor, TargetId};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;

const URL: &str = "loop://app";

struct Fixture {
    target: Arc<LoopbackTarget>,
    archives: Arc<MemoryArchiveStore>,
    recordings: RecordingManager,
    notifications: broadcast::Receiver<Notification>,
}

fn fixture() -> Fixture {
    let factory = Arc::new(LoopbackFactory::new());
    let target = factory.register(URL);
    let connections = ConnectionManager::new(factory, ConnectionConfig::default());
    let archives = Arc::new(MemoryArchiveStore::new());
    let sink = BroadcastNotificationSink::new(64);
    let notifications = sink.subscribe();
    let recordings = RecordingManager::new(
        connections,
        archives.clone() as Arc<dyn ArchiveStore>,
        Arc::new(sink),
    );
    Fixture {
        target,
        archives,
        recordings,
        notifications,
    }
}

fn desc() -> ConnectionDescriptor {
    ConnectionDescriptor::new(URL)
}

fn categories(rx: &mut broadcast::Receiver<Notification>) -> Vec<NotificationCategory> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification.category);
    }
    seen
}

fn request(name: &str, template: &str) -> StartRequest {
    StartRequest::new(RecordingOptions::builder(name).to_disk(true).build(), template)
}

#[tokio::test]
async fn test_start_and_stop_recording() {
    let mut fx = fixture();

    let started = fx
        .recordings
        .start_recording(&desc(), request("r1", "Continuous"))
        .await
        .unwrap();
    assert_eq!(started.state, RecordingState::Running);
    assert_eq!(fx.recordings.list_recordings(&desc()).await.unwrap().len(), 1);

    let stopped = fx.recordings.stop_recording(&desc(), "r1").await.unwrap();
    assert_eq!(stopped.state, RecordingState::Stopped);
    assert_eq!(fx.target.recording("r1").unwrap().state, RecordingState::Stopped);

    let err = fx.recordings.stop_recording(&desc(), "missing").await.unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(
        categories(&mut fx.notifications),
        vec![
            NotificationCategory::RecordingCreated,
            NotificationCategory::RecordingStopped
        ]
    );
}

#[tokio::test]
async fn test_replacement_policy() {
    let fx = fixture();
    let first = fx
        .recordings
        .start_recording(&desc(), request("r1", "Continuous"))
        .await
        .unwrap();

    let err = fx
        .recordings
        .start_recording(&desc(), request("r1", "Continuous"))
        .await
        .unwrap_err();
    assert!(matches!(err, RecordingError::AlreadyExists { .. }));

    let second = fx
        .recordings
        .start_recording(
            &desc(),
            request("r1", "Profiling").replace(ReplacementPolicy::Always),
        )
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(fx.target.closed_ids(), vec![first.id]);
    assert_eq!(fx.target.recordings().len(), 1);
}

#[tokio::test]
async fn test_templates() {
    let fx = fixture();

    let templates = fx.recordings.list_templates(&desc()).await.unwrap();
    let names: Vec<&str> = templates.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Continuous", "Profiling", "ALL"]);

    let err = fx
        .recordings
        .start_recording(&desc(), request("r1", "Nonexistent"))
        .await
        .unwrap_err();
    assert!(matches!(err, RecordingError::UnknownTemplate { .. }));

    fx.recordings
        .start_recording(&desc(), request("everything", "ALL"))
        .await
        .unwrap();
    match fx.target.events_of("everything") {
        Some(EventSettings::Events(events)) => {
            assert_eq!(events.len(), 3);
            assert!(events.contains(&"jdk.CPULoad".to_string()));
        }
        other => panic!("unexpected event settings: {:?}", other),
    }
}

#[tokio::test]
async fn test_snapshot_takes_next_free_name() {
    let mut fx = fixture();
    // Occupies id 1, so the snapshot gets id 2.
    fx.target.insert_recording("snapshot-2", RecordingState::Running);

    let snapshot = fx.recordings.create_snapshot(&desc()).await.unwrap();
    assert_eq!(snapshot.name, "snapshot-3");
    assert!(snapshot.is_snapshot);
    assert!(fx.target.recording("snapshot-3").is_some());
    assert_eq!(
        categories(&mut fx.notifications),
        vec![NotificationCategory::SnapshotCreated]
    );
}

#[tokio::test]
async fn test_unregistered_snapshot_is_cleaned_up() {
    let mut fx = fixture();
    fx.target.set_snapshot_behavior(SnapshotBehavior::Unregistered);

    let err = fx.recordings.create_snapshot(&desc()).await.unwrap_err();
    assert!(matches!(err, RecordingError::SnapshotCreation { .. }));
    assert!(fx.target.recordings().is_empty());
    assert_eq!(fx.target.closed_ids().len(), 1);
    assert!(categories(&mut fx.notifications).is_empty());
}

#[tokio::test]
async fn test_verified_snapshot() {
    let fx = fixture();
    let snapshot = fx
        .recordings
        .create_verified_snapshot(&desc())
        .await
        .unwrap()
        .unwrap();
    assert!(fx.target.recording(&snapshot.name).is_some());
}

#[tokio::test]
async fn test_empty_snapshot_fails_verification() {
    let mut fx = fixture();
    fx.target.set_snapshot_behavior(SnapshotBehavior::Empty);

    let verified = fx.recordings.create_verified_snapshot(&desc()).await.unwrap();
    assert!(verified.is_none());
    assert!(fx.target.recordings().is_empty());
    assert_eq!(
        categories(&mut fx.notifications),
        vec![
            NotificationCategory::SnapshotCreated,
            NotificationCategory::SnapshotDeleted
        ]
    );
}

#[tokio::test]
async fn test_unreadable_snapshot_fails_verification() {
    let mut fx = fixture();
    fx.target.set_snapshot_behavior(SnapshotBehavior::Unreadable);

    let snapshot = fx.recordings.create_snapshot(&desc()).await.unwrap();
    assert!(!fx
        .recordings
        .verify_snapshot(&desc(), &snapshot.name)
        .await
        .unwrap());
    assert!(fx.target.recording(&snapshot.name).is_none());
    assert_eq!(fx.target.closed_ids(), vec![snapshot.id]);
    assert_eq!(
        categories(&mut fx.notifications),
        vec![
            NotificationCategory::SnapshotCreated,
            NotificationCategory::SnapshotDeleted
        ]
    );
}

#[tokio::test]
async fn test_verifying_vanished_snapshot_fails() {
    let fx = fixture();
    let snapshot = fx.recordings.create_snapshot(&desc()).await.unwrap();
    fx.recordings.delete_recording(&desc(), &snapshot.name).await.unwrap();

    let err = fx
        .recordings
        .verify_snapshot(&desc(), &snapshot.name)
        .await
        .unwrap_err();
    assert!(matches!(err, RecordingError::SnapshotCreation { .. }));
}

#[tokio::test]
async fn test_delete_closes_once_and_cleans_archives() {
    let mut fx = fixture();
    let started = fx
        .recordings
        .start_recording(&desc(), request("r1", "Continuous"))
        .await
        .unwrap();
    categories(&mut fx.notifications);

    fx.recordings.delete_recording(&desc(), "r1").await.unwrap();
    assert_eq!(fx.target.closed_ids(), vec![started.id]);
    assert_eq!(
        fx.archives.deletions(),
        vec![(TargetId::new(URL), "r1".to_string())]
    );
    assert_eq!(
        categories(&mut fx.notifications),
        vec![NotificationCategory::RecordingDeleted]
    );

    let err = fx.recordings.delete_recording(&desc(), "r1").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(fx.target.closed_ids().len(), 1);
}

#[tokio::test]
async fn test_archive_recording() {
    let fx = fixture();
    fx.target.set_payload(b"recorded-bytes".to_vec());
    fx.recordings
        .start_recording(&desc(), request("r1", "Continuous"))
        .await
        .unwrap();

    let archived = fx
        .recordings
        .archive_recording(&desc(), "r1", "my app")
        .await
        .unwrap();
    assert!(archived.name.starts_with("my-app_r1_"));
    assert_eq!(archived.size, 14);
    assert_eq!(
        fx.archives.content(&TargetId::new(URL), &archived.name),
        Some(b"recorded-bytes".to_vec())
    );

    let listed = fx.recordings.list_archived(&TargetId::new(URL)).await.unwrap();
    assert_eq!(listed, vec![archived.clone()]);

    assert!(fx
        .recordings
        .delete_archive(&TargetId::new(URL), &archived.name)
        .await
        .unwrap());
    assert!(fx.archives.is_empty());

    let err = fx
        .recordings
        .archive_recording(&desc(), "missing", "my app")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_stream_holds_connection_lease() {
    let fx = fixture();
    let id = TargetId::new(URL);
    fx.recordings
        .start_recording(&desc(), request("r1", "Continuous"))
        .await
        .unwrap();

    assert!(fx.recordings.get_recording(&desc(), "missing").await.unwrap().is_none());

    let mut stream = fx.recordings.get_recording(&desc(), "r1").await.unwrap().unwrap();
    assert_eq!(fx.recordings.connections().in_use(&id), Some(1));

    let mut content = Vec::new();
    stream.read_to_end(&mut content).await.unwrap();
    assert!(!content.is_empty());

    drop(stream);
    assert_eq!(fx.recordings.connections().in_use(&id), Some(0));
}
