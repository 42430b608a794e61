//! Integration tests for the connection manager
//!
//! These run against loopback targets with the tokio clock paused, so
//! backoff, open delays and idle timeouts elapse instantly.

use control_plane::config::ConnectionConfig;
use control_plane::connection::{ConnectedChannel, ConnectionManager};
use async_trait::async_trait;
use control_plane::loopback::LoopbackFactory;
use control_plane::target_control::{ChannelResult, ConnectionFactory, ControlChannel};
use control_plane::ConnectionError;
use rule_engine::{ConnectionDescriptor, Credentials, TargetId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const A: &str = "loop://a";
const B: &str = "loop://b";

fn setup(max_open: usize) -> (Arc<LoopbackFactory>, ConnectionManager) {
    let factory = Arc::new(LoopbackFactory::new());
    factory.register(A);
    factory.register(B);
    let config = ConnectionConfig {
        max_open,
        idle_ttl: Duration::from_secs(60),
        reap_interval: Duration::from_secs(5),
        open_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let manager = ConnectionManager::new(factory.clone(), config);
    (factory, manager)
}

fn desc(id: &str) -> ConnectionDescriptor {
    ConnectionDescriptor::new(id)
}

async fn touch(manager: &ConnectionManager, id: &str) -> Result<(), ConnectionError> {
    manager
        .with_connection(&desc(id), |mut channel: ConnectedChannel| async move {
            channel.list_recordings().await.expect("loopback listing");
            Ok::<_, ConnectionError>(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_connection_is_reused() {
    let (factory, manager) = setup(4);

    touch(&manager, A).await.unwrap();
    touch(&manager, A).await.unwrap();
    touch(&manager, A).await.unwrap();

    assert_eq!(factory.open_count(), 1);
    assert!(manager.is_open(&TargetId::new(A)));
    assert_eq!(manager.in_use(&TargetId::new(A)), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_open() {
    let (factory, manager) = setup(4);
    factory.set_open_delay(Duration::from_millis(200));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            manager.submit(desc(A), |mut channel: ConnectedChannel| async move {
                let listed = channel.list_recordings().await.expect("loopback listing");
                Ok::<_, ConnectionError>(listed.len())
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }
    assert_eq!(factory.open_count(), 1);
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_work_on_one_target_is_serialized() {
    let (_factory, manager) = setup(4);
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let first = manager.submit(desc(A), move |_channel: ConnectedChannel| async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok::<_, ConnectionError>(())
    });
    started_rx.await.unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let second = manager.submit(desc(A), move |_channel: ConnectedChannel| async move {
        flag.store(true, Ordering::SeqCst);
        Ok::<_, ConnectionError>(())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ran.load(Ordering::SeqCst));

    release_tx.send(()).unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_capacity_exhausted_when_all_busy() {
    let (factory, manager) = setup(1);
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let busy = manager.submit(desc(A), move |_channel: ConnectedChannel| async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok::<_, ConnectionError>(())
    });
    started_rx.await.unwrap();

    let err = touch(&manager, B).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::CapacityExhausted { max_open: 1, .. }
    ));

    release_tx.send(()).unwrap();
    busy.await.unwrap().unwrap();

    // A is idle now and gets evicted to make room.
    touch(&manager, B).await.unwrap();
    assert!(manager.is_open(&TargetId::new(B)));
    assert!(!manager.is_open(&TargetId::new(A)));
    assert_eq!(factory.disconnect_count(), 1);
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_least_recently_used_is_evicted() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.register(A);
    factory.register(B);
    factory.register("loop://c");
    let config = ConnectionConfig {
        max_open: 2,
        ..Default::default()
    };
    let manager = ConnectionManager::new(factory.clone(), config);

    touch(&manager, A).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    touch(&manager, B).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    touch(&manager, A).await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;

    touch(&manager, "loop://c").await.unwrap();
    assert!(manager.is_open(&TargetId::new(A)));
    assert!(!manager.is_open(&TargetId::new(B)));
    assert!(manager.is_open(&TargetId::new("loop://c")));
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_evicted() {
    let (factory, manager) = setup(4);
    touch(&manager, A).await.unwrap();

    assert_eq!(manager.evict_idle().await, 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(manager.evict_idle().await, 1);

    assert!(!manager.is_open(&TargetId::new(A)));
    assert_eq!(factory.disconnect_count(), 1);

    touch(&manager, A).await.unwrap();
    assert_eq!(factory.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_leased_connection_is_not_evicted() {
    let (factory, manager) = setup(4);
    let lease = manager
        .with_connection(&desc(A), |channel: ConnectedChannel| async move {
            Ok::<_, ConnectionError>(channel.lease())
        })
        .await
        .unwrap();
    assert_eq!(manager.in_use(&TargetId::new(A)), Some(1));

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(manager.evict_idle().await, 0);

    drop(lease);
    assert_eq!(manager.in_use(&TargetId::new(A)), Some(0));
    assert_eq!(manager.evict_idle().await, 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(manager.evict_idle().await, 1);
    assert_eq!(factory.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_closes_idle_connections() {
    let (factory, manager) = setup(4);
    let reaper = manager.spawn_reaper();

    touch(&manager, A).await.unwrap();
    tokio::time::sleep(Duration::from_secs(70)).await;

    assert!(!manager.is_open(&TargetId::new(A)));
    assert_eq!(factory.disconnect_count(), 1);

    manager.close_all().await;
    reaper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_open_is_retried() {
    let (factory, manager) = setup(4);
    factory.fail_next_opens(2);

    touch(&manager, A).await.unwrap();
    assert_eq!(factory.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_after_all_attempts() {
    let (factory, manager) = setup(4);
    factory.fail_next_opens(3);

    let err = touch(&manager, A).await.unwrap_err();
    match err {
        ConnectionError::ConnectionFailed {
            target, attempts, ..
        } => {
            assert_eq!(target, TargetId::new(A));
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(manager.connection_count(), 0);

    // The failed slot does not linger.
    touch(&manager, A).await.unwrap();
    assert_eq!(factory.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_credentials_come_from_descriptor() {
    let factory = Arc::new(LoopbackFactory::new());
    factory.register(A);
    factory.require_credentials(A, Credentials::new("admin", "secret"));
    let secured = ConnectionManager::new(
        factory.clone(),
        ConnectionConfig {
            open_attempts: 1,
            ..Default::default()
        },
    );

    let err = touch(&secured, A).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));

    let with_credentials = desc(A).with_credentials(Credentials::new("admin", "secret"));
    secured
        .with_connection(&with_credentials, |_channel: ConnectedChannel| async move {
            Ok::<_, ConnectionError>(())
        })
        .await
        .unwrap();
    assert!(secured.is_open(&TargetId::new(A)));
}

#[tokio::test(start_paused = true)]
async fn test_target_removed_while_opening() {
    let (factory, manager) = setup(4);
    factory.set_open_delay(Duration::from_secs(5));

    let pending = manager.submit(desc(A), |_channel: ConnectedChannel| async move {
        Ok::<_, ConnectionError>(())
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.connection_count(), 1);

    manager.on_target_removed(&TargetId::new(A)).await;
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, ConnectionError::Cancelled(TargetId::new(A)));
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_target_removed_while_working() {
    let (factory, manager) = setup(4);
    let (started_tx, started_rx) = oneshot::channel::<()>();

    let stuck = manager.submit(desc(A), move |_channel: ConnectedChannel| async move {
        let _ = started_tx.send(());
        std::future::pending::<()>().await;
        Ok::<_, ConnectionError>(())
    });
    started_rx.await.unwrap();

    manager.on_target_removed(&TargetId::new(A)).await;
    let err = stuck.await.unwrap().unwrap_err();
    assert_eq!(err, ConnectionError::Cancelled(TargetId::new(A)));
    assert!(!manager.is_open(&TargetId::new(A)));
    assert_eq!(factory.disconnect_count(), 1);

    // Other targets are unaffected.
    touch(&manager, B).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_all_rejects_further_work() {
    let (factory, manager) = setup(4);
    touch(&manager, A).await.unwrap();
    touch(&manager, B).await.unwrap();

    manager.close_all().await;
    assert_eq!(factory.disconnect_count(), 2);
    assert_eq!(manager.connection_count(), 0);

    let err = touch(&manager, A).await.unwrap_err();
    assert_eq!(err, ConnectionError::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_work_stays_exclusive_after_channel_is_dropped() {
    let (_factory, manager) = setup(1);
    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let busy = manager.submit(desc(A), move |channel: ConnectedChannel| {
        drop(channel);
        async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, ConnectionError>(())
        }
    });
    started_rx.await.unwrap();
    assert_eq!(manager.in_use(&TargetId::new(A)), Some(1));

    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(manager.evict_idle().await, 0);
    assert!(matches!(
        touch(&manager, B).await,
        Err(ConnectionError::CapacityExhausted { .. })
    ));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let queued = manager.submit(desc(A), move |_channel: ConnectedChannel| async move {
        flag.store(true, Ordering::SeqCst);
        Ok::<_, ConnectionError>(())
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ran.load(Ordering::SeqCst));

    release_tx.send(()).unwrap();
    busy.await.unwrap().unwrap();
    queued.await.unwrap().unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(manager.in_use(&TargetId::new(A)), Some(0));
}

/// Panics on the first open, then delegates to a loopback factory.
struct PanicsOnce {
    inner: LoopbackFactory,
    panicked: AtomicBool,
}

#[async_trait]
impl ConnectionFactory for PanicsOnce {
    async fn open(
        &self,
        target: &TargetId,
        credentials: Option<&Credentials>,
    ) -> ChannelResult<Box<dyn ControlChannel>> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("driver bug");
        }
        self.inner.open(target, credentials).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicked_open_does_not_stick() {
    let factory = PanicsOnce {
        inner: LoopbackFactory::new(),
        panicked: AtomicBool::new(false),
    };
    factory.inner.register(A);
    let manager = ConnectionManager::new(Arc::new(factory), ConnectionConfig::default());

    match touch(&manager, A).await.unwrap_err() {
        ConnectionError::ConnectionFailed { target, .. } => assert_eq!(target, TargetId::new(A)),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(manager.connection_count(), 0);

    touch(&manager, A).await.unwrap();
    assert!(manager.is_open(&TargetId::new(A)));
}
