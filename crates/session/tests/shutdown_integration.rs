//! Shutdown: draining, lifecycle transitions and the process-wide coordinator.

mod common;

use std::time::Duration;

use common::{MockFactory, ctx, endpoint};
use conduit_session::{
    CloseReason, EndpointConfig, Error, LifecycleState, ManagerConfig, ResourceManager,
    SessionEvent, ShutdownCoordinator,
};

#[tokio::test(start_paused = true)]
async fn shutdown_closes_everything_without_waiting_for_grace() {
    let (factory, recorder) = MockFactory::new();
    let config = ManagerConfig {
        grace_period: Duration::from_secs(3_600),
        ..Default::default()
    };
    let mgr = ResourceManager::new(factory, config).unwrap();
    let mut events = mgr.subscribe();

    let other = EndpointConfig::new("E2", "broker-2", 1, 1);
    for cfg in [endpoint(1, 1), endpoint(2, 1), other] {
        let (s, h) = mgr.get_session(&cfg, &ctx()).await.unwrap();
        mgr.release(h, s, false).await.unwrap();
    }
    assert_eq!(mgr.stats().closure_queue, 1);

    let started = tokio::time::Instant::now();
    mgr.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1), "drain must skip grace");

    assert_eq!(mgr.state(), LifecycleState::Stopped);
    assert_eq!(recorder.connections().len(), 3);
    for conn in recorder.connections() {
        assert_eq!(conn.closes(), 1);
    }
    let stats = mgr.stats();
    assert!(stats.entries.is_empty());
    assert_eq!(stats.closure_queue, 0);

    let shutdown_closes = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| {
            matches!(
                event,
                SessionEvent::ConnectionClosed {
                    reason: CloseReason::Shutdown,
                    ..
                }
            )
        })
        .count();
    assert_eq!(shutdown_closes, 3);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let (factory, recorder) = MockFactory::new();
    let mgr = ResourceManager::new(factory, ManagerConfig::default()).unwrap();
    let (s, h) = mgr.get_session(&endpoint(1, 1), &ctx()).await.unwrap();
    mgr.release(h, s, false).await.unwrap();

    mgr.shutdown().await;
    mgr.shutdown().await;
    assert_eq!(recorder.total_closes(), 1);
}

#[tokio::test]
async fn release_after_shutdown_still_closes_session() {
    let (factory, recorder) = MockFactory::new();
    let mgr = ResourceManager::new(factory, ManagerConfig::default()).unwrap();
    let (s, h) = mgr.get_session(&endpoint(1, 1), &ctx()).await.unwrap();

    mgr.shutdown().await;
    let err = mgr.release(h, s, false).await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotInitialized {
            state: LifecycleState::Stopped
        }
    ));
    assert!(err.is_lifecycle());

    let conn = recorder.connection(1);
    assert_eq!(
        conn.sessions_closed.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(conn.closes(), 1);
}

#[tokio::test]
async fn operations_after_shutdown_are_rejected() {
    let (factory, _recorder) = MockFactory::new();
    let mgr = ResourceManager::new(factory, ManagerConfig::default()).unwrap();
    mgr.shutdown().await;

    assert!(matches!(
        mgr.invalidate_endpoint("E1"),
        Err(Error::NotInitialized { .. })
    ));
    assert!(matches!(
        mgr.get_session(&endpoint(1, 1), &ctx()).await,
        Err(Error::NotInitialized { .. })
    ));
}

#[tokio::test]
async fn open_completing_during_shutdown_is_not_installed() {
    let (factory, recorder) = MockFactory::new();
    recorder.set_open_delay(Duration::from_millis(50));
    let mgr = std::sync::Arc::new(ResourceManager::new(factory, ManagerConfig::default()).unwrap());

    let pending = {
        let mgr = std::sync::Arc::clone(&mgr);
        tokio::spawn(async move { mgr.get_session(&endpoint(1, 1), &ctx()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    mgr.shutdown().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::NotInitialized { .. })));
    assert!(mgr.stats().entries.is_empty());
    assert_eq!(recorder.connection(1).closes(), 1, "late connection closed, not leaked");
}

// ---------------------------------------------------------------------------
// ShutdownCoordinator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn coordinator_lifecycle() {
    let coordinator = ShutdownCoordinator::<MockFactory>::new();
    assert_eq!(coordinator.state(), LifecycleState::Uninitialized);
    assert!(matches!(
        coordinator.instance(),
        Err(Error::NotInitialized {
            state: LifecycleState::Uninitialized
        })
    ));

    let (factory, recorder) = MockFactory::new();
    let mgr = coordinator
        .create_instance(factory, ManagerConfig::default())
        .unwrap();
    assert_eq!(coordinator.state(), LifecycleState::Running);
    assert!(std::sync::Arc::ptr_eq(&mgr, &coordinator.instance().unwrap()));

    let (again, _) = MockFactory::new();
    assert!(matches!(
        coordinator.create_instance(again, ManagerConfig::default()),
        Err(Error::AlreadyInitialized)
    ));

    let (s, h) = mgr.get_session(&endpoint(1, 1), &ctx()).await.unwrap();
    mgr.release(h, s, false).await.unwrap();

    coordinator.shutdown().await;
    assert_eq!(coordinator.state(), LifecycleState::Stopped);
    assert_eq!(mgr.state(), LifecycleState::Stopped);
    assert_eq!(recorder.total_closes(), 1);
    assert!(matches!(
        coordinator.instance(),
        Err(Error::NotInitialized {
            state: LifecycleState::Stopped
        })
    ));

    let (late, _) = MockFactory::new();
    assert!(matches!(
        coordinator.create_instance(late, ManagerConfig::default()),
        Err(Error::AlreadyInitialized)
    ));

    // Second shutdown is a no-op.
    coordinator.shutdown().await;
    assert_eq!(coordinator.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn coordinator_rejects_invalid_config_and_stays_uninitialized() {
    let coordinator = ShutdownCoordinator::<MockFactory>::default();
    let (factory, _) = MockFactory::new();
    let config = ManagerConfig {
        session_timeout: Duration::ZERO,
        ..Default::default()
    };
    assert!(matches!(
        coordinator.create_instance(factory, config),
        Err(Error::Configuration { .. })
    ));
    assert_eq!(coordinator.state(), LifecycleState::Uninitialized);
}

static COORDINATOR: ShutdownCoordinator<MockFactory> = ShutdownCoordinator::new();

#[tokio::test]
async fn coordinator_works_as_static() {
    let (factory, _) = MockFactory::new();
    let mgr = COORDINATOR
        .create_instance(factory, ManagerConfig::default())
        .unwrap();
    assert_eq!(mgr.state(), LifecycleState::Running);
    COORDINATOR.shutdown().await;
    assert_eq!(COORDINATOR.state(), LifecycleState::Stopped);
}
