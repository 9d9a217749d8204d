//! Delegated-broker strategy end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;

use handoff::lifecycle::ShutdownError;
use handoff::upgrade::{BrokerState, BrokerUpgrader, SpawnError, Upgrader};
use handoff::{Engine, EngineError};

mod common;

fn engine(port: u16) -> Engine {
    Engine::new(common::engine_config(port)).route("/", get(|| async { "broker" }))
}

#[tokio::test]
async fn handoff_after_successor_is_ready() {
    let port = common::free_port();
    let launcher = Arc::new(common::RecordingLauncher::default());
    let broker = BrokerUpgrader::new(common::parts(launcher.clone()), Duration::from_secs(5));
    let engine = engine(port);
    let drained = Arc::new(AtomicUsize::new(0));
    let d = drained.clone();
    engine.register_on_shutdown(move || {
        d.fetch_add(1, Ordering::SeqCst);
    });

    let drive = async {
        common::wait_until_serving(port).await;
        assert_eq!(common::get(port, "/").await.1, "broker");

        let upgrade = tokio::spawn({
            let broker = broker.clone();
            async move { broker.upgrade().await }
        });
        while launcher.launch_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!broker.exit().is_set(), "no exit before readiness");
        launcher.report_ready();
        upgrade.await.unwrap()
    };
    let (result, upgraded) = tokio::join!(engine.run_with(&broker, std::future::pending()), drive);

    result.unwrap();
    assert_eq!(upgraded.unwrap(), 50_001);
    assert_eq!(broker.state(), BrokerState::HandedOff);
    assert_eq!(drained.load(Ordering::SeqCst), 1);
    assert!(!broker.slot().is_active());

    let launches = launcher.launches.lock().unwrap();
    assert_eq!(launches[0].slots.len(), 5, "listener at 3, readiness pipe at 4");
}

#[tokio::test]
async fn failed_upgrade_keeps_serving_until_shutdown() {
    let port = common::free_port();
    let launcher = Arc::new(common::RecordingLauncher::default());
    let broker = BrokerUpgrader::new(common::parts(launcher.clone()), Duration::from_millis(100));
    let engine = engine(port);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let drive = async {
        common::wait_until_serving(port).await;
        let err = broker.upgrade().await.unwrap_err();
        assert!(matches!(err, SpawnError::ReadinessTimeout { .. }));
        assert_eq!(broker.state(), BrokerState::Serving);
        assert_eq!(common::get(port, "/").await.0, 200);
        stop_tx.send(()).unwrap();
    };
    let shutdown = async {
        let _ = stop_rx.await;
    };
    let (result, ()) = tokio::join!(engine.run_with(&broker, shutdown), drive);

    result.unwrap();
    assert_eq!(*launcher.terminated.lock().unwrap(), vec![50_001]);
    assert_eq!(broker.state(), BrokerState::Stopped);
    assert!(broker.exit().is_set());
}

#[tokio::test]
async fn failed_drain_stops_accepting() {
    let port = common::free_port();
    let broker = BrokerUpgrader::new(common::parts(Arc::default()), Duration::from_millis(100));
    let engine = engine(port);
    engine.register_on_shutdown(|| panic!("flush failed"));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let drive = async {
        common::wait_until_serving(port).await;
        stop_tx.send(()).unwrap();
    };
    let shutdown = async {
        let _ = stop_rx.await;
    };
    let (result, ()) = tokio::join!(engine.run_with(&broker, shutdown), drive);

    assert!(matches!(
        result.unwrap_err(),
        EngineError::Shutdown(ShutdownError::CallbackPanicked { index: 0 })
    ));
    assert_eq!(broker.state(), BrokerState::Stopped);
    common::wait_until_closed(port).await;
}

#[tokio::test]
async fn stop_before_listen_is_safe() {
    let broker = BrokerUpgrader::new(
        common::parts(Arc::default()),
        Duration::from_millis(100),
    );
    broker.stop();
    assert!(broker.exit().is_set());
    assert!(matches!(broker.upgrade().await, Err(SpawnError::Finished)));
}
