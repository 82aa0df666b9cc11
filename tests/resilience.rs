mod common;

use chrono::Duration as ChronoDuration;
use pandora_core::clock::Clock;
use pandora_core::config::ControlPlaneConfig;
use pandora_core::resilience::{BreakerRegistry, CancelToken, CircuitState};
use pandora_core::rules::{Action, ActionKind};
use pandora_core::Error;

#[tokio::test]
async fn test_failing_firewall_trips_and_recovers_breaker() {
    let h = common::start(ControlPlaneConfig::default()).await;
    let event = common::threat("ddos", 8, "192.168.1.100", h.clock.now());
    let action = Action::new(ActionKind::BlockIp).with_retries(1);
    let cancel = CancelToken::new();
    let key = BreakerRegistry::key("block_ip", "192.168.1.100");

    h.firewall.set_failing(true);
    for _ in 0..5 {
        let err = h
            .plane
            .executor
            .execute_action(&action, &event, &cancel)
            .await
            .unwrap_err();
        assert!(!matches!(err, Error::OpenCircuit(_)));
    }
    assert_eq!(h.plane.executor.breakers().get(&key).state(), CircuitState::Open);

    let short_circuited = h.plane.executor.execute_action(&action, &event, &cancel).await;
    assert!(matches!(short_circuited, Err(Error::OpenCircuit(_))));
    assert_eq!(h.firewall.call_count(), 5);

    // A failed probe re-opens for another full timeout.
    h.clock.advance(ChronoDuration::seconds(60));
    assert!(h.plane.executor.execute_action(&action, &event, &cancel).await.is_err());
    assert_eq!(h.plane.executor.breakers().get(&key).state(), CircuitState::Open);

    h.firewall.set_failing(false);
    h.clock.advance(ChronoDuration::seconds(60));
    h.plane
        .executor
        .execute_action(&action, &event, &cancel)
        .await
        .unwrap();
    assert_eq!(h.plane.executor.breakers().get(&key).state(), CircuitState::Closed);
    for _ in 0..100 {
        h.plane
            .executor
            .execute_action(&action, &event, &cancel)
            .await
            .unwrap();
    }
    assert_eq!(h.plane.executor.breakers().get(&key).state(), CircuitState::Closed);

    h.plane.shutdown().await;
}

#[tokio::test]
async fn test_open_breaker_isolated_per_target() {
    let h = common::start(ControlPlaneConfig::default()).await;
    let noisy = common::threat("port_scan", 9, "198.51.100.20", h.clock.now());
    let quiet = common::threat("port_scan", 9, "198.51.100.21", h.clock.now());
    let action = Action::new(ActionKind::BlockIp).with_retries(1);
    let cancel = CancelToken::new();

    h.firewall.set_failing(true);
    for _ in 0..5 {
        let _ = h.plane.executor.execute_action(&action, &noisy, &cancel).await;
    }
    h.firewall.set_failing(false);

    assert!(matches!(
        h.plane.executor.execute_action(&action, &noisy, &cancel).await,
        Err(Error::OpenCircuit(_))
    ));
    h.plane
        .executor
        .execute_action(&action, &quiet, &cancel)
        .await
        .unwrap();

    h.plane.shutdown().await;
}
