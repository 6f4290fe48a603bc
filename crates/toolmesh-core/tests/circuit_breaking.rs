mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use toolmesh_core::{
    Arguments, CallOptions, CircuitState, InMemoryConnector, MeshError, MeshEvent,
};

fn call_options() -> CallOptions {
    CallOptions::new().with_max_retries(0)
}

#[tokio::test(start_paused = true)]
async fn test_circuit_lifecycle() {
    let (server, healthy) = common::switchable("alpha");
    let connector = InMemoryConnector::new().with_server("alpha", server.clone());
    let client = common::start(common::memory_config(&[("alpha", &["search"])]), connector).await;

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    client.subscribe_all(move |event| {
        let label = match event {
            MeshEvent::CircuitOpened { tier, .. } => format!("opened:{tier}"),
            MeshEvent::CircuitHalfOpened { .. } => "half-open".to_string(),
            MeshEvent::CircuitClosed { .. } => "closed".to_string(),
            _ => return,
        };
        sink.lock().unwrap().push(label);
    });

    // Five failures in a row open the circuit.
    for _ in 0..5 {
        let err = assert_err!(
            client
                .execute_capability("search", Arguments::new(), &call_options())
                .await
        );
        assert!(matches!(err, MeshError::RequestFailed { .. }));
    }
    assert_eq!(client.circuit_state("alpha"), CircuitState::Open);
    let calls_when_opened = server.call_count();

    // While cooling down the server is not even tried.
    let err = assert_err!(
        client
            .execute_capability("search", Arguments::new(), &call_options())
            .await
    );
    assert!(matches!(err, MeshError::NoAvailableServer { .. }));
    assert_eq!(server.call_count(), calls_when_opened);

    // Failed trial: back to open with a longer cooldown.
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_err!(
        client
            .execute_capability("search", Arguments::new(), &call_options())
            .await
    );
    assert_eq!(client.circuit_state("alpha"), CircuitState::Open);
    let stats = client.circuit_stats("alpha").unwrap();
    assert_eq!(stats.tier, 1);
    assert_eq!(stats.cooldown_remaining, Some(Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(30)).await;
    let err = assert_err!(
        client
            .execute_capability("search", Arguments::new(), &call_options())
            .await
    );
    assert!(matches!(err, MeshError::NoAvailableServer { .. }));

    // Successful trial closes it.
    tokio::time::advance(Duration::from_secs(30)).await;
    healthy.store(true, Ordering::SeqCst);
    let done = assert_ok!(
        client
            .execute_capability("search", Arguments::new(), &call_options())
            .await
    );
    assert_eq!(done.result.text_content(), "recovered");
    assert_eq!(client.circuit_state("alpha"), CircuitState::Closed);

    assert_eq!(
        *transitions.lock().unwrap(),
        vec!["opened:0", "half-open", "opened:1", "half-open", "closed"]
    );
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_a_single_trial() {
    let (server, healthy) = common::switchable("alpha");
    let connector = InMemoryConnector::new().with_server("alpha", server.clone());
    let client = common::start(common::memory_config(&[("alpha", &["search"])]), connector).await;

    for _ in 0..5 {
        let _ = client
            .execute_capability("search", Arguments::new(), &call_options())
            .await;
    }
    assert_eq!(client.circuit_state("alpha"), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    healthy.store(true, Ordering::SeqCst);
    server.set_latency(Duration::from_millis(50));

    let options = call_options();
    let (trial, other) = tokio::join!(
        client.execute_capability("search", Arguments::new(), &options),
        client.execute_capability("search", Arguments::new(), &options),
    );

    assert_ok!(trial);
    assert!(matches!(other, Err(MeshError::NoAvailableServer { .. })));
    assert_eq!(client.circuit_state("alpha"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_over_to_peer() {
    let connector = InMemoryConnector::new()
        .with_server("broken", common::failing("broken"))
        .with_server(
            "steady",
            toolmesh_core::InMemoryServer::new("steady").with_text_tool("search", "steady"),
        );
    let mut config = common::memory_config(&[("broken", &["search"]), ("steady", &["search"])]);
    config.router.policy = toolmesh_core::LoadBalancingPolicy::RoundRobin;
    let client = common::start(config, connector).await;

    for _ in 0..12 {
        let done = assert_ok!(
            client
                .execute_capability("search", Arguments::new(), &CallOptions::new())
                .await
        );
        assert_eq!(done.server_id, "steady");
    }

    assert_eq!(client.circuit_state("broken"), CircuitState::Open);
    assert_eq!(client.circuit_state("steady"), CircuitState::Closed);
    let broken = client.server("broken").unwrap();
    assert_eq!(broken.success_count, 0);
    assert!(broken.error_count >= 5);
}
