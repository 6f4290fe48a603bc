mod common;

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use toolmesh_core::config::PoolConfig;
use toolmesh_core::{
    Arguments, CallOptions, ConnectionPool, EventBus, EventKind, FileDiscovery, InMemoryConnector,
    InMemoryServer, MeshClient, MeshError, RetryPolicy, ServerAddress, ServerConfig, ServerRecord,
    ServerRegistry, ServerStatus,
};

#[tokio::test]
async fn test_pool_grows_to_max_then_blocks() {
    let server = InMemoryServer::new("alpha").with_text_tool("search", "ok");
    let connector = InMemoryConnector::new().with_server("alpha", server.clone());
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(ServerRegistry::new(Default::default(), events.clone()));
    registry
        .register(ServerRecord::new("alpha", ServerAddress::Memory))
        .unwrap();
    let pool = ConnectionPool::new(Arc::new(connector), registry.clone(), events, RetryPolicy::no_retry());

    let config = PoolConfig {
        wait_timeout: Duration::from_millis(100),
        health_check_interval: Duration::from_secs(3600),
        ..PoolConfig::sized(1, 3)
    };
    pool.create_pool("alpha", ServerAddress::Memory, config)
        .await
        .unwrap();
    assert_eq!(server.connect_count(), 1);
    assert_eq!(registry.get("alpha").unwrap().status, ServerStatus::Connected);

    let (a, b, c) = tokio::join!(pool.acquire("alpha"), pool.acquire("alpha"), pool.acquire("alpha"));
    let leases = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(server.connect_count(), 3, "exactly two extra connections");

    let ids: HashSet<u64> = leases.iter().filter_map(|l| l.connection_id()).collect();
    assert_eq!(ids.len(), 3, "no connection leased twice");

    let err = pool.acquire("alpha").await.unwrap_err();
    assert!(matches!(err, MeshError::PoolExhausted { .. }));

    // A returned connection unblocks the next waiter without growing.
    let mut leases = leases.into_iter();
    let first = leases.next().unwrap();
    let returned_id = first.connection_id();
    let (next, ()) = tokio::join!(pool.acquire("alpha"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release();
    });
    assert_eq!(next.unwrap().connection_id(), returned_id);
    assert_eq!(server.connect_count(), 3);

    assert!(pool.close_pool("alpha").await);
    assert!(!pool.close_pool("alpha").await);
}

#[tokio::test]
async fn test_unregister_and_shutdown_are_idempotent() {
    let server = InMemoryServer::new("alpha").with_text_tool("search", "ok");
    let connector = InMemoryConnector::new().with_server("alpha", server.clone());
    let client = common::start(common::memory_config(&[("alpha", &["search"])]), connector).await;

    let unregistered = Arc::new(AtomicUsize::new(0));
    let counter = unregistered.clone();
    client.subscribe(EventKind::ServerUnregistered, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(client.unregister_server("alpha").await);
    assert!(!client.unregister_server("alpha").await);
    assert_eq!(unregistered.load(Ordering::SeqCst), 1);
    assert!(client.server("alpha").is_none());
    assert!(client.pool_stats("alpha").is_none());

    // The retired transport closes in the background.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(server.open_connections(), 0);

    client.shutdown().await;
    client.shutdown().await;
    assert!(matches!(
        client.register_server("beta", ServerConfig::new(ServerAddress::Memory)).await,
        Err(MeshError::ShutDown)
    ));
    assert!(matches!(
        client.discover(&CallOptions::new()).await,
        Err(MeshError::ShutDown)
    ));
}

#[tokio::test]
async fn test_runtime_registration_makes_server_routable() {
    let connector = InMemoryConnector::new()
        .with_server("late", InMemoryServer::new("late").with_text_tool("translate", "hola"));
    let client = common::start(common::memory_config(&[]), connector).await;

    assert!(client
        .execute_capability("translate", Arguments::new(), &CallOptions::new())
        .await
        .is_err());

    let status = client
        .register_server(
            "late",
            ServerConfig::new(ServerAddress::Memory).with_capabilities(["translate"]),
        )
        .await
        .unwrap();
    assert_eq!(status, ServerStatus::Connected);

    let done = client
        .execute_capability("translate", Arguments::new(), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(done.result.text_content(), "hola");
}

#[tokio::test]
async fn test_file_discovery_sweeps() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"servers": {{"found": {{"transport": "memory", "capabilities": ["lookup"]}}}}}}"#
    )
    .unwrap();

    let found = InMemoryServer::new("found").with_text_tool("lookup", "ok");
    let connector = InMemoryConnector::new().with_server("found", found.clone());
    let client = MeshClient::new(common::memory_config(&[]))
        .unwrap()
        .with_connector(connector)
        .with_discovery(FileDiscovery::new(file.path()));

    let report = client.sweep_discovery().await.unwrap();
    assert_eq!(report.added, vec!["found".to_string()]);
    assert_eq!(common::live(client.pool_stats("found")), 1);
    assert!(client
        .execute_capability("lookup", Arguments::new(), &CallOptions::new())
        .await
        .is_ok());

    std::fs::write(file.path(), r#"{"servers": {}}"#).unwrap();
    assert!(client.sweep_discovery().await.unwrap().is_empty());
    assert!(client.server("found").is_some(), "one missed sweep is tolerated");

    let report = client.sweep_discovery().await.unwrap();
    assert_eq!(report.removed, vec!["found".to_string()]);
    assert!(client.server("found").is_none());
    assert!(client.pool_stats("found").is_none());

    // An unreadable source leaves the registry alone.
    std::fs::write(file.path(), "not json").unwrap();
    assert!(client.sweep_discovery().await.is_err());
}

#[tokio::test]
async fn test_server_down_at_start_becomes_routable_after_reconnect() {
    let down = InMemoryServer::new("down").with_text_tool("search", "back online");
    down.set_reachable(false);
    let connector = InMemoryConnector::new().with_server("down", down.clone());
    let client = common::start(common::memory_config(&[("down", &["search"])]), connector).await;

    assert_eq!(client.server("down").unwrap().status, ServerStatus::Error);
    assert!(client.pool_stats("down").is_none());
    assert_eq!(client.circuit_stats("down").unwrap().window_failures, 1);
    assert!(matches!(
        client
            .execute_capability("search", Arguments::new(), &CallOptions::new())
            .await,
        Err(MeshError::NoAvailableServer { .. })
    ));

    // still down: nothing to recover
    assert!(client.reconnect_servers().await.unwrap().is_empty());
    assert_eq!(client.circuit_stats("down").unwrap().window_failures, 2);

    down.set_reachable(true);
    assert_eq!(client.reconnect_servers().await.unwrap(), vec!["down".to_string()]);
    assert_eq!(client.server("down").unwrap().status, ServerStatus::Connected);
    assert_eq!(common::live(client.pool_stats("down")), 1);

    let done = client
        .execute_capability("search", Arguments::new(), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(done.result.text_content(), "back online");
    assert!(client.reconnect_servers().await.unwrap().is_empty());
    client.shutdown().await;
}
