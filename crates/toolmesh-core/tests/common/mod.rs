//! Shared fixtures for the integration scenarios

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use toolmesh_core::{
    CapabilityResult, InMemoryConnector, InMemoryServer, MeshClient, MeshConfig, MeshError,
    ServerAddress, ServerConfig, pool::PoolStats,
};

/// Config for in-process servers: pools of 1..=3, no connect retries,
/// health checks out of the way and a fixed routing seed
pub fn memory_config(servers: &[(&str, &[&str])]) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.pool.min_connections = 1;
    config.pool.max_connections = 3;
    config.pool.health_check_interval = Duration::from_secs(3600);
    config.pool.wait_timeout = Duration::from_millis(200);
    config.connect_retry.max_attempts = 1;
    config.router.rng_seed = Some(1234);
    config.discovery.interval = Duration::from_secs(3600);
    for (id, capabilities) in servers {
        config.servers.insert(
            (*id).to_string(),
            ServerConfig::new(ServerAddress::Memory).with_capabilities(capabilities.iter().copied()),
        );
    }
    config
}

pub async fn start(config: MeshConfig, connector: InMemoryConnector) -> MeshClient {
    let client = MeshClient::new(config)
        .expect("valid config")
        .with_connector(connector);
    client.start().await.expect("start");
    client
}

/// Server whose `search` tool fails with a server error while the switch
/// is off
pub fn switchable(name: &str) -> (InMemoryServer, Arc<AtomicBool>) {
    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    let server = InMemoryServer::new(name).with_tool("search", move |_| {
        if flag.load(Ordering::SeqCst) {
            Ok(CapabilityResult::text("recovered"))
        } else {
            Err(MeshError::Protocol {
                code: -32000,
                message: "backend unavailable".into(),
            })
        }
    });
    (server, healthy)
}

pub fn failing(name: &str) -> InMemoryServer {
    switchable(name).0
}

pub fn live(stats: Option<PoolStats>) -> usize {
    stats.map_or(0, |s| s.live)
}
