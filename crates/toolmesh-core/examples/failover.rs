//! Failover and circuit breaking against in-process servers
//!
//! This example demonstrates:
//! - Registering in-process servers that share one capability
//! - Routing calls by latency
//! - Failing over when a server breaks and watching its circuit open
//! - Fanning a call out to every server
//!
//! Run with: cargo run -p toolmesh-core --example failover

use std::time::Duration;
use toolmesh_core::{
    Arguments, CallOptions, CapabilityResult, EventKind, FanoutPolicy, InMemoryConnector,
    InMemoryServer, MeshClient, MeshConfig, MeshError, MeshEvent, ServerAddress, ServerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    toolmesh_utils::logging::init_tracing();

    println!("=== toolmesh failover example ===\n");

    let flaky = InMemoryServer::new("flaky").with_tool("search", |args| {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        Ok(CapabilityResult::text(format!("flaky found '{query}'")))
    });
    let steady = InMemoryServer::new("steady")
        .with_text_tool("search", "steady found it")
        .with_latency(Duration::from_millis(40));

    let connector = InMemoryConnector::new()
        .with_server("flaky", flaky.clone())
        .with_server("steady", steady);

    let mut config = MeshConfig::default();
    config.router.rng_seed = Some(7);
    config.router.request_timeout = Duration::from_millis(500);
    config.circuit_breaker.cooldown = Duration::from_secs(5);
    for id in ["flaky", "steady"] {
        config.servers.insert(
            id.to_string(),
            ServerConfig::new(ServerAddress::Memory).with_capabilities(["search"]),
        );
    }

    let client = MeshClient::new(config)?.with_connector(connector);
    client.subscribe(EventKind::CircuitOpened, |event| {
        if let MeshEvent::CircuitOpened { server_id, cooldown, .. } = event {
            println!("   ! circuit opened for {server_id} ({cooldown:?})");
        }
    });
    client.start().await?;

    println!("1. Routing ten calls...");
    let args = Arguments::new().with("query", "rust");
    for _ in 0..10 {
        let done = client
            .execute_capability("search", args.clone(), &CallOptions::new())
            .await?;
        println!("   {} -> {}", done.server_id, done.result.text_content());
    }
    println!();

    println!("2. Taking 'flaky' offline...");
    flaky.set_reachable(false);
    for _ in 0..10 {
        match client
            .execute_capability("search", args.clone(), &CallOptions::new())
            .await
        {
            Ok(done) => println!(
                "   {} answered after {} failed attempt(s)",
                done.server_id,
                done.failed_attempts.len()
            ),
            Err(MeshError::RequestFailed { attempts, .. }) => {
                println!("   every attempt failed ({})", attempts.len());
            }
            Err(e) => println!("   error: {e}"),
        }
    }
    println!("   flaky circuit: {}\n", client.circuit_state("flaky"));

    println!("3. Fanning out to every available server...");
    let fanout = client
        .execute_fanout("search", args, &FanoutPolicy::All, &CallOptions::new())
        .await?;
    for success in &fanout.successes {
        println!("   ✓ {} in {:?}", success.server_id, success.latency);
    }
    for failure in &fanout.failures {
        println!("   ✗ {}: {}", failure.server_id, failure.error);
    }
    println!();

    println!("4. Registry:");
    for server in client.servers() {
        println!(
            "   {:<8} {:<12} ok={} err={} ema={:.1}ms",
            server.id,
            server.status,
            server.success_count,
            server.error_count,
            server.ema_latency_ms.unwrap_or_default()
        );
    }

    client.shutdown().await;
    println!("\n=== Example completed ===");
    Ok(())
}
