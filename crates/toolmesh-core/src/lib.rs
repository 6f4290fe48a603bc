//! Multi-server Model Context Protocol (MCP) client
//!
//! `toolmesh-core` sits between a caller and any number of MCP tool
//! servers and takes care of:
//! - Registering servers statically or through periodic discovery
//! - Keeping a bounded pool of persistent connections per server
//! - Routing each capability call to a healthy server, balanced by latency,
//!   round-robin or load
//! - Isolating failing servers behind per-server circuit breakers and
//!   failing over to the remaining candidates
//! - Fanning a call out to every candidate and aggregating the results
//!
//! # Example
//!
//! ```no_run
//! use toolmesh_core::{Arguments, CallOptions, FanoutPolicy, MeshClient, MeshConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::load_merged()?;
//! let client = MeshClient::new(config)?;
//! client.start().await?;
//!
//! // Refresh advertised capabilities
//! for report in client.discover(&CallOptions::new()).await? {
//!     println!("{}: {} tool(s)", report.server_id, report.tools.len());
//! }
//!
//! // Ask every search backend and keep whatever answers first
//! let args = Arguments::new().with("query", "circuit breakers");
//! let options = CallOptions::new().with_timeout(Duration::from_secs(5));
//! let fanout = client
//!     .execute_fanout("web_search", args, &FanoutPolicy::FirstSuccess, &options)
//!     .await?;
//! println!("{} server(s) answered", fanout.successes.len());
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod balancer;
pub mod breaker;
pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod pool;
pub mod random;
pub mod registry;
pub mod retry;
pub mod router;
pub mod transport;

// Re-export commonly used types
pub use aggregator::{AggregatedResult, FanoutPolicy, ResultAggregator, ServerSuccess};
pub use balancer::{LoadBalancer, LoadBalancingPolicy};
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::MeshClient;
pub use config::{MeshConfig, ServerAddress, ServerConfig};
pub use discovery::{DiscoveredServer, DiscoverySource, FileDiscovery, StaticDiscovery};
pub use error::{AttemptFailure, MeshError};
pub use events::{EventBus, EventKind, MeshEvent};
pub use pool::{ConnectionPool, PoolStats};
pub use random::SharedRng;
pub use registry::{ServerRecord, ServerRegistry, ServerStatus};
pub use retry::RetryPolicy;
pub use router::{CallOptions, Execution, Router, RoutingDecision};
pub use transport::{Arguments, CapabilityResult, Content, InMemoryConnector, InMemoryServer};

/// Result type for toolmesh operations
pub type Result<T> = std::result::Result<T, MeshError>;
