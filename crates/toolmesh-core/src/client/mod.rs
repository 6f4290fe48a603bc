//! Client façade
//!
//! [`MeshClient`] owns one registry, connection pool, circuit breaker,
//! router and event bus. Several clients can live in one process; nothing
//! here is global.

mod sweep;

use crate::Result;
use crate::aggregator::{AggregatedResult, FanoutPolicy, ResultAggregator};
use crate::balancer::LoadBalancer;
use crate::breaker::{CircuitBreaker, CircuitState, CircuitStats};
use crate::config::{MeshConfig, PoolConfig, ServerAddress, ServerConfig};
use crate::discovery::{DescribeReport, DiscoverySource, FileDiscovery};
use crate::error::MeshError;
use crate::events::{EventBus, EventKind, MeshEvent, SubscriptionId};
use crate::pool::{ConnectionPool, PoolStats};
use crate::random::SharedRng;
use crate::registry::{ServerRecord, ServerRegistry, ServerStatus, SweepReport};
use crate::retry::RetryPolicy;
use crate::router::{CallOptions, Execution, Router, RoutingDecision};
use crate::transport::{Arguments, Connector, DefaultConnector};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Components shared with background tasks
struct Inner {
    config: MeshConfig,
    connector: Arc<dyn Connector>,
    rng: SharedRng,
    discovery: Option<Arc<dyn DiscoverySource>>,
    events: Arc<EventBus>,
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    router: Router,
    shut_down: AtomicBool,
}

impl Inner {
    fn assemble(
        config: MeshConfig,
        connector: Arc<dyn Connector>,
        rng: SharedRng,
        discovery: Option<Arc<dyn DiscoverySource>>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ServerRegistry::new(config.registry.clone(), events.clone()));
        let retry = RetryPolicy::from(&config.connect_retry).with_rng(rng.clone());
        let pool = Arc::new(ConnectionPool::new(
            connector.clone(),
            registry.clone(),
            events.clone(),
            retry,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            events.clone(),
        ));
        let router = Router::new(
            registry.clone(),
            pool.clone(),
            breaker.clone(),
            LoadBalancer::new(rng.clone()),
            config.router.clone(),
        );

        Self {
            config,
            connector,
            rng,
            discovery,
            events,
            registry,
            pool,
            breaker,
            router,
            shut_down: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(MeshError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn register_server(&self, id: &str, config: &ServerConfig) -> Result<ServerStatus> {
        self.ensure_running()?;
        self.registry
            .register(ServerRecord::from_config(id, config))?;

        let pool_config = config.pool.clone().unwrap_or_else(|| self.config.pool.clone());
        self.open_pool(id, config.address.clone(), pool_config).await;

        Ok(self
            .registry
            .get(id)
            .map_or(ServerStatus::Unknown, |r| r.status))
    }

    /// Create the pool of a registered server
    ///
    /// A failure marks the server `error` and counts against its circuit;
    /// the reconnect pass retries it later.
    async fn open_pool(&self, id: &str, address: ServerAddress, pool_config: PoolConfig) -> bool {
        match self.pool.create_pool(id, address, pool_config).await {
            // Another task got there first.
            Ok(()) | Err(MeshError::DuplicateServer(_)) => true,
            Err(e) => {
                warn!(server_id = %id, "Server has no pool: {}", e);
                self.registry.update_status(id, ServerStatus::Error);
                self.breaker.record_failure(id);
                false
            }
        }
    }
}

/// Multi-server MCP client
///
/// # Example
///
/// ```no_run
/// use toolmesh_core::{Arguments, CallOptions, MeshClient, MeshConfig};
///
/// # async fn example() -> toolmesh_core::Result<()> {
/// let client = MeshClient::new(MeshConfig::from_file("toolmesh.json")?)?;
/// client.start().await?;
///
/// let args = Arguments::new().with("query", "rust async");
/// let done = client
///     .execute_capability("web_search", args, &CallOptions::new())
///     .await?;
/// println!("{} answered: {}", done.server_id, done.result.text_content());
///
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct MeshClient {
    inner: Arc<Inner>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _stop_tasks: DropGuard,
}

impl MeshClient {
    /// Build a client from validated configuration
    ///
    /// Nothing is connected until [`Self::start`].
    pub fn new(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let rng = config
            .router
            .rng_seed
            .map_or_else(SharedRng::from_entropy, SharedRng::seeded);
        let discovery: Option<Arc<dyn DiscoverySource>> = config
            .discovery
            .file
            .as_ref()
            .map(|path| Arc::new(FileDiscovery::new(path.clone())) as Arc<dyn DiscoverySource>);

        Ok(Self::from_inner(Inner::assemble(
            config,
            Arc::new(DefaultConnector::new()),
            rng,
            discovery,
        )))
    }

    fn from_inner(inner: Inner) -> Self {
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(inner),
            started: AtomicBool::new(false),
            _stop_tasks: cancel.clone().drop_guard(),
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the client around another connector
    ///
    /// Builders discard event subscriptions; call them before subscribing.
    pub fn with_connector(self, connector: impl Connector + 'static) -> Self {
        let inner = &self.inner;
        Self::from_inner(Inner::assemble(
            inner.config.clone(),
            Arc::new(connector),
            inner.rng.clone(),
            inner.discovery.clone(),
        ))
    }

    /// Use `rng` for routing and retry jitter
    pub fn with_rng(self, rng: SharedRng) -> Self {
        let inner = &self.inner;
        Self::from_inner(Inner::assemble(
            inner.config.clone(),
            inner.connector.clone(),
            rng,
            inner.discovery.clone(),
        ))
    }

    /// Poll `source` for servers once started
    pub fn with_discovery(self, source: impl DiscoverySource + 'static) -> Self {
        let inner = &self.inner;
        Self::from_inner(Inner::assemble(
            inner.config.clone(),
            inner.connector.clone(),
            inner.rng.clone(),
            Some(Arc::new(source)),
        ))
    }

    /// Register every configured server and start background discovery
    ///
    /// Servers whose pool cannot be created stay registered with status
    /// `error`; start only fails if the client was shut down. A second call
    /// does nothing.
    pub async fn start(&self) -> Result<()> {
        self.inner.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let servers = &self.inner.config.servers;
        let statuses = join_all(
            servers
                .iter()
                .map(|(id, server)| self.inner.register_server(id, server)),
        )
        .await;

        let mut connected = 0;
        for ((id, _), status) in servers.iter().zip(statuses) {
            match status {
                Ok(ServerStatus::Error) => {}
                Ok(_) => connected += 1,
                Err(e) => warn!(server_id = %id, "Failed to register server: {}", e),
            }
        }
        if servers.is_empty() {
            debug!("No static servers configured");
        } else if connected == 0 {
            warn!("No configured server could be reached; continuing degraded");
        } else {
            info!(connected, total = servers.len(), "Client started");
        }

        let mut tasks = vec![sweep::spawn_reconnect_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.pool.health_check_interval,
            self.cancel.clone(),
        )];
        if self.inner.discovery.is_some() {
            tasks.push(sweep::spawn_discovery_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.discovery.interval,
                self.cancel.clone(),
            ));
        }
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Register a server at runtime and create its pool
    ///
    /// Returns the resulting status: `error` when the pool could not be
    /// created, in which case routing skips the server.
    pub async fn register_server(&self, id: &str, config: ServerConfig) -> Result<ServerStatus> {
        self.inner.register_server(id, &config).await
    }

    /// Close a server's pool and forget it; `false` if it was unknown
    pub async fn unregister_server(&self, id: &str) -> bool {
        self.inner.pool.close_pool(id).await;
        self.inner.breaker.remove(id);
        self.inner.registry.unregister(id)
    }

    /// Ask every registered server for its tools and merge them into the
    /// registry
    ///
    /// Probes run in parallel with a per-server timeout; a failing server,
    /// or one without a pool, yields a report carrying its error. Reports
    /// are ordered by id.
    pub async fn discover(&self, options: &CallOptions) -> Result<Vec<DescribeReport>> {
        self.inner.ensure_running()?;
        options.check_cancelled()?;
        let timeout = options.attempt_timeout(self.inner.config.discovery.describe_timeout)?;

        let ids = self.inner.registry.ids();
        let probes = join_all(ids.iter().map(|id| self.describe(id, timeout)));
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let reports = tokio::select! {
            reports = probes => reports,
            () = cancelled => return Err(MeshError::Cancelled("discovery cancelled".to_string())),
        };

        let failed = reports.iter().filter(|r| !r.is_ok()).count();
        info!(servers = reports.len(), failed, "Capability discovery finished");
        Ok(reports)
    }

    async fn describe(&self, server_id: &str, timeout: Duration) -> DescribeReport {
        let started = Instant::now();
        let probe = async {
            // No pool yields `PoolClosed`.
            let mut lease = self.inner.pool.acquire(server_id).await?;
            lease.describe().await
        };
        let outcome = match tokio::time::timeout(timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::RequestTimeout {
                server_id: server_id.to_string(),
                timeout,
            }),
        };
        let latency = started.elapsed();

        match outcome {
            Ok(tools) => {
                let added = self
                    .inner
                    .registry
                    .merge_capabilities(server_id, tools.iter().map(|t| t.name.clone()))
                    .unwrap_or(0);
                debug!(server_id = %server_id, tools = tools.len(), added, "Server described itself");
                DescribeReport {
                    server_id: server_id.to_string(),
                    tools,
                    added,
                    latency,
                    error: None,
                }
            }
            Err(e) => {
                warn!(server_id = %server_id, "Describe failed: {}", e);
                DescribeReport {
                    server_id: server_id.to_string(),
                    tools: Vec::new(),
                    added: 0,
                    latency,
                    error: Some(e),
                }
            }
        }
    }

    /// Routing decision for `capability` without sending anything
    pub fn route(&self, capability: &str, options: &CallOptions) -> Result<RoutingDecision> {
        self.inner.ensure_running()?;
        self.inner.router.route(capability, options.policy)
    }

    /// Run `capability` on one server, failing over as needed
    pub async fn execute_capability(
        &self,
        capability: &str,
        args: Arguments,
        options: &CallOptions,
    ) -> Result<Execution> {
        self.inner.ensure_running()?;
        self.inner.router.execute(capability, &args, options).await
    }

    /// Run `capability` on every eligible server and aggregate
    pub async fn execute_fanout(
        &self,
        capability: &str,
        args: Arguments,
        policy: &FanoutPolicy,
        options: &CallOptions,
    ) -> Result<AggregatedResult> {
        self.inner.ensure_running()?;
        options.check_cancelled()?;

        let router = &self.inner.router;
        let decision = router.route(capability, options.policy)?;
        let attempt_timeout = options.attempt_timeout(router.config().request_timeout)?;
        let fanout_timeout = options.attempt_timeout(router.config().fanout_timeout)?;

        // No dispatch outlives the fanout, so every straggler records its
        // own timeout.
        let now = Instant::now();
        let fanout_deadline = now + fanout_timeout;
        let attempt_deadline = (now + attempt_timeout).min(fanout_deadline);

        let ids: Vec<String> = decision.candidates().map(str::to_string).collect();
        debug!(capability, servers = ids.len(), policy = %policy, "Fanning out");
        let dispatches: Vec<_> = ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    router.dispatch_until(id, capability, &args, attempt_deadline, options.cancel.as_ref()),
                )
            })
            .collect();

        let aggregator = ResultAggregator::new(fanout_timeout).with_deadline(fanout_deadline);
        let aggregation = aggregator.aggregate(capability, dispatches, policy);
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = aggregation => result,
            () = cancelled => Err(MeshError::Cancelled("fanout cancelled".to_string())),
        }
    }

    /// One discovery reconciliation pass; the background loop calls this
    /// on every tick
    pub async fn sweep_discovery(&self) -> Result<SweepReport> {
        self.inner.ensure_running()?;
        sweep::sweep(&self.inner).await
    }

    /// Retry the pool of every registered server that has none
    ///
    /// Servers whose circuit is cooling down are skipped. Returns the ids
    /// that got a pool. Runs in the background every health-check interval.
    pub async fn reconnect_servers(&self) -> Result<Vec<String>> {
        self.inner.ensure_running()?;
        Ok(sweep::reconnect(&self.inner).await)
    }

    /// Register a handler for one kind of event
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Channel of every event emitted from now on
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.receiver()
    }

    /// Registry snapshot ordered by id
    pub fn servers(&self) -> Vec<ServerRecord> {
        self.inner.registry.snapshot()
    }

    pub fn server(&self, id: &str) -> Option<ServerRecord> {
        self.inner.registry.get(id)
    }

    pub fn circuit_state(&self, id: &str) -> CircuitState {
        self.inner.breaker.state(id)
    }

    pub fn circuit_stats(&self, id: &str) -> Option<CircuitStats> {
        self.inner.breaker.stats(id)
    }

    pub fn pool_stats(&self, id: &str) -> Option<PoolStats> {
        self.inner.pool.stats(id)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop background tasks and close every pool
    ///
    /// Later calls return immediately; every other operation then fails
    /// with [`MeshError::ShutDown`].
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down client");

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }

        self.inner.pool.close_all().await;
        info!("Client shut down");
    }
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("servers", &self.inner.registry.len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ServerAddress};
    use crate::discovery::{DiscoveredServer, MockDiscoverySource};
    use crate::transport::{InMemoryConnector, InMemoryServer};

    fn memory_server(caps: &[&str]) -> ServerConfig {
        ServerConfig::new(ServerAddress::Memory)
            .with_capabilities(caps.iter().copied())
            .with_pool(PoolConfig::sized(1, 2))
    }

    fn config_with(servers: &[(&str, &[&str])]) -> MeshConfig {
        let mut config = MeshConfig::default();
        config.connect_retry.max_attempts = 1;
        config.router.rng_seed = Some(5);
        for (id, caps) in servers {
            config.servers.insert((*id).to_string(), memory_server(caps));
        }
        config
    }

    fn client_with(connector: InMemoryConnector, servers: &[(&str, &[&str])]) -> MeshClient {
        MeshClient::new(config_with(servers)).unwrap().with_connector(connector)
    }

    #[tokio::test]
    async fn test_start_degrades_unreachable_server() {
        let connector = InMemoryConnector::new()
            .with_server("up", InMemoryServer::new("up").with_text_tool("echo", "hi"));
        let client = client_with(connector, &[("up", &["echo"]), ("down", &["echo"])]);

        client.start().await.unwrap();
        assert_eq!(client.server("up").unwrap().status, ServerStatus::Connected);
        assert_eq!(client.server("down").unwrap().status, ServerStatus::Error);

        let done = client
            .execute_capability("echo", Arguments::new(), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(done.server_id, "up");
        assert_eq!(client.circuit_stats("down").unwrap().window_failures, 1);

        let reports = client.discover(&CallOptions::new()).await.unwrap();
        let ids: Vec<_> = reports.iter().map(|r| r.server_id.as_str()).collect();
        assert_eq!(ids, ["down", "up"]);
        assert!(matches!(reports[0].error, Some(MeshError::PoolClosed(_))));
        assert!(reports[1].is_ok());
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_loop_recovers_server_down_at_start() {
        let late = InMemoryServer::new("late").with_text_tool("echo", "back");
        late.set_reachable(false);
        let connector = InMemoryConnector::new().with_server("late", late.clone());
        let mut config = config_with(&[("late", &["echo"])]);
        config.pool.health_check_interval = Duration::from_secs(1);
        let client = MeshClient::new(config).unwrap().with_connector(connector);

        client.start().await.unwrap();
        assert_eq!(client.server("late").unwrap().status, ServerStatus::Error);
        assert!(client.pool_stats("late").is_none());

        late.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(client.server("late").unwrap().status, ServerStatus::Connected);
        let done = client
            .execute_capability("echo", Arguments::new(), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(done.result.text_content(), "back");
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_duplicate() {
        let connector = InMemoryConnector::new().with_server("a", InMemoryServer::new("a"));
        let client = client_with(connector, &[("a", &[])]);
        client.start().await.unwrap();

        let err = client
            .register_server("a", memory_server(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::DuplicateServer(_)));
    }

    #[tokio::test]
    async fn test_discover_merges_advertised_tools() {
        let connector = InMemoryConnector::new().with_server(
            "a",
            InMemoryServer::new("a")
                .with_text_tool("search", "x")
                .with_text_tool("fetch", "y"),
        );
        let client = client_with(connector, &[("a", &["search"])]);
        client.start().await.unwrap();

        let reports = client.discover(&CallOptions::new()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_ok());
        assert_eq!(reports[0].added, 1);
        assert!(client.server("a").unwrap().has_capability("fetch"));
    }

    #[tokio::test]
    async fn test_discover_reports_slow_server() {
        let slow = InMemoryServer::new("slow").with_text_tool("search", "x");
        let connector = InMemoryConnector::new()
            .with_server("fast", InMemoryServer::new("fast"))
            .with_server("slow", slow.clone());
        let client = client_with(connector, &[("fast", &[]), ("slow", &[])]);
        client.start().await.unwrap();
        slow.set_latency(Duration::from_millis(500));

        let reports = client
            .discover(&CallOptions::new().with_timeout(Duration::from_millis(50)))
            .await
            .unwrap();
        let ids: Vec<&str> = reports.iter().map(|r| r.server_id.as_str()).collect();
        assert_eq!(ids, vec!["fast", "slow"]);
        assert!(reports[0].is_ok());
        assert!(matches!(
            reports[1].error,
            Some(MeshError::RequestTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_with_mock_source() {
        let connector = InMemoryConnector::new()
            .with_server("found", InMemoryServer::new("found").with_text_tool("lookup", "ok"));

        let mut source = MockDiscoverySource::new();
        source.expect_list_servers().returning(|| {
            Ok(vec![
                DiscoveredServer::new("found", ServerAddress::Memory).with_capabilities(["lookup"]),
            ])
        });

        let mut config = MeshConfig::default();
        config.discovery.interval = Duration::from_secs(3600);
        let client = MeshClient::new(config)
            .unwrap()
            .with_connector(connector)
            .with_discovery(source);

        let report = client.sweep_discovery().await.unwrap();
        assert_eq!(report.added, vec!["found".to_string()]);
        assert!(client.pool_stats("found").is_some());

        let done = client
            .execute_capability("lookup", Arguments::new(), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(done.result.text_content(), "ok");
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() {
        let connector = InMemoryConnector::new().with_server("a", InMemoryServer::new("a"));
        let client = client_with(connector, &[("a", &["echo"])]);
        client.start().await.unwrap();

        client.shutdown().await;
        client.shutdown().await;

        assert!(client.is_shut_down());
        assert!(matches!(client.start().await, Err(MeshError::ShutDown)));
        assert!(matches!(
            client
                .execute_capability("echo", Arguments::new(), &CallOptions::new())
                .await,
            Err(MeshError::ShutDown)
        ));
        assert!(client.pool_stats("a").is_none());
        assert_eq!(client.server("a").unwrap().status, ServerStatus::Disconnected);
    }
}
