//! Per-server connection pools
//!
//! Each server gets a [`ServerPool`] holding between `min` and `max` live
//! connections. Callers take an exclusive [`ConnectionLease`]; a semaphore
//! with `max` permits bounds concurrent leases while a separate slot count
//! bounds live connections, so health checks and acquirers can never open
//! more than `max` between them.
//!
//! A background task per pool pings idle connections, evicts those idle for
//! too long and tops the pool back up to `min`.

use crate::Result;
use crate::config::{PoolConfig, ServerAddress};
use crate::connection::Connection;
use crate::error::MeshError;
use crate::events::{CloseReason, EventBus, MeshEvent};
use crate::registry::{ServerRegistry, ServerStatus};
use crate::retry::RetryPolicy;
use crate::transport::{Arguments, CapabilityResult, Connector, ToolDescriptor};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time view of one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub server_id: String,
    pub live: usize,
    pub idle: usize,
    pub busy: usize,
    pub connecting: usize,
    pub min: usize,
    pub max: usize,
    pub healthy: bool,
}

/// Connections for one server
pub struct ServerPool {
    server_id: String,
    address: ServerAddress,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<ServerRegistry>,
    events: Arc<EventBus>,
    idle: Mutex<VecDeque<Connection>>,
    permits: Arc<Semaphore>,
    /// Open or opening connections
    live: AtomicUsize,
    connecting: AtomicUsize,
    busy: AtomicUsize,
    returned: Notify,
    healthy: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    next_id: Arc<AtomicU64>,
}

/// Claim on one unit of `live`, released unless committed
struct Slot<'a> {
    pool: &'a ServerPool,
    committed: bool,
}

impl Slot<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.live.fetch_sub(1, Ordering::SeqCst);
            self.pool.returned.notify_one();
        }
    }
}

/// Counts an in-progress connect, decremented even if the connect is dropped
struct Connecting<'a>(&'a AtomicUsize);

impl<'a> Connecting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Connecting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ServerPool {
    fn reserve_slot(&self) -> Option<Slot<'_>> {
        let max = self.config.max_connections;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .ok()
            .map(|_| Slot {
                pool: self,
                committed: false,
            })
    }

    async fn open_connection(&self) -> Result<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connecting = Connecting::enter(&self.connecting);
        let result = tokio::time::timeout(
            self.config.connect_timeout,
            Connection::open(id, &self.server_id, &self.address, self.connector.as_ref()),
        )
        .await;
        drop(connecting);

        match result {
            Ok(Ok(conn)) => {
                debug!(server_id = %self.server_id, connection_id = id, "Connection created");
                self.events.emit(MeshEvent::ConnectionCreated {
                    server_id: self.server_id.clone(),
                    connection_id: id,
                });
                self.registry
                    .update_status(&self.server_id, ServerStatus::Connected);
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MeshError::transport(
                &self.server_id,
                format!("connect timed out after {:?}", self.config.connect_timeout),
            )),
        }
    }

    /// Reserve a slot and open a connection into it
    async fn grow(&self) -> Option<Result<Connection>> {
        let slot = self.reserve_slot()?;
        let result = self.open_connection().await;
        if result.is_ok() {
            slot.commit();
        }
        Some(result)
    }

    fn take_idle(&self) -> Option<Connection> {
        // Most recently used first, so surplus connections age out.
        self.idle.lock().pop_back()
    }

    fn checkin(&self, mut conn: Connection) {
        if self.closed.load(Ordering::SeqCst) || !conn.is_reusable() {
            self.retire(conn, CloseReason::Broken);
            return;
        }
        if let Err(e) = conn.mark_ready() {
            debug!(server_id = %self.server_id, "Dropping connection in unexpected state: {}", e);
            self.retire(conn, CloseReason::Broken);
            return;
        }
        self.idle.lock().push_back(conn);
        self.returned.notify_one();
    }

    /// Remove a connection from the pool and close it in the background
    fn retire(&self, mut conn: Connection, reason: CloseReason) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.returned.notify_one();

        let connection_id = conn.id();
        debug!(server_id = %self.server_id, connection_id, ?reason, "Connection closed");
        self.events.emit(MeshEvent::ConnectionClosed {
            server_id: self.server_id.clone(),
            connection_id,
            reason,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { conn.close().await });
            }
            // No runtime: dropping the transport releases it.
            Err(_) => drop(conn),
        }
    }

    async fn acquire(self: &Arc<Self>) -> Result<ConnectionLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::PoolClosed(self.server_id.clone()));
        }

        let wait = self.config.wait_timeout;
        let deadline = Instant::now() + wait;
        let exhausted = || MeshError::PoolExhausted {
            server_id: self.server_id.clone(),
            waited: wait,
        };

        let permit = match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(MeshError::PoolClosed(self.server_id.clone())),
            Err(_) => return Err(exhausted()),
        };

        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(MeshError::PoolClosed(self.server_id.clone()));
            }

            if let Some(conn) = self.take_idle() {
                return self.lease(conn, permit);
            }

            match self.grow().await {
                Some(Ok(conn)) => return self.lease(conn, permit),
                Some(Err(e)) => {
                    warn!(server_id = %self.server_id, "Failed to open connection: {}", e);
                    return Err(e);
                }
                // At max with every connection out (health check or
                // close in progress): wait for one to come back.
                None => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(exhausted());
            }
        }
    }

    fn lease(self: &Arc<Self>, mut conn: Connection, permit: OwnedSemaphorePermit) -> Result<ConnectionLease> {
        if let Err(e) = conn.mark_busy() {
            self.retire(conn, CloseReason::Broken);
            return Err(e);
        }
        self.busy.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectionLease {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        })
    }

    /// One health pass: evict stale idle connections, ping the rest and
    /// replenish to `min`
    pub async fn run_health_check(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut candidates: Vec<Connection> = self.idle.lock().drain(..).collect();
        candidates.sort_by_key(|c| std::cmp::Reverse(c.idle_for()));

        let mut evictable = self
            .live
            .load(Ordering::SeqCst)
            .saturating_sub(self.config.min_connections);
        let mut to_ping = Vec::with_capacity(candidates.len());
        for conn in candidates {
            if evictable > 0 && conn.idle_for() > self.config.idle_timeout {
                evictable -= 1;
                self.retire(conn, CloseReason::IdleEvicted);
            } else {
                to_ping.push(conn);
            }
        }

        let ping_timeout = self.config.ping_timeout;
        let pinged = to_ping.len();
        let results = join_all(to_ping.into_iter().map(|mut conn| async move {
            let ok = matches!(
                tokio::time::timeout(ping_timeout, conn.ping()).await,
                Ok(Ok(()))
            );
            (conn, ok)
        }))
        .await;

        let mut alive = 0;
        for (conn, ok) in results {
            if self.closed.load(Ordering::SeqCst) {
                // Closed while pinging: shutdown never saw these.
                self.retire(conn, CloseReason::Shutdown);
            } else if ok {
                alive += 1;
                self.idle.lock().push_back(conn);
                self.returned.notify_one();
            } else {
                warn!(server_id = %self.server_id, connection_id = conn.id(), "Health ping failed");
                self.retire(conn, CloseReason::HealthCheckFailed);
            }
        }
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let was_healthy = self.healthy.load(Ordering::SeqCst);
        let target = if was_healthy {
            self.config.min_connections
        } else {
            self.config.min_connections.max(1)
        };

        let mut opened = 0;
        let mut replenish_failed = false;
        while self.live.load(Ordering::SeqCst) < target && !self.closed.load(Ordering::SeqCst) {
            match self.grow().await {
                Some(Ok(conn)) => {
                    opened += 1;
                    self.idle.lock().push_back(conn);
                    self.returned.notify_one();
                }
                Some(Err(e)) => {
                    warn!(server_id = %self.server_id, "Failed to replenish pool: {}", e);
                    replenish_failed = true;
                    break;
                }
                None => break,
            }
        }

        let all_pings_failed = pinged > 0 && alive == 0 && opened == 0;
        let empty_and_unreachable = replenish_failed && self.live.load(Ordering::SeqCst) == 0;
        let healthy = !(all_pings_failed || empty_and_unreachable);

        self.healthy.store(healthy, Ordering::SeqCst);
        if healthy != was_healthy {
            info!(server_id = %self.server_id, healthy, "Pool health changed");
        }

        if healthy && self.live.load(Ordering::SeqCst) > 0 {
            self.registry.update_status(&self.server_id, ServerStatus::Connected);
        } else if !healthy {
            self.registry.update_status(&self.server_id, ServerStatus::Error);
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.permits.close();
        self.returned.notify_waiters();

        let idle: Vec<Connection> = self.idle.lock().drain(..).collect();
        for mut conn in idle {
            self.live.fetch_sub(1, Ordering::SeqCst);
            let connection_id = conn.id();
            conn.close().await;
            self.events.emit(MeshEvent::ConnectionClosed {
                server_id: self.server_id.clone(),
                connection_id,
                reason: CloseReason::Shutdown,
            });
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            server_id: self.server_id.clone(),
            live: self.live.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            busy: self.busy.load(Ordering::SeqCst),
            connecting: self.connecting.load(Ordering::SeqCst),
            min: self.config.min_connections,
            max: self.config.max_connections,
            healthy: self.is_healthy(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Exclusive use of one connection
///
/// Dropping the lease returns the connection to the pool. If a request
/// was still awaiting its response, or the transport failed, the
/// connection is retired instead.
pub struct ConnectionLease {
    conn: Option<Connection>,
    pool: Arc<ServerPool>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    fn connection(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| MeshError::PoolClosed(self.pool.server_id.clone()))
    }

    pub fn server_id(&self) -> &str {
        &self.pool.server_id
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(Connection::id)
    }

    pub async fn invoke(&mut self, capability: &str, args: &Arguments) -> Result<CapabilityResult> {
        self.connection()?.invoke(capability, args).await
    }

    pub async fn describe(&mut self) -> Result<Vec<ToolDescriptor>> {
        self.connection()?.describe().await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.connection()?.ping().await
    }

    /// Return the connection to the pool now
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.retire(conn, CloseReason::Broken);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.busy.fetch_sub(1, Ordering::SeqCst);
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("server_id", &self.pool.server_id)
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

/// All pools of one client
pub struct ConnectionPool {
    pools: RwLock<HashMap<String, Arc<ServerPool>>>,
    connector: Arc<dyn Connector>,
    registry: Arc<ServerRegistry>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
    next_id: Arc<AtomicU64>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<ServerRegistry>,
        events: Arc<EventBus>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            connector,
            registry,
            events,
            retry,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn get(&self, server_id: &str) -> Option<Arc<ServerPool>> {
        self.pools.read().get(server_id).cloned()
    }

    /// Create a pool and eagerly open its `min` connections
    ///
    /// Each minimum connection gets the full connect retry budget; if any
    /// still fails, everything opened so far is closed and
    /// [`MeshError::PoolCreation`] is returned.
    pub async fn create_pool(
        &self,
        server_id: &str,
        address: ServerAddress,
        config: PoolConfig,
    ) -> Result<()> {
        if self.pools.read().contains_key(server_id) {
            return Err(MeshError::DuplicateServer(server_id.to_string()));
        }
        if config.max_connections == 0 || config.min_connections > config.max_connections {
            return Err(MeshError::Config(format!(
                "invalid pool size for {server_id}: min {} max {}",
                config.min_connections, config.max_connections
            )));
        }

        info!(
            server_id = %server_id,
            address = %address.describe(),
            min = config.min_connections,
            max = config.max_connections,
            "Creating connection pool"
        );
        if config.min_connections > 0 {
            self.registry
                .update_status(server_id, ServerStatus::Connecting);
        }

        let pool = Arc::new(ServerPool {
            server_id: server_id.to_string(),
            address,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config,
            connector: self.connector.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            connecting: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            returned: Notify::new(),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            next_id: self.next_id.clone(),
        });

        let label = format!("connect to {server_id}");
        for _ in 0..pool.config.min_connections {
            let pool_ref = &pool;
            let opened = self
                .retry
                .execute(&label, move || async move {
                    pool_ref.grow().await.unwrap_or_else(|| {
                        Err(MeshError::Config(format!("pool for {server_id} is full")))
                    })
                })
                .await;

            match opened {
                Ok(conn) => pool.idle.lock().push_back(conn),
                Err(e) => {
                    pool.shutdown().await;
                    self.registry.update_status(server_id, ServerStatus::Error);
                    return Err(MeshError::PoolCreation {
                        server_id: server_id.to_string(),
                        attempts: self.retry.max_attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let inserted = {
            let mut pools = self.pools.write();
            if pools.contains_key(server_id) {
                false
            } else {
                pools.insert(server_id.to_string(), pool.clone());
                true
            }
        };
        if !inserted {
            pool.shutdown().await;
            return Err(MeshError::DuplicateServer(server_id.to_string()));
        }

        spawn_health_loop(&pool);
        Ok(())
    }

    /// Lease a connection, waiting up to the pool's wait timeout
    pub async fn acquire(&self, server_id: &str) -> Result<ConnectionLease> {
        let pool = self
            .get(server_id)
            .ok_or_else(|| MeshError::PoolClosed(server_id.to_string()))?;
        pool.acquire().await
    }

    /// Hand a lease back; same as dropping it
    pub fn release(&self, lease: ConnectionLease) {
        lease.release();
    }

    /// Run one health pass for a server now
    pub async fn run_health_check(&self, server_id: &str) -> Result<()> {
        let pool = self
            .get(server_id)
            .ok_or_else(|| MeshError::PoolClosed(server_id.to_string()))?;
        pool.run_health_check().await;
        Ok(())
    }

    /// Close a server's pool; returns `false` if there was none
    pub async fn close_pool(&self, server_id: &str) -> bool {
        let Some(pool) = self.pools.write().remove(server_id) else {
            return false;
        };
        pool.shutdown().await;
        self.registry
            .update_status(server_id, ServerStatus::Disconnected);
        info!(server_id = %server_id, "Closed connection pool");
        true
    }

    pub async fn close_all(&self) {
        let pools: Vec<Arc<ServerPool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        join_all(pools.iter().map(|p| p.shutdown())).await;
        for pool in &pools {
            self.registry
                .update_status(&pool.server_id, ServerStatus::Disconnected);
        }
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.pools.read().contains_key(server_id)
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self, server_id: &str) -> Option<PoolStats> {
        self.get(server_id).map(|p| p.stats())
    }

    pub fn is_healthy(&self, server_id: &str) -> bool {
        self.get(server_id).is_some_and(|p| p.is_healthy())
    }

    pub fn busy_count(&self, server_id: &str) -> usize {
        self.get(server_id).map_or(0, |p| p.busy_count())
    }
}

fn spawn_health_loop(pool: &Arc<ServerPool>) {
    let weak: Weak<ServerPool> = Arc::downgrade(pool);
    let cancel = pool.cancel.clone();
    let period = pool.config.health_check_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.run_health_check().await;
                }
            }
        }
    });
}
