//! Request routing and failover
//!
//! The router intersects three views of the world (who offers the
//! capability, whose pool is healthy, whose circuit admits traffic), lets
//! the balancer order the survivors and then walks that order until one
//! attempt succeeds or the retry budget runs out. Every attempt outcome is
//! fed back into the registry and the circuit breaker.

use crate::Result;
use crate::balancer::{Candidate, LoadBalancer, LoadBalancingPolicy};
use crate::breaker::CircuitBreaker;
use crate::config::RouterConfig;
use crate::error::{AttemptFailure, MeshError};
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;
use crate::transport::{Arguments, CapabilityResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a capability-matching server was left out of a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionReason {
    NoPool,
    Unhealthy,
    CircuitOpen,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoPool => "no pool",
            Self::Unhealthy => "unhealthy",
            Self::CircuitOpen => "circuit open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub server_id: String,
    pub reason: ExclusionReason,
}

/// How a decision was reached
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRationale {
    pub policy: LoadBalancingPolicy,
    /// Servers offering the capability before filtering
    pub matched: usize,
    pub excluded: Vec<Exclusion>,
    /// `1 - error_rate` of the chosen server
    pub health_score: f64,
    pub ema_latency_ms: Option<f64>,
}

/// Chosen server plus ordered fallbacks for one request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub capability: String,
    pub server_id: String,
    pub fallbacks: Vec<String>,
    pub rationale: RoutingRationale,
}

impl RoutingDecision {
    /// Chosen server followed by the fallbacks
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.server_id.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// Per-call knobs shared by every façade operation
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Per-attempt timeout, defaults to the configured request timeout
    pub timeout: Option<Duration>,
    /// Absolute bound on the whole call
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
    pub policy: Option<LoadBalancingPolicy>,
    pub max_retries: Option<u32>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_policy(mut self, policy: LoadBalancingPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Attempt timeout clipped to the remaining deadline
    pub(crate) fn attempt_timeout(&self, default: Duration) -> Result<Duration> {
        let timeout = self.timeout.unwrap_or(default);
        match self.deadline {
            None => Ok(timeout),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    Err(MeshError::Cancelled("deadline exceeded".to_string()))
                } else {
                    Ok(timeout.min(remaining))
                }
            }
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(MeshError::Cancelled("cancelled by caller".to_string()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(MeshError::Cancelled("deadline exceeded".to_string()));
        }
        Ok(())
    }
}

/// Successful attempt on one server
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub server_id: String,
    pub result: CapabilityResult,
    pub latency: Duration,
}

/// Outcome of a single-server attempt
pub type DispatchOutcome = std::result::Result<Dispatched, AttemptFailure>;

/// Result of a routed call
#[derive(Debug)]
pub struct Execution {
    pub server_id: String,
    pub result: CapabilityResult,
    pub latency: Duration,
    /// Failed attempts on earlier candidates
    pub failed_attempts: Vec<AttemptFailure>,
}

/// Releases a half-open trial unless an outcome was recorded
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    server_id: &'a str,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon_trial(self.server_id);
        }
    }
}

pub struct Router {
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    balancer: LoadBalancer,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        breaker: Arc<CircuitBreaker>,
        balancer: LoadBalancer,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            breaker,
            balancer,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Pick a server for `capability`
    ///
    /// Uses side-effect-free circuit checks, so a half-open trial is only
    /// claimed when a request is actually dispatched.
    pub fn route(&self, capability: &str, policy: Option<LoadBalancingPolicy>) -> Result<RoutingDecision> {
        let policy = policy.unwrap_or(self.config.policy);
        let matches = self.registry.list_by_capability(capability);
        if matches.is_empty() {
            return Err(MeshError::NoAvailableServer {
                capability: capability.to_string(),
                reason: "no registered server offers it".to_string(),
            });
        }

        let matched = matches.len();
        let mut excluded = Vec::new();
        let mut candidates = Vec::with_capacity(matched);
        for record in matches {
            let reason = if !self.pool.contains(&record.id) {
                Some(ExclusionReason::NoPool)
            } else if !self.pool.is_healthy(&record.id) {
                Some(ExclusionReason::Unhealthy)
            } else if !self.breaker.is_available(&record.id) {
                Some(ExclusionReason::CircuitOpen)
            } else {
                None
            };

            match reason {
                Some(reason) => excluded.push(Exclusion {
                    server_id: record.id,
                    reason,
                }),
                None => candidates.push(Candidate {
                    busy: self.pool.busy_count(&record.id),
                    ema_latency_ms: record.ema_latency_ms,
                    error_rate: record.error_rate(),
                    server_id: record.id,
                }),
            }
        }

        let Some(selection) = self.balancer.select(policy, candidates) else {
            let detail = excluded
                .iter()
                .map(|e| format!("{} ({})", e.server_id, e.reason))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(MeshError::NoAvailableServer {
                capability: capability.to_string(),
                reason: format!("all {matched} candidate(s) excluded: {detail}"),
            });
        };

        let decision = RoutingDecision {
            capability: capability.to_string(),
            server_id: selection.chosen.server_id.clone(),
            fallbacks: selection
                .fallbacks
                .into_iter()
                .map(|c| c.server_id)
                .collect(),
            rationale: RoutingRationale {
                policy,
                matched,
                excluded,
                health_score: 1.0 - selection.chosen.error_rate,
                ema_latency_ms: selection.chosen.ema_latency_ms,
            },
        };

        debug!(
            capability,
            server_id = %decision.server_id,
            fallbacks = decision.fallbacks.len(),
            policy = %policy,
            "Routed request"
        );
        Ok(decision)
    }

    /// Route and run a call, failing over to the next candidate on
    /// retryable errors
    ///
    /// Each candidate is tried at most once; at most `1 + max_retries`
    /// attempts are made.
    pub async fn execute(
        &self,
        capability: &str,
        args: &Arguments,
        options: &CallOptions,
    ) -> Result<Execution> {
        options.check_cancelled()?;
        let decision = self.route(capability, options.policy)?;
        let max_attempts = 1 + options.max_retries.unwrap_or(self.config.max_retries) as usize;

        let mut order: VecDeque<String> = decision.candidates().map(str::to_string).collect();
        let mut failures: Vec<AttemptFailure> = Vec::new();

        while failures.len() < max_attempts {
            let Some(server_id) = order.pop_front() else {
                break;
            };
            options.check_cancelled()?;
            // Before admission, which may hand out the half-open trial.
            let deadline = Instant::now() + options.attempt_timeout(self.config.request_timeout)?;

            if !self.breaker.is_request_allowed(&server_id) {
                debug!(capability, server_id = %server_id, "Circuit refused request, skipping");
                continue;
            }

            match self
                .attempt(&server_id, capability, args, deadline, options.cancel.as_ref())
                .await
            {
                Ok(done) => {
                    if !failures.is_empty() {
                        info!(
                            capability,
                            server_id = %done.server_id,
                            attempt = failures.len() + 1,
                            "Request succeeded after failover"
                        );
                    }
                    return Ok(Execution {
                        server_id: done.server_id,
                        result: done.result,
                        latency: done.latency,
                        failed_attempts: failures,
                    });
                }
                Err(failure) => {
                    if let MeshError::Cancelled(reason) = &failure.error {
                        return Err(MeshError::Cancelled(reason.clone()));
                    }
                    let retryable = failure.error.is_retryable();
                    failures.push(failure);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        if failures.is_empty() {
            return Err(MeshError::NoAvailableServer {
                capability: capability.to_string(),
                reason: "every candidate's circuit refused the request".to_string(),
            });
        }

        warn!(capability, attempts = failures.len(), "Request failed on every attempt");
        Err(MeshError::RequestFailed {
            capability: capability.to_string(),
            attempts: failures,
        })
    }

    /// One attempt on a specific server bounded by `deadline`, including
    /// circuit admission
    ///
    /// Fanout gives every dispatch the aggregator's deadline, so a dispatch
    /// still running when the fanout times out records its own timeout.
    pub async fn dispatch_until(
        &self,
        server_id: &str,
        capability: &str,
        args: &Arguments,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> DispatchOutcome {
        if !self.breaker.is_request_allowed(server_id) {
            return Err(AttemptFailure::new(
                server_id,
                Duration::ZERO,
                MeshError::NoAvailableServer {
                    capability: capability.to_string(),
                    reason: format!("circuit open for {server_id}"),
                },
            ));
        }
        self.attempt(server_id, capability, args, deadline, cancel)
            .await
    }

    async fn attempt(
        &self,
        server_id: &str,
        capability: &str,
        args: &Arguments,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> DispatchOutcome {
        let mut trial = TrialGuard {
            breaker: &self.breaker,
            server_id,
            settled: false,
        };
        let started = Instant::now();

        let send = async {
            match tokio::time::timeout_at(deadline, self.send(server_id, capability, args)).await {
                Ok(result) => result,
                Err(_) => Err(MeshError::RequestTimeout {
                    server_id: server_id.to_string(),
                    timeout: deadline.saturating_duration_since(started),
                }),
            }
        };
        let outcome = match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(MeshError::Cancelled("cancelled by caller".to_string())),
                result = send => result,
            },
            None => send.await,
        };
        let latency = started.elapsed();
        let latency_ms = latency.as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                self.feedback(server_id, true, latency);
                trial.settled = true;
                debug!(capability, server_id = %server_id, latency_ms, "Attempt succeeded");
                Ok(Dispatched {
                    server_id: server_id.to_string(),
                    result,
                    latency,
                })
            }
            Err(error) => {
                if error.counts_as_server_failure() {
                    self.feedback(server_id, false, latency);
                    trial.settled = true;
                }
                warn!(capability, server_id = %server_id, latency_ms, "Attempt failed: {}", error);
                Err(AttemptFailure::new(server_id, latency, error))
            }
        }
    }

    async fn send(&self, server_id: &str, capability: &str, args: &Arguments) -> Result<CapabilityResult> {
        let mut lease = self.pool.acquire(server_id).await?;
        lease.invoke(capability, args).await
    }

    fn feedback(&self, server_id: &str, success: bool, latency: Duration) {
        if let Err(e) = self.registry.record_outcome(server_id, success, latency) {
            debug!(server_id = %server_id, "Outcome not recorded: {}", e);
        }
        if success {
            self.breaker.record_success(server_id);
        } else {
            self.breaker.record_failure(server_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::config::{BreakerConfig, PoolConfig, RegistryConfig, ServerAddress};
    use crate::events::EventBus;
    use crate::random::SharedRng;
    use crate::registry::ServerRecord;
    use crate::retry::RetryPolicy;
    use crate::transport::{InMemoryConnector, InMemoryServer};

    struct Fixture {
        router: Router,
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        breaker: Arc<CircuitBreaker>,
        connector: InMemoryConnector,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ServerRegistry::new(RegistryConfig::default(), events.clone()));
        let connector = InMemoryConnector::new();
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(connector.clone()),
            registry.clone(),
            events.clone(),
            RetryPolicy::no_retry(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), events));
        let router = Router::new(
            registry.clone(),
            pool.clone(),
            breaker.clone(),
            LoadBalancer::new(SharedRng::seeded(11)),
            RouterConfig {
                policy: LoadBalancingPolicy::RoundRobin,
                request_timeout: Duration::from_millis(200),
                ..RouterConfig::default()
            },
        );
        Fixture {
            router,
            registry,
            pool,
            breaker,
            connector,
        }
    }

    impl Fixture {
        async fn add(&self, id: &str, server: InMemoryServer, caps: &[&str]) {
            self.connector.insert(id, server);
            self.registry
                .register(ServerRecord::new(id, ServerAddress::Memory).with_capabilities(caps.iter().copied()))
                .unwrap();
            let config = PoolConfig {
                health_check_interval: Duration::from_secs(3600),
                wait_timeout: Duration::from_millis(50),
                ..PoolConfig::sized(1, 2)
            };
            self.pool
                .create_pool(id, ServerAddress::Memory, config)
                .await
                .unwrap();
        }
    }

    fn failing(name: &str) -> InMemoryServer {
        InMemoryServer::new(name).with_tool("search", |_| {
            Err(MeshError::Protocol {
                code: -32000,
                message: "backend down".into(),
            })
        })
    }

    #[tokio::test]
    async fn test_route_without_match() {
        let f = fixture();
        let err = f.router.route("search", None).unwrap_err();
        assert!(matches!(err, MeshError::NoAvailableServer { .. }));
    }

    #[tokio::test]
    async fn test_route_excludes_open_circuit_and_missing_pool() {
        let f = fixture();
        f.add("a", InMemoryServer::new("a").with_text_tool("search", "a"), &["search"])
            .await;
        f.add("b", InMemoryServer::new("b").with_text_tool("search", "b"), &["search"])
            .await;
        f.registry
            .register(ServerRecord::new("c", ServerAddress::Memory).with_capabilities(["search"]))
            .unwrap();
        for _ in 0..5 {
            f.breaker.record_failure("b");
        }

        let decision = f.router.route("search", None).unwrap();
        assert_eq!(decision.server_id, "a");
        assert!(decision.fallbacks.is_empty());
        assert_eq!(decision.rationale.matched, 3);
        assert_eq!(
            decision.rationale.excluded,
            vec![
                Exclusion {
                    server_id: "b".into(),
                    reason: ExclusionReason::CircuitOpen
                },
                Exclusion {
                    server_id: "c".into(),
                    reason: ExclusionReason::NoPool
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_fails_over_and_reports_every_attempt() {
        let f = fixture();
        f.add("a", failing("a"), &["search"]).await;
        f.add("b", InMemoryServer::new("b").with_text_tool("search", "from b"), &["search"])
            .await;

        // Round-robin starts at "a".
        let done = f
            .router
            .execute("search", &Arguments::new(), &CallOptions::new())
            .await
            .unwrap();

        assert_eq!(done.server_id, "b");
        assert_eq!(done.result.text_content(), "from b");
        assert_eq!(done.failed_attempts.len(), 1);
        assert_eq!(done.failed_attempts[0].server_id, "a");

        assert_eq!(f.registry.get("a").unwrap().error_count, 1);
        assert_eq!(f.registry.get("b").unwrap().success_count, 1);
        assert_eq!(f.breaker.stats("a").unwrap().window_failures, 1);
    }

    #[tokio::test]
    async fn test_execute_respects_max_retries() {
        let f = fixture();
        for id in ["a", "b", "c", "d"] {
            f.add(id, failing(id), &["search"]).await;
        }

        let err = f
            .router
            .execute(
                "search",
                &Arguments::new(),
                &CallOptions::new().with_max_retries(2),
            )
            .await
            .unwrap_err();

        match err {
            MeshError::RequestFailed { attempts, .. } => assert_eq!(attempts.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_params_is_not_retried() {
        let f = fixture();
        // "a" has no such tool: the peer answers invalid params.
        f.add("a", InMemoryServer::new("a"), &["search"]).await;
        f.add("b", InMemoryServer::new("b").with_text_tool("search", "b"), &["search"])
            .await;

        let err = f
            .router
            .execute("search", &Arguments::new(), &CallOptions::new())
            .await
            .unwrap_err();
        match err {
            MeshError::RequestFailed { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert!(matches!(attempts[0].error, MeshError::Protocol { code: -32602, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // not the server's fault
        assert_eq!(f.breaker.stats("a").map_or(0, |s| s.window_failures), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_and_counts_as_failure() {
        let f = fixture();
        let slow = InMemoryServer::new("a").with_text_tool("search", "late");
        f.add("a", slow.clone(), &["search"]).await;
        slow.set_latency(Duration::from_millis(500));

        let err = f
            .router
            .execute(
                "search",
                &Arguments::new(),
                &CallOptions::new().with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(f.registry.get("a").unwrap().error_count, 1);
        // the abandoned connection is not reused
        assert_eq!(f.pool.stats("a").unwrap().idle, 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let f = fixture();
        let slow = InMemoryServer::new("a").with_text_tool("search", "late");
        f.add("a", slow.clone(), &["search"]).await;
        slow.set_latency(Duration::from_millis(500));

        let token = CancellationToken::new();
        let options = CallOptions::new().with_cancel(token.clone());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let args = Arguments::new();
        let (result, ()) = tokio::join!(f.router.execute("search", &args, &options), cancel);

        assert!(matches!(result, Err(MeshError::Cancelled(_))));
        assert_eq!(f.registry.get("a").unwrap().total_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_is_claimed_only_on_dispatch() {
        let f = fixture();
        f.add("a", InMemoryServer::new("a").with_text_tool("search", "ok"), &["search"])
            .await;
        for _ in 0..5 {
            f.breaker.record_failure("a");
        }
        assert!(f.router.route("search", None).is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        // routing twice does not use up the trial
        f.router.route("search", None).unwrap();
        f.router.route("search", None).unwrap();
        assert_eq!(f.breaker.state("a"), CircuitState::Open);

        let done = f
            .router
            .execute("search", &Arguments::new(), &CallOptions::new())
            .await
            .unwrap();
        assert_eq!(done.server_id, "a");
        assert_eq!(f.breaker.state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_leaves_half_open_trial_unclaimed() {
        let f = fixture();
        let slow = InMemoryServer::new("a").with_text_tool("search", "late");
        f.add("a", slow.clone(), &["search"]).await;
        slow.set_latency(Duration::from_millis(500));
        f.add("b", InMemoryServer::new("b").with_text_tool("search", "b"), &["search"])
            .await;
        for _ in 0..5 {
            f.breaker.record_failure("b");
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        // "a" uses up the whole deadline before "b" gets its turn.
        let options = CallOptions::new().with_deadline(Instant::now() + Duration::from_millis(100));
        let err = f
            .router
            .execute("search", &Arguments::new(), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, MeshError::Cancelled(_)));
        assert_eq!(f.registry.get("a").unwrap().error_count, 1);
        let stats = f.breaker.stats("b").unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(!stats.trial_in_flight);
        assert!(f.breaker.is_available("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_until_records_timeout_at_deadline() {
        let f = fixture();
        let slow = InMemoryServer::new("a").with_text_tool("search", "late");
        f.add("a", slow.clone(), &["search"]).await;
        slow.set_latency(Duration::from_millis(500));

        let deadline = Instant::now() + Duration::from_millis(50);
        let failure = f
            .router
            .dispatch_until("a", "search", &Arguments::new(), deadline, None)
            .await
            .unwrap_err();

        assert!(failure.error.is_timeout());
        assert!(Instant::now() >= deadline);
        assert_eq!(f.registry.get("a").unwrap().error_count, 1);
        assert_eq!(f.breaker.stats("a").unwrap().window_failures, 1);
    }

    #[test]
    fn test_attempt_timeout_clipped_by_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let options = CallOptions::new()
                .with_deadline(Instant::now() + Duration::from_millis(100));
            assert_eq!(
                options.attempt_timeout(Duration::from_secs(30)).unwrap(),
                Duration::from_millis(100)
            );

            tokio::time::advance(Duration::from_millis(100)).await;
            assert!(matches!(
                options.attempt_timeout(Duration::from_secs(30)),
                Err(MeshError::Cancelled(_))
            ));
        });
    }
}
