//! Fanout result aggregation
//!
//! Drives a set of per-server dispatches concurrently and combines their
//! outcomes according to a [`FanoutPolicy`].

use crate::Result;
use crate::error::{AttemptFailure, MeshError};
use crate::router::DispatchOutcome;
use crate::transport::{CapabilityResult, Content};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Scores a successful result; higher is better
pub type Scorer = Arc<dyn Fn(&CapabilityResult) -> f64 + Send + Sync>;

/// How concurrent outcomes are combined
#[derive(Clone, Default)]
pub enum FanoutPolicy {
    /// Return on the first success and cancel the rest
    FirstSuccess,
    /// Wait for every dispatch
    #[default]
    All,
    /// Wait for every dispatch and select the highest-scoring success;
    /// behaves like `All` without a scorer
    BestOf(Option<Scorer>),
}

impl FanoutPolicy {
    pub fn best_of<F>(scorer: F) -> Self
    where
        F: Fn(&CapabilityResult) -> f64 + Send + Sync + 'static,
    {
        Self::BestOf(Some(Arc::new(scorer)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstSuccess => "first-success",
            Self::All => "all",
            Self::BestOf(_) => "best-of",
        }
    }
}

impl fmt::Debug for FanoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestOf(scorer) => f
                .debug_tuple("BestOf")
                .field(&scorer.as_ref().map(|_| "<scorer>"))
                .finish(),
            other => f.write_str(other.as_str()),
        }
    }
}

impl fmt::Display for FanoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanoutPolicy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first-success" | "first" => Ok(Self::FirstSuccess),
            "all" => Ok(Self::All),
            "best-of" | "best" => Ok(Self::BestOf(None)),
            other => Err(MeshError::Config(format!("unknown fanout policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSuccess {
    pub server_id: String,
    pub result: CapabilityResult,
    pub latency: Duration,
    /// Set by `best-of` when a scorer is given
    pub score: Option<f64>,
}

/// Per-server outcomes of one fanout call
#[derive(Debug)]
pub struct AggregatedResult {
    pub capability: String,
    /// Successes in completion order
    pub successes: Vec<ServerSuccess>,
    pub failures: Vec<AttemptFailure>,
    /// Servers whose dispatch was abandoned after a `first-success` win
    pub cancelled: Vec<String>,
    /// Index into `successes` of the policy's pick
    pub selected: Option<usize>,
}

impl AggregatedResult {
    /// The success picked by the policy, or the first one
    pub fn best(&self) -> Option<&ServerSuccess> {
        self.selected
            .and_then(|i| self.successes.get(i))
            .or_else(|| self.successes.first())
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Content blocks of every success, duplicates removed, starting with
    /// the selected result
    pub fn merged_content(&self) -> Vec<Content> {
        let ordered = self
            .best()
            .into_iter()
            .chain(self.successes.iter())
            .flat_map(|s| s.result.content.iter());

        let mut merged: Vec<Content> = Vec::new();
        for block in ordered {
            if !merged.contains(block) {
                merged.push(block.clone());
            }
        }
        merged
    }
}

/// Runs fanout dispatches under a global timeout
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl ResultAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// End the fanout at `deadline` instead of `timeout` after it starts
    ///
    /// Dispatches sharing this deadline time out no later than the
    /// aggregator does, so their own timeout outcomes are collected.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive `dispatches` concurrently and combine them under `policy`
    ///
    /// Fails with [`MeshError::Aggregation`] only when nothing succeeded.
    pub async fn aggregate<F>(
        &self,
        capability: &str,
        dispatches: Vec<(String, F)>,
        policy: &FanoutPolicy,
    ) -> Result<AggregatedResult>
    where
        F: Future<Output = DispatchOutcome>,
    {
        let started = Instant::now();
        let deadline = self.deadline.unwrap_or(started + self.timeout);

        let mut pending: BTreeMap<usize, String> = BTreeMap::new();
        let mut running = FuturesUnordered::new();
        for (index, (server_id, dispatch)) in dispatches.into_iter().enumerate() {
            pending.insert(index, server_id);
            running.push(async move { (index, dispatch.await) });
        }

        let mut aggregated = AggregatedResult {
            capability: capability.to_string(),
            successes: Vec::new(),
            failures: Vec::new(),
            cancelled: Vec::new(),
            selected: None,
        };

        loop {
            let polled = tokio::time::timeout_at(deadline, running.next()).await;
            let next = match polled {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    // Whatever is still running has run out of time.
                    drop(running);
                    for (_, server_id) in std::mem::take(&mut pending) {
                        aggregated.failures.push(AttemptFailure::new(
                            server_id.clone(),
                            started.elapsed(),
                            MeshError::RequestTimeout {
                                server_id,
                                timeout: self.timeout,
                            },
                        ));
                    }
                    break;
                }
            };

            let (index, outcome) = next;
            pending.remove(&index);
            match outcome {
                Ok(done) => {
                    aggregated.successes.push(ServerSuccess {
                        server_id: done.server_id,
                        result: done.result,
                        latency: done.latency,
                        score: None,
                    });
                    if matches!(policy, FanoutPolicy::FirstSuccess) {
                        drop(running);
                        aggregated.cancelled = std::mem::take(&mut pending).into_values().collect();
                        break;
                    }
                }
                Err(failure) => aggregated.failures.push(failure),
            }
        }

        if aggregated.successes.is_empty() {
            return Err(MeshError::Aggregation {
                capability: capability.to_string(),
                failures: aggregated.failures,
            });
        }

        aggregated.selected = Some(0);
        if let FanoutPolicy::BestOf(Some(scorer)) = policy {
            for success in &mut aggregated.successes {
                success.score = Some(scorer(&success.result));
            }
            aggregated.selected = aggregated
                .successes
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.score
                        .unwrap_or(f64::MIN)
                        .total_cmp(&b.score.unwrap_or(f64::MIN))
                })
                .map(|(i, _)| i);
        }

        info!(
            capability,
            policy = %policy,
            successes = aggregated.successes.len(),
            failures = aggregated.failures.len(),
            cancelled = aggregated.cancelled.len(),
            "Fanout complete"
        );
        if let Some(best) = aggregated.best() {
            debug!(capability, server_id = %best.server_id, "Fanout selected result");
        }
        Ok(aggregated)
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
