//! Load-balancing policies
//!
//! A policy orders the eligible candidates for one request: the first is
//! the pick, the rest are fallbacks in the order they will be tried.

use crate::error::MeshError;
use crate::random::SharedRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Floor applied to latency before inverting it, so a 0ms server cannot
/// take every request
const MIN_LATENCY_MS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingPolicy {
    /// Random pick weighted by inverse EMA latency
    #[default]
    LatencyWeightedRandom,
    RoundRobin,
    /// Fewest busy connections, ties broken by latency
    LeastBusy,
}

impl LoadBalancingPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LatencyWeightedRandom => "latency-weighted-random",
            Self::RoundRobin => "round-robin",
            Self::LeastBusy => "least-busy",
        }
    }
}

impl fmt::Display for LoadBalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingPolicy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latency-weighted-random" | "latency" => Ok(Self::LatencyWeightedRandom),
            "round-robin" => Ok(Self::RoundRobin),
            "least-busy" => Ok(Self::LeastBusy),
            other => Err(MeshError::Config(format!(
                "unknown load-balancing policy '{other}'"
            ))),
        }
    }
}

/// One eligible server as seen by the balancer
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub server_id: String,
    pub ema_latency_ms: Option<f64>,
    pub busy: usize,
    pub error_rate: f64,
}

impl Candidate {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ema_latency_ms: None,
            busy: 0,
            error_rate: 0.0,
        }
    }

    pub fn with_latency(mut self, ms: f64) -> Self {
        self.ema_latency_ms = Some(ms);
        self
    }

    pub fn with_busy(mut self, busy: usize) -> Self {
        self.busy = busy;
        self
    }
}

/// Candidates in the order they should be tried
#[derive(Debug, Clone)]
pub struct Selection {
    pub chosen: Candidate,
    pub fallbacks: Vec<Candidate>,
}

/// Applies a [`LoadBalancingPolicy`] to a candidate set
pub struct LoadBalancer {
    rng: SharedRng,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(rng: SharedRng) -> Self {
        Self {
            rng,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Order `candidates`; `None` when there are none
    pub fn select(&self, policy: LoadBalancingPolicy, mut candidates: Vec<Candidate>) -> Option<Selection> {
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        let ordered = match policy {
            LoadBalancingPolicy::LatencyWeightedRandom => self.latency_weighted(candidates),
            LoadBalancingPolicy::RoundRobin => {
                let start = self.cursor.fetch_add(1, AtomicOrdering::Relaxed) % candidates.len();
                candidates.rotate_left(start);
                candidates
            }
            LoadBalancingPolicy::LeastBusy => {
                candidates.sort_by(|a, b| {
                    a.busy
                        .cmp(&b.busy)
                        .then_with(|| cmp_latency(a.ema_latency_ms, b.ema_latency_ms))
                });
                candidates
            }
        };

        let mut ordered = ordered.into_iter();
        let chosen = ordered.next()?;
        Some(Selection {
            chosen,
            fallbacks: ordered.collect(),
        })
    }

    fn latency_weighted(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let weights = latency_weights(&candidates);
        let total: f64 = weights.iter().sum();

        let mut target = self.rng.next_f64() * total;
        let mut pick = candidates.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            if target < *w {
                pick = i;
                break;
            }
            target -= w;
        }

        // Fallbacks by descending weight, ties in id order.
        let mut rest: Vec<(f64, Candidate)> = Vec::with_capacity(candidates.len() - 1);
        let mut chosen = None;
        for (i, (w, c)) in weights.into_iter().zip(candidates).enumerate() {
            if i == pick {
                chosen = Some(c);
            } else {
                rest.push((w, c));
            }
        }
        rest.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        chosen
            .into_iter()
            .chain(rest.into_iter().map(|(_, c)| c))
            .collect()
    }
}

/// Selection weight per candidate, proportional to 1 / latency
///
/// Candidates without samples are weighted at the mean known latency; with
/// no samples at all the weights are uniform.
pub fn latency_weights(candidates: &[Candidate]) -> Vec<f64> {
    let known: Vec<f64> = candidates.iter().filter_map(|c| c.ema_latency_ms).collect();
    let mean = if known.is_empty() {
        None
    } else {
        Some(known.iter().sum::<f64>() / known.len() as f64)
    };

    candidates
        .iter()
        .map(|c| match c.ema_latency_ms.or(mean) {
            Some(ms) => 1.0 / ms.max(MIN_LATENCY_MS),
            None => 1.0,
        })
        .collect()
}

fn cmp_latency(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
