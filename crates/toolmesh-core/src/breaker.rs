//! Per-server circuit breakers
//!
//! A circuit trips open when the failure rate over a sliding window (the
//! last `window_size` outcomes, none older than `window_duration`) exceeds
//! the threshold with enough samples. After the cooldown exactly one trial
//! request is let through; its outcome closes the circuit or re-opens it on
//! the next, longer cooldown tier.

use crate::config::BreakerConfig;
use crate::events::{EventBus, MeshEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Snapshot of one circuit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub window_len: usize,
    pub window_failures: usize,
    pub failure_rate: f64,
    /// Re-opens since the circuit last closed
    pub tier: u32,
    pub cooldown_remaining: Option<Duration>,
    pub trial_in_flight: bool,
}

struct Circuit {
    state: CircuitState,
    open_until: Option<Instant>,
    window: VecDeque<(Instant, bool)>,
    tier: u32,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            open_until: None,
            window: VecDeque::new(),
            tier: 0,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, config: &BreakerConfig) {
        while self.window.len() > config.window_size {
            self.window.pop_front();
        }
        while self
            .window
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > config.window_duration)
        {
            self.window.pop_front();
        }
    }

    fn failures(&self) -> usize {
        self.window.iter().filter(|(_, ok)| !ok).count()
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.window.len() as f64
        }
    }
}

/// Circuit breakers for every server of one client
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
    events: Arc<EventBus>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Cooldown for the given re-open tier
    pub fn cooldown_for(&self, tier: u32) -> Duration {
        let exponent = i32::try_from(tier).unwrap_or(i32::MAX);
        let secs = self.config.cooldown.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.config.max_cooldown.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn open(&self, server_id: &str, circuit: &mut Circuit, now: Instant) -> MeshEvent {
        let cooldown = self.cooldown_for(circuit.tier);
        circuit.state = CircuitState::Open;
        circuit.open_until = Some(now + cooldown);
        circuit.trial_in_flight = false;
        circuit.window.clear();

        warn!(server_id = %server_id, tier = circuit.tier, ?cooldown, "Circuit opened");
        MeshEvent::CircuitOpened {
            server_id: server_id.to_string(),
            cooldown,
            tier: circuit.tier,
        }
    }

    pub fn record_success(&self, server_id: &str) {
        let event = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits
                .entry(server_id.to_string())
                .or_insert_with(Circuit::new);

            match circuit.state {
                CircuitState::HalfOpen => {
                    circuit.state = CircuitState::Closed;
                    circuit.open_until = None;
                    circuit.window.clear();
                    circuit.tier = 0;
                    circuit.trial_in_flight = false;
                    info!(server_id = %server_id, "Circuit closed after successful trial");
                    Some(MeshEvent::CircuitClosed {
                        server_id: server_id.to_string(),
                    })
                }
                CircuitState::Closed => {
                    let now = Instant::now();
                    circuit.window.push_back((now, true));
                    circuit.prune(now, &self.config);
                    None
                }
                // Late result from before the circuit opened.
                CircuitState::Open => None,
            }
        };

        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    pub fn record_failure(&self, server_id: &str) {
        let event = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits
                .entry(server_id.to_string())
                .or_insert_with(Circuit::new);
            let now = Instant::now();

            match circuit.state {
                CircuitState::HalfOpen => {
                    circuit.tier = circuit.tier.saturating_add(1);
                    Some(self.open(server_id, circuit, now))
                }
                CircuitState::Closed => {
                    circuit.window.push_back((now, false));
                    circuit.prune(now, &self.config);

                    let rate = circuit.failure_rate();
                    debug!(
                        server_id = %server_id,
                        samples = circuit.window.len(),
                        failure_rate = rate,
                        "Recorded failure"
                    );
                    (circuit.window.len() >= self.config.minimum_requests
                        && rate > self.config.failure_rate_threshold)
                        .then(|| self.open(server_id, circuit, now))
                }
                CircuitState::Open => None,
            }
        };

        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    /// Admission check before dispatching to `server_id`
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// grants the caller the single trial request.
    pub fn is_request_allowed(&self, server_id: &str) -> bool {
        let (allowed, event) = {
            let mut circuits = self.circuits.lock();
            let circuit = circuits
                .entry(server_id.to_string())
                .or_insert_with(Circuit::new);

            match circuit.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open => {
                    let now = Instant::now();
                    if circuit.open_until.is_some_and(|until| now >= until) {
                        circuit.state = CircuitState::HalfOpen;
                        circuit.open_until = None;
                        circuit.trial_in_flight = true;
                        info!(server_id = %server_id, "Circuit half-open, allowing trial request");
                        (
                            true,
                            Some(MeshEvent::CircuitHalfOpened {
                                server_id: server_id.to_string(),
                            }),
                        )
                    } else {
                        (false, None)
                    }
                }
                CircuitState::HalfOpen => {
                    if circuit.trial_in_flight {
                        (false, None)
                    } else {
                        circuit.trial_in_flight = true;
                        (true, None)
                    }
                }
            }
        };

        if let Some(event) = event {
            self.events.emit(event);
        }
        allowed
    }

    /// Whether [`Self::is_request_allowed`] would currently say yes, without
    /// changing any state
    pub fn is_available(&self, server_id: &str) -> bool {
        let circuits = self.circuits.lock();
        let Some(circuit) = circuits.get(server_id) else {
            return true;
        };
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => circuit
                .open_until
                .is_some_and(|until| Instant::now() >= until),
            CircuitState::HalfOpen => !circuit.trial_in_flight,
        }
    }

    /// Give back a trial whose request never produced an outcome
    pub fn abandon_trial(&self, server_id: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(server_id) {
            if circuit.state == CircuitState::HalfOpen && circuit.trial_in_flight {
                debug!(server_id = %server_id, "Trial request abandoned");
                circuit.trial_in_flight = false;
            }
        }
    }

    pub fn state(&self, server_id: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(server_id)
            .map_or(CircuitState::Closed, |c| c.state)
    }

    pub fn stats(&self, server_id: &str) -> Option<CircuitStats> {
        let circuits = self.circuits.lock();
        let circuit = circuits.get(server_id)?;
        let now = Instant::now();
        Some(CircuitStats {
            state: circuit.state,
            window_len: circuit.window.len(),
            window_failures: circuit.failures(),
            failure_rate: circuit.failure_rate(),
            tier: circuit.tier,
            cooldown_remaining: circuit
                .open_until
                .map(|until| until.saturating_duration_since(now)),
            trial_in_flight: circuit.trial_in_flight,
        })
    }

    /// Forget a server's circuit
    pub fn remove(&self, server_id: &str) -> bool {
        self.circuits.lock().remove(server_id).is_some()
    }
}
