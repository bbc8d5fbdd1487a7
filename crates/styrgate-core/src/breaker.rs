//! Circuit breaker for the legacy database connection.
//!
//! Consecutive failures open the circuit; while open, calls are
//! refused immediately instead of tying up connections against a
//! database that is already struggling. After the cooldown, probes are
//! let through: a success closes the circuit, a failure re-stamps it
//! and keeps it open for another cooldown.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit refuses calls before allowing probes.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 300_000,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open: bool,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub open: bool,
    pub consecutive_failures: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                open: false,
                last_failure: None,
            }),
        }
    }

    /// Whether a call may proceed right now. Does not mutate state:
    /// once the cooldown has elapsed, every caller is allowed through
    /// until the next recorded outcome settles the circuit.
    pub fn should_try(&self) -> bool {
        let state = self.state.lock();
        if !state.open {
            return true;
        }
        match state.last_failure {
            Some(at) => at.elapsed() >= Duration::from_millis(self.config.cooldown_ms),
            None => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.open {
            info!("Database circuit closed after successful probe");
        }
        state.consecutive_failures = 0;
        state.open = false;
        state.last_failure = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        if !state.open && state.consecutive_failures >= self.config.failure_threshold {
            state.open = true;
            warn!(
                "Database circuit opened after {} consecutive failures; cooling down for {}ms",
                state.consecutive_failures, self.config.cooldown_ms
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            open: state.open,
            consecutive_failures: state.consecutive_failures,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
