//! Per-client sliding-window rate limiting.
//!
//! Each endpoint class carries its own budget; a client exhausting the
//! heavy-query budget can still hit health checks. Breaching a budget
//! blocks the client for a full window from the breach. Timestamps
//! older than the window are pruned on every check, so memory per
//! client is bounded by the class limit.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Health,
    Tracking,
    HeavyQuery,
    Auth,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassBudget {
    pub max_requests: usize,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub health: ClassBudget,
    pub tracking: ClassBudget,
    pub heavy_query: ClassBudget,
    pub auth: ClassBudget,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let minute = 60_000;
        Self {
            health: ClassBudget { max_requests: 30, window_ms: minute },
            tracking: ClassBudget { max_requests: 10, window_ms: minute },
            heavy_query: ClassBudget { max_requests: 5, window_ms: minute },
            auth: ClassBudget { max_requests: 20, window_ms: minute },
        }
    }
}

impl RateLimitConfig {
    fn budget(&self, class: EndpointClass) -> ClassBudget {
        match class {
            EndpointClass::Health => self.health,
            EndpointClass::Tracking => self.tracking,
            EndpointClass::HeavyQuery => self.heavy_query,
            EndpointClass::Auth => self.auth,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: usize },
    Limited { retry_after_ms: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct ClientWindow {
    times: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(String, EndpointClass), ClientWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Admit or refuse one request. An admitted request consumes a
    /// slot; a breach blocks the client for a full window from the
    /// breach, and further attempts while blocked do not extend it.
    pub fn check(&self, client: &str, class: EndpointClass) -> Admission {
        let budget = self.config.budget(class);
        let window = Duration::from_millis(budget.window_ms);
        let now = Instant::now();

        let mut entry = self
            .windows
            .entry((client.to_string(), class))
            .or_default();

        if let Some(until) = entry.blocked_until {
            if now < until {
                return Admission::Limited {
                    retry_after_ms: (until - now).as_millis() as u64,
                };
            }
            entry.blocked_until = None;
        }

        while let Some(oldest) = entry.times.front() {
            if now.duration_since(*oldest) >= window {
                entry.times.pop_front();
            } else {
                break;
            }
        }

        if entry.times.len() >= budget.max_requests {
            entry.blocked_until = Some(now + window);
            debug!(
                "Rate limit breached for {} on {:?}: blocked for {}ms",
                client, class, budget.window_ms
            );
            return Admission::Limited {
                retry_after_ms: budget.window_ms,
            };
        }

        entry.times.push_back(now);
        Admission::Allowed {
            remaining: budget.max_requests - entry.times.len(),
        }
    }

    /// Drop all recorded windows and blocks for a client.
    pub fn reset_client(&self, client: &str) {
        self.windows.retain(|(c, _), _| c != client);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn limiter(max_requests: usize, window_ms: u64) -> RateLimiter {
        let budget = ClassBudget { max_requests, window_ms };
        RateLimiter::new(RateLimitConfig {
            health: budget,
            tracking: budget,
            heavy_query: budget,
            auth: budget,
        })
    }

    #[test]
    fn test_boundary_is_exact() {
        let rl = limiter(3, 60_000);
        for i in (0..3).rev() {
            match rl.check("lars", EndpointClass::HeavyQuery) {
                Admission::Allowed { remaining } => assert_eq!(remaining, i),
                Admission::Limited { .. } => panic!("admitted request refused"),
            }
        }
        assert!(!rl.check("lars", EndpointClass::HeavyQuery).is_allowed());
    }

    #[test]
    fn test_breach_blocks_full_window() {
        let rl = limiter(2, 40);
        rl.check("lars", EndpointClass::HeavyQuery);
        rl.check("lars", EndpointClass::HeavyQuery);
        assert!(!rl.check("lars", EndpointClass::HeavyQuery).is_allowed());

        // Hammering while blocked must not extend the block
        for _ in 0..5 {
            assert!(!rl.check("lars", EndpointClass::HeavyQuery).is_allowed());
        }
        sleep(Duration::from_millis(50));
        assert!(rl.check("lars", EndpointClass::HeavyQuery).is_allowed());
    }

    #[test]
    fn test_retry_after_is_reported() {
        let rl = limiter(1, 60_000);
        rl.check("lars", EndpointClass::Auth);
        match rl.check("lars", EndpointClass::Auth) {
            Admission::Limited { retry_after_ms } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 60_000)
            }
            Admission::Allowed { .. } => panic!("expected refusal"),
        }
    }

    #[test]
    fn test_classes_are_independent() {
        let rl = limiter(1, 60_000);
        assert!(rl.check("lars", EndpointClass::HeavyQuery).is_allowed());
        assert!(!rl.check("lars", EndpointClass::HeavyQuery).is_allowed());
        assert!(rl.check("lars", EndpointClass::Health).is_allowed());
    }

    #[test]
    fn test_clients_are_independent() {
        let rl = limiter(1, 60_000);
        assert!(rl.check("lars", EndpointClass::HeavyQuery).is_allowed());
        assert!(rl.check("peter", EndpointClass::HeavyQuery).is_allowed());
    }

    #[test]
    fn test_window_slides_without_breach() {
        let rl = limiter(2, 50);
        assert!(rl.check("lars", EndpointClass::Tracking).is_allowed());
        sleep(Duration::from_millis(30));
        assert!(rl.check("lars", EndpointClass::Tracking).is_allowed());
        // The first slot has aged out; no breach ever happened
        sleep(Duration::from_millis(30));
        assert!(rl.check("lars", EndpointClass::Tracking).is_allowed());
    }

    #[test]
    fn test_reset_client() {
        let rl = limiter(1, 60_000);
        rl.check("lars", EndpointClass::Auth);
        assert!(!rl.check("lars", EndpointClass::Auth).is_allowed());
        rl.reset_client("lars");
        assert!(rl.check("lars", EndpointClass::Auth).is_allowed());
    }
}
