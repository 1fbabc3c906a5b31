//! Router: picks which agent executes a task and under which billing mode,
//! given an ordered candidate list and a per-provider sliding-window rate
//! limiter. Stateless apart from the rate-limit windows, which live only in
//! memory and reset on restart.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use substrate_db::BillingMode;

/// One entry in the routing policy's ordered candidate list.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent: String,
    pub subscription_enabled: bool,
    pub api_enabled: bool,
    pub model: Option<String>,
    /// Token budget for the sliding window, `None` disables the limiter for
    /// this candidate's subscription mode.
    pub rate_limit_tokens: Option<u64>,
    pub rate_limit_window: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingPolicy {
    pub candidates: Vec<Candidate>,
}

/// A resolved routing outcome. Durable only via the execution log; the
/// router itself persists nothing.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub agent: String,
    pub billing_mode: BillingMode,
    pub candidate_chain: Vec<String>,
    pub model: Option<String>,
    pub estimated_cost_usd: Option<f64>,
    pub rationale: String,
}

/// A task as seen by the router: just enough to evaluate the policy.
#[derive(Debug, Clone)]
pub struct RoutableTask {
    pub pinned_agent: Option<String>,
    pub estimated_tokens: u64,
}

struct Window {
    capacity: u64,
    duration: Duration,
    consumed: Vec<(Instant, u64)>,
}

impl Window {
    fn new(capacity: u64, duration: Duration) -> Self {
        Self { capacity, duration, consumed: Vec::new() }
    }

    fn prune(&mut self, now: Instant) {
        let duration = self.duration;
        self.consumed.retain(|(at, _)| now.duration_since(*at) < duration);
    }

    fn used(&self) -> u64 {
        self.consumed.iter().map(|(_, tokens)| tokens).sum()
    }

    fn has_room(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.used() < self.capacity
    }

    fn record(&mut self, now: Instant, tokens: u64) {
        self.prune(now);
        self.consumed.push((now, tokens));
    }
}

/// In-memory sliding-window rate limiter, one window per agent.
struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self { windows: Mutex::new(HashMap::new()) }
    }

    fn under_limit(&self, agent: &str, capacity: u64, duration: Duration) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let window = windows.entry(agent.to_string()).or_insert_with(|| Window::new(capacity, duration));
        window.has_room(Instant::now())
    }

    fn record(&self, agent: &str, tokens: u64) {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        if let Some(window) = windows.get_mut(agent) {
            window.record(Instant::now(), tokens);
        }
    }
}

pub struct Router {
    policy: RoutingPolicy,
    limiter: RateLimiter,
}

impl Router {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy, limiter: RateLimiter::new() }
    }

    /// Evaluate the candidate list in order for `task`. Returns `None` when
    /// no candidate can serve the task (`unavailable`).
    pub fn route(&self, task: &RoutableTask) -> Option<RoutingDecision> {
        let mut chain = Vec::new();

        for candidate in &self.policy.candidates {
            if let Some(pinned) = &task.pinned_agent {
                if pinned != &candidate.agent {
                    continue;
                }
            }

            chain.push(candidate.agent.clone());

            if candidate.subscription_enabled {
                let under_limit = match (candidate.rate_limit_tokens, candidate.rate_limit_window) {
                    (Some(cap), Some(window)) => self.limiter.under_limit(&candidate.agent, cap, window),
                    _ => true,
                };
                if under_limit {
                    return Some(RoutingDecision {
                        agent: candidate.agent.clone(),
                        billing_mode: BillingMode::Subscription,
                        candidate_chain: chain,
                        model: candidate.model.clone(),
                        estimated_cost_usd: None,
                        rationale: format!(
                            "agent {:?} selected via subscription; within rate-limit window",
                            candidate.agent
                        ),
                    });
                }
            }

            if candidate.api_enabled {
                return Some(RoutingDecision {
                    agent: candidate.agent.clone(),
                    billing_mode: BillingMode::Api,
                    candidate_chain: chain,
                    model: candidate.model.clone(),
                    estimated_cost_usd: None,
                    rationale: format!(
                        "agent {:?} selected via API fallback; subscription unavailable or rate-limited",
                        candidate.agent
                    ),
                });
            }
        }

        None
    }

    /// Advance the named agent's rate-limit window with actually-consumed
    /// tokens, reported by the Worker Pool after task completion.
    pub fn report_actual_tokens(&self, agent: &str, tokens: u64) {
        self.limiter.record(agent, tokens);
    }
}
