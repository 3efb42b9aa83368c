//! Rate limiting: token bucket and sliding window, global and per-agent,
//! with optional adaptive throttling.
//!
//! The global limiter (when configured) is checked before the per-agent
//! limiter; both must admit a request.  Adaptive throttling tracks
//! exponential moving averages of response time and error rate and applies
//! probabilistic rejection after the hard limits, with the throttle factor
//! recomputed on a 30-second cadence.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ConfigError;

/// Throttle factor recompute cadence.
const ADAPTIVE_PERIOD: Duration = Duration::from_secs(30);

/// EMA smoothing for response time / error rate observations.
const EMA_ALPHA: f64 = 0.1;

// ---------------------------------------------------------------------------
// Rules and results
// ---------------------------------------------------------------------------

/// Limiting algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    TokenBucket,
    SlidingWindow,
}

/// One rate limit: `max_requests` per `time_window`.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub time_window: Duration,
    pub burst_size: Option<u32>,
    pub strategy: RateLimitStrategy,
}

impl RateLimitRule {
    pub fn new(max_requests: u32, time_window: Duration) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::InvalidRateRule(
                "max_requests must be positive".to_owned(),
            ));
        }
        if time_window.is_zero() {
            return Err(ConfigError::InvalidRateRule(
                "time_window must be positive".to_owned(),
            ));
        }
        Ok(RateLimitRule {
            max_requests,
            time_window,
            burst_size: None,
            strategy: RateLimitStrategy::TokenBucket,
        })
    }

    pub fn burst(mut self, burst_size: u32) -> Self {
        self.burst_size = Some(burst_size);
        self
    }

    pub fn strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Budget left in the per-agent limiter; `u32::MAX` when the check ran
    /// without one.
    pub remaining_requests: u32,
    pub reset_time: DateTime<Utc>,
    pub retry_after: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Algorithms
// ---------------------------------------------------------------------------

/// Token bucket with lazy refill.
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(max_tokens: u32, refill_rate: f64) -> Self {
        TokenBucket {
            max_tokens: f64::from(max_tokens),
            refill_rate,
            tokens: f64::from(max_tokens),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
            self.last_refill = now;
        }
    }

    /// Try to take `tokens` from the bucket.
    pub fn consume(&mut self, tokens: u32) -> bool {
        self.refill();
        let needed = f64::from(tokens);
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> u32 {
        self.refill();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let available = self.tokens.max(0.0) as u32;
        available
    }

    /// How long until `tokens` will be available.
    pub fn time_until(&mut self, tokens: u32) -> Duration {
        self.refill();
        let needed = f64::from(tokens) - self.tokens;
        if needed <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(needed / self.refill_rate)
        }
    }
}

/// Sliding window over request timestamps.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    requests: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        SlidingWindow {
            limit: limit as usize,
            window,
            requests: VecDeque::new(),
        }
    }

    fn evict(&mut self) {
        let now = Instant::now();
        while self
            .requests
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            self.requests.pop_front();
        }
    }

    /// Admit and record the request iff the window has room.
    pub fn is_allowed(&mut self) -> bool {
        self.evict();
        if self.requests.len() < self.limit {
            self.requests.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn remaining(&mut self) -> u32 {
        self.evict();
        #[allow(clippy::cast_possible_truncation)]
        let remaining = self.limit.saturating_sub(self.requests.len()) as u32;
        remaining
    }

    /// How long until the oldest request rolls out of the window.
    pub fn time_until_available(&mut self) -> Duration {
        self.evict();
        if self.requests.len() < self.limit {
            return Duration::ZERO;
        }
        let oldest = *self.requests.front().expect("non-empty at limit");
        self.window
            .saturating_sub(Instant::now().duration_since(oldest))
    }
}

enum Limiter {
    Bucket(TokenBucket),
    Window(SlidingWindow),
}

impl Limiter {
    fn from_rule(rule: &RateLimitRule) -> Self {
        match rule.strategy {
            RateLimitStrategy::TokenBucket => {
                let capacity = rule.burst_size.unwrap_or(rule.max_requests);
                let refill_rate =
                    f64::from(rule.max_requests) / rule.time_window.as_secs_f64();
                Limiter::Bucket(TokenBucket::new(capacity, refill_rate))
            }
            RateLimitStrategy::SlidingWindow => {
                Limiter::Window(SlidingWindow::new(rule.max_requests, rule.time_window))
            }
        }
    }

    fn admit(&mut self, weight: u32) -> bool {
        match self {
            Limiter::Bucket(bucket) => bucket.consume(weight),
            Limiter::Window(window) => {
                // Weight > 1 consumes multiple window slots.
                (0..weight).all(|_| window.is_allowed())
            }
        }
    }

    fn remaining(&mut self) -> u32 {
        match self {
            Limiter::Bucket(bucket) => bucket.available(),
            Limiter::Window(window) => window.remaining(),
        }
    }

    fn retry_after(&mut self, weight: u32) -> Duration {
        match self {
            Limiter::Bucket(bucket) => bucket.time_until(weight),
            Limiter::Window(window) => window.time_until_available(),
        }
    }
}

// ---------------------------------------------------------------------------
// Adaptive throttle
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AdaptiveState {
    error_rate: f64,
    avg_response_time: f64,
    throttle_factor: f64,
    last_adjustment: Instant,
    adjustments: u64,
}

impl AdaptiveState {
    fn new() -> Self {
        AdaptiveState {
            error_rate: 0.0,
            avg_response_time: 0.0,
            throttle_factor: 1.0,
            last_adjustment: Instant::now(),
            adjustments: 0,
        }
    }

    fn observe(&mut self, response_time: Duration, success: bool) {
        let error = if success { 0.0 } else { 1.0 };
        self.error_rate = (1.0 - EMA_ALPHA) * self.error_rate + EMA_ALPHA * error;
        self.avg_response_time = (1.0 - EMA_ALPHA) * self.avg_response_time
            + EMA_ALPHA * response_time.as_secs_f64();
    }

    /// Recompute the throttle factor: degrade on rising error rate or
    /// latency, recover slowly when both are healthy.  Clamped to
    /// [0.1, 1.0].
    fn recompute(&mut self) {
        let previous = self.throttle_factor;
        if self.error_rate > 0.1 || self.avg_response_time > 1.0 {
            self.throttle_factor = (self.throttle_factor - 0.1).max(0.1);
        } else if self.error_rate < 0.02 && self.avg_response_time < 0.5 {
            self.throttle_factor = (self.throttle_factor + 0.05).min(1.0);
        }
        self.last_adjustment = Instant::now();
        if (self.throttle_factor - previous).abs() > f64::EPSILON {
            self.adjustments += 1;
            debug!(
                factor = self.throttle_factor,
                error_rate = self.error_rate,
                "throttle factor adjusted"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Counters across all checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub adaptive_adjustments: u64,
}

struct LimiterState {
    global: Option<Limiter>,
    agent_rules: HashMap<String, RateLimitRule>,
    agent_limiters: HashMap<String, Limiter>,
    adaptive: Option<AdaptiveState>,
    metrics: RateLimiterMetrics,
}

/// The authoritative rate limiter: global gate, per-agent limiters, and the
/// optional adaptive throttle.
pub struct RateLimiter {
    global_rule: Option<RateLimitRule>,
    default_rule: RateLimitRule,
    state: Arc<Mutex<LimiterState>>,
    adaptive_loop: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RateLimiter {
    /// A limiter with no global gate and a default per-agent rule of
    /// 100 requests / 60 s.
    pub fn new() -> Self {
        Self::with_rules(
            None,
            RateLimitRule::new(100, Duration::from_secs(60)).expect("static rule"),
            false,
        )
    }

    pub fn with_rules(
        global_rule: Option<RateLimitRule>,
        default_rule: RateLimitRule,
        enable_adaptive: bool,
    ) -> Self {
        RateLimiter {
            state: Arc::new(Mutex::new(LimiterState {
                global: global_rule.as_ref().map(Limiter::from_rule),
                agent_rules: HashMap::new(),
                agent_limiters: HashMap::new(),
                adaptive: enable_adaptive.then(AdaptiveState::new),
                metrics: RateLimiterMetrics::default(),
            })),
            global_rule,
            default_rule,
            adaptive_loop: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Checking
    // -----------------------------------------------------------------------

    /// Check a request of the given weight.  The global limiter is
    /// consulted first, then the agent limiter, then the adaptive throttle.
    pub fn check_rate_limit(&self, agent_id: Option<&str>, weight: u32) -> RateLimitResult {
        let now = Utc::now();
        let mut state = self.state.lock().expect("limiter state poisoned");
        let state = &mut *state;
        state.metrics.total_requests += 1;

        if let Some(global) = state.global.as_mut() {
            if !global.admit(weight) {
                let retry = global.retry_after(weight);
                state.metrics.blocked_requests += 1;
                warn!(agent_id, "global rate limit exceeded");
                return RateLimitResult {
                    allowed: false,
                    remaining_requests: 0,
                    reset_time: now + self.global_window(),
                    retry_after: Some(retry),
                };
            }
        }

        let mut remaining = u32::MAX;
        if let Some(agent_id) = agent_id {
            let rule = state
                .agent_rules
                .get(agent_id)
                .cloned()
                .unwrap_or_else(|| self.default_rule.clone());
            let limiter = state
                .agent_limiters
                .entry(agent_id.to_owned())
                .or_insert_with(|| Limiter::from_rule(&rule));
            if !limiter.admit(weight) {
                let retry = limiter.retry_after(weight);
                state.metrics.blocked_requests += 1;
                debug!(agent_id, "agent rate limit exceeded");
                return RateLimitResult {
                    allowed: false,
                    remaining_requests: 0,
                    reset_time: now + chrono_duration(rule.time_window),
                    retry_after: Some(retry),
                };
            }
            remaining = limiter.remaining();
        }

        // Probabilistic rejection after the hard limits.
        if let Some(adaptive) = state.adaptive.as_mut() {
            if adaptive.last_adjustment.elapsed() >= ADAPTIVE_PERIOD {
                adaptive.recompute();
                state.metrics.adaptive_adjustments += 1;
            }
            let factor = adaptive.throttle_factor;
            if factor < 1.0 && rand::random::<f64>() > factor {
                state.metrics.blocked_requests += 1;
                return RateLimitResult {
                    allowed: false,
                    remaining_requests: remaining,
                    reset_time: now + chrono_duration(ADAPTIVE_PERIOD),
                    retry_after: Some(ADAPTIVE_PERIOD),
                };
            }
        }

        state.metrics.allowed_requests += 1;
        RateLimitResult {
            allowed: true,
            remaining_requests: remaining,
            reset_time: now + chrono_duration(self.default_rule.time_window),
            retry_after: None,
        }
    }

    fn global_window(&self) -> chrono::Duration {
        chrono_duration(
            self.global_rule
                .as_ref()
                .map_or(Duration::from_secs(60), |r| r.time_window),
        )
    }

    // -----------------------------------------------------------------------
    // Adaptive feedback
    // -----------------------------------------------------------------------

    /// Feed an observed request outcome into the adaptive EMAs.
    pub fn record_outcome(&self, response_time: Duration, success: bool) {
        let mut state = self.state.lock().expect("limiter state poisoned");
        if let Some(adaptive) = state.adaptive.as_mut() {
            adaptive.observe(response_time, success);
        }
    }

    /// Current throttle factor (1.0 when adaptive limiting is off).
    pub fn throttle_factor(&self) -> f64 {
        let state = self.state.lock().expect("limiter state poisoned");
        state
            .adaptive
            .as_ref()
            .map_or(1.0, |a| a.throttle_factor)
    }

    /// Start the background recompute loop.  Idempotent; harmless when
    /// adaptive limiting is disabled.
    pub fn start(&self) {
        let mut slot = self.adaptive_loop.lock().expect("adaptive loop poisoned");
        if slot.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        let shared = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ADAPTIVE_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut state = shared.lock().expect("limiter state poisoned");
                        let state = &mut *state;
                        if let Some(adaptive) = state.adaptive.as_mut() {
                            adaptive.recompute();
                            state.metrics.adaptive_adjustments += 1;
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *slot = Some((tx, handle));
        info!("rate limiter adaptive loop started");
    }

    pub async fn stop(&self) {
        let taken = self.adaptive_loop.lock().expect("adaptive loop poisoned").take();
        if let Some((tx, handle)) = taken {
            let _ = tx.send(true);
            let _ = handle.await;
        }
    }

    // -----------------------------------------------------------------------
    // Per-agent administration
    // -----------------------------------------------------------------------

    /// Install or replace an agent's rule; its limiter restarts fresh.
    pub fn set_agent_rule(&self, agent_id: &str, rule: RateLimitRule) {
        let mut state = self.state.lock().expect("limiter state poisoned");
        state.agent_limiters.remove(agent_id);
        state.agent_rules.insert(agent_id.to_owned(), rule);
    }

    pub fn remove_agent_rule(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("limiter state poisoned");
        state.agent_rules.remove(agent_id);
        state.agent_limiters.remove(agent_id);
    }

    /// Reset an agent's limiter to a full budget under its current rule.
    pub fn reset_agent(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("limiter state poisoned");
        state.agent_limiters.remove(agent_id);
    }

    /// Remaining budget for an agent without consuming anything.
    pub fn remaining_for(&self, agent_id: &str) -> Option<u32> {
        let mut state = self.state.lock().expect("limiter state poisoned");
        state.agent_limiters.get_mut(agent_id).map(Limiter::remaining)
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        self.state.lock().expect("limiter state poisoned").metrics
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
