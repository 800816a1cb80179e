use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::RateConfig;

const SUCCESS_FACTOR: f64 = 1.05;
const FAILURE_FACTOR: f64 = 0.9;
const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
const JITTER_FRACTION: f64 = 0.3;

#[derive(Debug)]
struct RateState {
    current_rate: f64,
    consecutive_failures: u32,
    requests: VecDeque<Instant>,
}

/// Snapshot of limiter state for logs and the CLI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateStats {
    pub requests_in_window: usize,
    pub current_rate: f64,
    pub consecutive_failures: u32,
    pub wait_time: Duration,
}

/// Sliding-window limiter whose allowance adapts to success/failure feedback,
/// plus a per-call delay that backs off exponentially on consecutive failures.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateConfig,
    state: Mutex<RateState>,
}

impl RateLimiter {
    /// Starts at `requests_per_minute` within `[min_rate, max_rate]`. Bounds
    /// are not checked here; with `min_rate > max_rate` the upper one wins.
    pub fn new(config: RateConfig) -> Self {
        let start = config.requests_per_minute.max(config.min_rate).min(config.max_rate);
        RateLimiter {
            state: Mutex::new(RateState {
                current_rate: start,
                consecutive_failures: 0,
                requests: VecDeque::new(),
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until another request is allowed, then record it.
    pub async fn wait_if_needed(&self) {
        let (window_wait, delay) = {
            let mut state = self.lock();
            let now = Instant::now();
            self.prune(&mut state, now);
            (self.window_wait(&state, now), self.delay_for(state.consecutive_failures))
        };

        if !window_wait.is_zero() {
            debug!("rate limit reached, waiting {:.2}s", window_wait.as_secs_f64());
            sleep(window_wait).await;
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.lock();
        let now = Instant::now();
        self.prune(&mut state, now);
        state.requests.push_back(now);
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.current_rate = (state.current_rate * SUCCESS_FACTOR).min(self.config.max_rate);
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.current_rate = (state.current_rate * FAILURE_FACTOR).max(self.config.min_rate);
    }

    pub fn current_rate(&self) -> f64 {
        self.lock().current_rate
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// How long `wait_if_needed` would wait on the window alone, right now.
    pub fn wait_time(&self) -> Duration {
        let mut state = self.lock();
        let now = Instant::now();
        self.prune(&mut state, now);
        self.window_wait(&state, now)
    }

    pub fn stats(&self) -> RateStats {
        let mut state = self.lock();
        let now = Instant::now();
        self.prune(&mut state, now);
        RateStats {
            requests_in_window: state.requests.len(),
            current_rate: state.current_rate,
            consecutive_failures: state.consecutive_failures,
            wait_time: self.window_wait(&state, now),
        }
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.requests.clear();
        state.consecutive_failures = 0;
        state.current_rate = self.config.max_rate;
        debug!("rate limiter reset");
    }

    /// `min_delay * min(2^failures, 10)`, jittered by up to ±30%, clamped to
    /// `[min_delay, max_delay]`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let min = self.config.min_delay_secs.max(0.0);
        let max = self.config.max_delay_secs.max(min);
        let multiplier = 2f64.powi(consecutive_failures.min(16) as i32).min(MAX_BACKOFF_MULTIPLIER);
        let mut delay = min * multiplier;
        if self.config.jitter {
            delay += rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION) * delay;
        }
        Duration::from_secs_f64(delay.clamp(min, max))
    }

    fn prune(&self, state: &mut RateState, now: Instant) {
        let window = self.config.window();
        while let Some(&oldest) = state.requests.front() {
            if now.duration_since(oldest) >= window {
                state.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_wait(&self, state: &RateState, now: Instant) -> Duration {
        if (state.requests.len() as f64) < state.current_rate {
            return Duration::ZERO;
        }
        // Enough requests must age out to bring the count below the allowance.
        let excess = (state.requests.len() as f64 - state.current_rate).floor() as usize;
        state
            .requests
            .get(excess)
            .or(state.requests.front())
            .map(|&t| (t + self.config.window()).saturating_duration_since(now))
            .unwrap_or_default()
    }
}
