//! Round-robin, rate-limited, backoff-aware instance pool fronting the
//! configured mirror instances.
//!
//! Every instance carries its own token bucket (refilled continuously
//! from `max_requests_per_instance_per_minute`) and its own exponential
//! backoff window. `acquire` walks the instance list starting from a
//! shared rotation cursor so load spreads evenly across healthy
//! instances instead of hammering the first one in the list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::GatewayError;

/// Per-instance bookkeeping: token bucket state plus backoff/error history.
#[derive(Debug, Clone)]
struct InstanceState {
    base_url: String,
    tokens: f64,
    last_refill: Instant,
    backoff_until: Option<Instant>,
    consecutive_errors: u32,
    last_rtt_ms: Option<u64>,
    last_error: Option<String>,
}

/// A point-in-time view of one instance's health, for the `/api/health`
/// endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceSnapshot {
    pub base_url: String,
    pub tokens: f64,
    pub backoff_remaining_seconds: f64,
    pub consecutive_errors: u32,
    pub last_rtt_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// A handle returned by `acquire`, identifying which instance won the
/// rotation so the caller can report success/failure back against it.
pub struct Lease {
    index: usize,
    pub base_url: String,
}

pub struct GatewayPool {
    states: Mutex<Vec<InstanceState>>,
    rotation: AtomicUsize,
    max_requests_per_minute: f64,
    backoff_base_seconds: u64,
}

impl GatewayPool {
    pub fn new(
        instances: &[String],
        max_requests_per_instance_per_minute: i64,
        backoff_base_seconds: i64,
    ) -> Result<Self, GatewayError> {
        if instances.is_empty() {
            return Err(GatewayError::NoInstanceAvailable);
        }
        let now = Instant::now();
        let states = instances
            .iter()
            .map(|instance| InstanceState {
                base_url: instance.trim_end_matches('/').to_string(),
                tokens: max_requests_per_instance_per_minute as f64,
                last_refill: now,
                backoff_until: None,
                consecutive_errors: 0,
                last_rtt_ms: None,
                last_error: None,
            })
            .collect();

        Ok(GatewayPool {
            states: Mutex::new(states),
            rotation: AtomicUsize::new(0),
            max_requests_per_minute: max_requests_per_instance_per_minute as f64,
            backoff_base_seconds: backoff_base_seconds.max(1) as u64,
        })
    }

    fn refill(&self, state: &mut InstanceState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let tokens_to_add = (self.max_requests_per_minute / 60.0) * elapsed;
        if tokens_to_add > 0.0 {
            state.tokens = (state.tokens + tokens_to_add).min(self.max_requests_per_minute);
            state.last_refill = now;
        }
    }

    /// Walks the instance list starting from the shared rotation cursor,
    /// skipping instances still in backoff or out of tokens, and returns
    /// the first eligible one with a token deducted.
    pub async fn acquire(&self) -> Result<Lease, GatewayError> {
        let mut states = self.states.lock().await;
        let len = states.len();
        let now = Instant::now();

        for _ in 0..len {
            let index = self.rotation.fetch_add(1, Ordering::Relaxed) % len;
            let state = &mut states[index];
            self.refill(state);

            if let Some(until) = state.backoff_until {
                if now < until {
                    continue;
                }
            }
            if state.tokens < 1.0 {
                continue;
            }
            state.tokens -= 1.0;
            return Ok(Lease {
                index,
                base_url: state.base_url.clone(),
            });
        }

        Err(GatewayError::NoInstanceAvailable)
    }

    pub async fn release_success(&self, lease: &Lease, rtt: Duration) {
        let mut states = self.states.lock().await;
        let state = &mut states[lease.index];
        state.consecutive_errors = 0;
        state.backoff_until = None;
        state.last_error = None;
        state.last_rtt_ms = Some(rtt.as_millis() as u64);
    }

    pub async fn release_error(&self, lease: &Lease, reason: &str) {
        let mut states = self.states.lock().await;
        let state = &mut states[lease.index];
        state.consecutive_errors += 1;
        let penalty_seconds = (self.backoff_base_seconds
            * 2u64.saturating_pow(state.consecutive_errors.saturating_sub(1)))
        .min(600);
        state.backoff_until = Some(Instant::now() + Duration::from_secs(penalty_seconds));
        state.last_error = Some(reason.to_string());
        tracing::warn!(
            instance = %state.base_url,
            penalty_seconds,
            reason,
            "instance entering backoff",
        );
    }

    pub async fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut states = self.states.lock().await;
        let now = Instant::now();
        states
            .iter_mut()
            .map(|state| {
                self.refill(state);
                let backoff_remaining_seconds = state
                    .backoff_until
                    .map(|until| until.saturating_duration_since(now).as_secs_f64())
                    .unwrap_or(0.0);
                InstanceSnapshot {
                    base_url: state.base_url.clone(),
                    tokens: (state.tokens * 100.0).round() / 100.0,
                    backoff_remaining_seconds,
                    consecutive_errors: state.consecutive_errors,
                    last_rtt_ms: state.last_rtt_ms,
                    last_error: state.last_error.clone(),
                }
            })
            .collect()
    }
}
