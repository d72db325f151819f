//! Per-upstream circuit breakers.
//!
//! Every external HTTP dependency owns a named three-state breaker
//! (CLOSED / OPEN / HALF_OPEN). Calls go through [`CircuitBreaker::exec`];
//! an open circuit rejects immediately with a distinguished
//! [`RelayError::CircuitOpen`] so fallbacks can swallow it silently while
//! real upstream errors still get logged.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::health::{HealthCheck, HealthIssue, Severity};

/// Size of the rolling response-time window.
const RESPONSE_WINDOW: usize = 20;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Per-breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time spent open before a single probe is admitted.
    pub reset_timeout: Duration,
    /// Probe successes needed to close from half-open.
    pub success_threshold: u32,
    /// Per-call request timeout; a trip counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Mutable breaker state, guarded by one lock.
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probe_successes: u32,
    total_successes: u64,
    total_failures: u64,
    total_requests: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    opened_at: Option<Instant>,
    response_times: VecDeque<Duration>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            probe_successes: 0,
            total_successes: 0,
            total_failures: 0,
            total_requests: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            opened_at: None,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }

    fn push_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }
}

/// Point-in-time statistics for one breaker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub service: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_requests: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Seconds spent open so far, when open.
    pub open_for_secs: Option<f64>,
    /// Rolling average over the last 20 calls, in milliseconds.
    pub avg_response_ms: Option<f64>,
}

/// A three-state circuit guarding one upstream.
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run `f` through the breaker.
    ///
    /// Open circuits reject immediately with [`RelayError::CircuitOpen`];
    /// admitted calls run under the configured request timeout, and a trip
    /// counts as a failure.
    pub async fn exec<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Admission decision.
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                BreakerState::Closed | BreakerState::HalfOpen => {}
                BreakerState::Open => {
                    let open_for = inner
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if open_for >= self.config.reset_timeout {
                        info!(service = %self.service, "circuit half-open, admitting probe");
                        inner.state = BreakerState::HalfOpen;
                        inner.probe_successes = 0;
                    } else {
                        return Err(RelayError::CircuitOpen {
                            service: self.service.clone(),
                            last_error: inner
                                .last_error
                                .clone()
                                .unwrap_or_else(|| "unknown".to_owned()),
                        }
                        .into());
                    }
                }
            }
            inner.total_requests += 1;
        }

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "request to {} timed out after {:?}",
                self.service,
                self.config.call_timeout
            )),
        };
        let elapsed = started.elapsed();

        let mut inner = self.inner.lock().await;
        inner.push_response_time(elapsed);

        match &outcome {
            Ok(_) => {
                inner.total_successes += 1;
                inner.consecutive_successes += 1;
                inner.last_success_at = Some(Utc::now());
                match inner.state {
                    BreakerState::Closed => inner.consecutive_failures = 0,
                    BreakerState::HalfOpen => {
                        inner.probe_successes += 1;
                        if inner.probe_successes >= self.config.success_threshold {
                            info!(service = %self.service, "circuit closed after successful probe");
                            inner.state = BreakerState::Closed;
                            inner.consecutive_failures = 0;
                            inner.opened_at = None;
                        }
                    }
                    BreakerState::Open => {}
                }
            }
            Err(e) => {
                inner.total_failures += 1;
                inner.consecutive_successes = 0;
                inner.last_failure_at = Some(Utc::now());
                inner.last_error = Some(format!("{e:#}"));
                match inner.state {
                    BreakerState::Closed => {
                        inner.consecutive_failures += 1;
                        if inner.consecutive_failures >= self.config.failure_threshold {
                            warn!(
                                service = %self.service,
                                failures = inner.consecutive_failures,
                                "circuit opened"
                            );
                            inner.state = BreakerState::Open;
                            inner.opened_at = Some(Instant::now());
                        }
                    }
                    BreakerState::HalfOpen => {
                        warn!(service = %self.service, "probe failed, circuit re-opened");
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                    BreakerState::Open => {}
                }
            }
        }

        outcome
    }

    /// Run `f` through the breaker, returning `fallback` on any error.
    ///
    /// A [`RelayError::CircuitOpen`] rejection is swallowed silently; every
    /// other error is logged before the fallback is returned.
    pub async fn exec_with_fallback<T, F, Fut>(&self, f: F, fallback: T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.exec(f).await {
            Ok(value) => value,
            Err(e) => {
                let is_open = e
                    .downcast_ref::<RelayError>()
                    .is_some_and(|r| matches!(r, RelayError::CircuitOpen { .. }));
                if !is_open {
                    warn!(service = %self.service, error = %format!("{e:#}"), "call failed, using fallback");
                }
                fallback
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().await;
        let avg_response_ms = if inner.response_times.is_empty() {
            None
        } else {
            let total: Duration = inner.response_times.iter().sum();
            Some(total.as_secs_f64() * 1000.0 / inner.response_times.len() as f64)
        };
        BreakerStats {
            service: self.service.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_requests: inner.total_requests,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            last_error: inner.last_error.clone(),
            open_for_secs: match inner.state {
                BreakerState::Open => inner.opened_at.map(|at| at.elapsed().as_secs_f64()),
                _ => None,
            },
            avg_response_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Named breakers, one per upstream dependency.
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for `service`, creating it with the registry
    /// default config on first use.
    pub async fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(service.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.default_config.clone()))
            })
            .clone()
    }

    /// Register a breaker with custom tuning, replacing any existing one.
    pub async fn register(&self, service: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(service, config));
        self.breakers
            .lock()
            .await
            .insert(service.to_owned(), Arc::clone(&breaker));
        breaker
    }

    pub async fn stats(&self) -> Vec<BreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.lock().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Health hook: any non-closed breaker is a degraded-state issue.
#[async_trait]
impl HealthCheck for BreakerRegistry {
    fn name(&self) -> &str {
        "circuit-breakers"
    }

    async fn issues(&self) -> Vec<HealthIssue> {
        self.stats()
            .await
            .into_iter()
            .filter(|s| s.state != BreakerState::Closed)
            .map(|s| HealthIssue {
                component: format!("breaker:{}", s.service),
                severity: Severity::Degraded,
                detail: format!(
                    "circuit {} (last error: {})",
                    s.state,
                    s.last_error.as_deref().unwrap_or("none")
                ),
            })
            .collect()
    }
}
