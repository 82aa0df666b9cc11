//! Circuit breakers.
//!
//! One mutex per breaker; `before_request` and the outcome hooks are short
//! critical sections. Breakers for effectors are keyed by `(kind, target)`
//! in a [`BreakerRegistry`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::logging::structured::LogContext;
use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout_secs: 60,
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub half_open_in_flight: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
}

pub struct CircuitBreaker {
    name: String,
    ctx: LogContext,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            ctx: LogContext::for_task(&format!("breaker:{}", name)),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Admit or reject a call. Rejections fail fast with `OpenCircuit`.
    pub fn before_request(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let now = self.clock.now();
            let elapsed = inner
                .last_failure
                .map(|at| now - at)
                .unwrap_or_else(Duration::zero);
            if elapsed < Duration::seconds(self.config.timeout_secs as i64) {
                return Err(Error::OpenCircuit(self.name.clone()));
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_in_flight = 0;
            log_info!(self.ctx, "CIRCUIT_HALF_OPEN", elapsed_secs = elapsed.num_seconds());
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                return Err(Error::OpenCircuit(format!(
                    "{} (half-open probe limit)",
                    self.name
                )));
            }
            inner.half_open_in_flight += 1;
        }

        Ok(())
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = 0;
                log_info!(self.ctx, "CIRCUIT_CLOSED");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_in_flight = 0;
                log_warn!(self.ctx, "CIRCUIT_REOPENED", timeout_secs = self.config.timeout_secs);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.max_failures => {
                inner.state = CircuitState::Open;
                log_warn!(self.ctx, "CIRCUIT_OPENED", failures = inner.consecutive_failures);
            }
            _ => {}
        }
    }

    /// Release an admitted call that ended without an outcome (cancelled).
    pub fn on_abandoned(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.half_open_in_flight = 0;
        log_info!(self.ctx, "CIRCUIT_RESET");
    }

    /// Run `op` under the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_request()?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(Error::Cancelled) => self.on_abandoned(),
            Err(_) => self.on_failure(),
        }
        result
    }
}

/// Breakers created on demand per key.
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(kind: &str, target: &str) -> String {
        format!("{}:{}", kind, target)
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(key, self.config.clone(), self.clock.clone()))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().values() {
            breaker.reset();
        }
    }
}
