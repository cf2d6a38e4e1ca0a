use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::OrchestratorError;
use crate::models::BreakerSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Failures while closed before the circuit opens
    pub max_failures: u32,
    /// Time since the last failure after which an open circuit lets a probe through
    pub timeout: Duration,
    /// Concurrent probes allowed while half-open, and successes needed to close
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        (&BreakerSettings::default()).into()
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            max_failures: settings.max_failures,
            timeout: Duration::from_millis(settings.timeout_ms),
            half_open_max: settings.half_open_max,
        }
    }
}

/// Receives `(breaker name, from, to)` on every state change
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Decides whether an error counts against the breaker
pub type FailurePredicate = Arc<dyn Fn(&OrchestratorError) -> bool + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
}

struct BreakerState {
    state: CircuitState,
    /// Bumped on every state change so late results of older calls are ignored
    generation: u64,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_time: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            last_failure_time: None,
        }
    }

    fn set_state(&mut self, next: CircuitState) -> (CircuitState, CircuitState) {
        let previous = self.state;
        self.state = next;
        self.generation += 1;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        (previous, next)
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    on_state_change: Option<StateChangeCallback>,
    is_failure: FailurePredicate,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: RwLock::new(BreakerState::new()),
            on_state_change: None,
            is_failure: Arc::new(|_| true),
        }
    }

    pub fn with_state_change_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn with_failure_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.is_failure = predicate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn write(&self) -> RwLockWriteGuard<'_, BreakerState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Forces the breaker back to closed
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.write();
            inner.last_failure_time = None;
            (inner.state != CircuitState::Closed).then(|| inner.set_state(CircuitState::Closed))
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        info!("Circuit breaker {} changed state: {from} -> {to}", self.name);
        if let Some(callback) = &self.on_state_change {
            callback(&self.name, from, to);
        }
    }

    /// Admits or rejects a call, returning the generation it was admitted in
    fn before_call(&self) -> Result<u64, OrchestratorError> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.write();
            if inner.state == CircuitState::Open {
                let cooled_down = inner
                    .last_failure_time
                    .map_or(true, |at| at.elapsed() >= self.config.timeout);
                if cooled_down {
                    transition = Some(inner.set_state(CircuitState::HalfOpen));
                }
            }
            match inner.state {
                CircuitState::Closed => Ok(inner.generation),
                CircuitState::Open => Err(OrchestratorError::CircuitOpen(self.name.clone())),
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max.max(1) {
                        inner.half_open_in_flight += 1;
                        Ok(inner.generation)
                    } else {
                        Err(OrchestratorError::CircuitOpen(self.name.clone()))
                    }
                }
            }
        };
        self.notify(transition);
        admitted
    }

    fn after_call(&self, generation: u64, failed: bool) {
        let transition = {
            let mut inner = self.write();
            if inner.generation != generation {
                return;
            }
            match (inner.state, failed) {
                (CircuitState::Closed, false) => {
                    inner.failure_count = 0;
                    None
                }
                (CircuitState::Closed, true) => {
                    inner.failure_count += 1;
                    inner.last_failure_time = Some(Instant::now());
                    (inner.failure_count >= self.config.max_failures.max(1))
                        .then(|| inner.set_state(CircuitState::Open))
                }
                (CircuitState::HalfOpen, false) => {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                    inner.success_count += 1;
                    (inner.success_count >= self.config.half_open_max.max(1))
                        .then(|| inner.set_state(CircuitState::Closed))
                }
                (CircuitState::HalfOpen, true) => {
                    inner.last_failure_time = Some(Instant::now());
                    Some(inner.set_state(CircuitState::Open))
                }
                (CircuitState::Open, _) => None,
            }
        };
        self.notify(transition);
    }

    /// Runs `operation` on its own task if the breaker admits it
    ///
    /// When `ctx` finishes before the call, the call is abandoned (it keeps
    /// running detached), a failure is recorded and [OrchestratorError::Timeout]
    /// is returned.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &Context,
        operation: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let generation = self.before_call()?;

        let call = tokio::spawn(operation());
        tokio::select! {
            joined = call => {
                let result = joined.unwrap_or_else(|e| {
                    Err(OrchestratorError::GenericError(format!(
                        "{} call did not complete: {e}",
                        self.name
                    )))
                });
                let failed = match &result {
                    Ok(_) => false,
                    Err(err) => (self.is_failure)(err),
                };
                self.after_call(generation, failed);
                result
            }
            _ = ctx.done() => {
                let reason = ctx.err().unwrap_or(OrchestratorError::Cancelled);
                warn!("Circuit breaker {} abandoned a call: {reason}", self.name);
                self.after_call(generation, true);
                Err(OrchestratorError::Timeout(format!("{}: {reason}", self.name)))
            }
        }
    }
}

/// One breaker per `(provider, operation)`, created on first use
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    on_state_change: Option<StateChangeCallback>,
    is_failure: FailurePredicate,
    breakers: Mutex<HashMap<(String, String), Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            on_state_change: None,
            is_failure: Arc::new(|_| true),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_state_change_callback(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub fn with_failure_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.is_failure = predicate;
        self
    }

    pub fn get(&self, provider: &str, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry((provider.to_string(), operation.to_string()))
            .or_insert_with(|| {
                let mut breaker =
                    CircuitBreaker::new(&format!("{provider}:{operation}"), self.config.clone())
                        .with_failure_predicate(self.is_failure.clone());
                if let Some(callback) = &self.on_state_change {
                    breaker = breaker.with_state_change_callback(callback.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    /// Stats of every breaker created so far, sorted by name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats: Vec<CircuitBreakerStats> =
            breakers.values().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
