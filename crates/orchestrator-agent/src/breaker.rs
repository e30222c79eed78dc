//! Per-(agent, operation) circuit breaker.
//!
//! States closed/open/half-open with double-checked-locking on the
//! open -> half-open transition: a read-lock fast path avoids taking the
//! write lock on every call once the breaker has settled into a state.

use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_success_threshold: u32,
    /// Cap on concurrently-admitted probes while half-open.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_success_threshold: 3,
            half_open_requests: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

/// One breaker instance, scoped to a single (agent, operation) pair by its
/// owner (`FallbackManager`).
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                half_open_in_flight: 0,
            }),
            config,
        }
    }

    /// Whether a request may be dispatched right now. Performs the
    /// open -> half-open transition in place when `reset_timeout` has
    /// elapsed. While half-open, admits at most `half_open_requests`
    /// concurrent probes; the caller must pair a `true` result with a
    /// later `record_success`/`record_failure` to release the slot.
    pub fn is_allowed(&self) -> bool {
        {
            let inner = self.inner.read().unwrap();
            match inner.state {
                BreakerState::Closed => return true,
                BreakerState::HalfOpen => {}
                BreakerState::Open => {
                    let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                    if elapsed < self.config.reset_timeout {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().unwrap();
        if inner.state == BreakerState::Open {
            let elapsed = inner.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
            if elapsed >= self.config.reset_timeout {
                inner.state = BreakerState::HalfOpen;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                info!("breaker transitioning open -> half_open");
            }
        }
        match inner.state {
            BreakerState::Open => false,
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure = None;
                    info!("breaker transitioning half_open -> closed");
                }
            }
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    warn!(failures = inner.failure_count, "breaker transitioning closed -> open");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.success_count = 0;
                warn!("probe failed in half_open, breaker reopening");
            }
            BreakerState::Open => {}
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.state = BreakerState::Open;
        inner.last_failure = Some(Instant::now());
        inner.half_open_in_flight = 0;
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.half_open_in_flight = 0;
    }

    pub fn state(&self) -> BreakerState {
        self.inner.read().unwrap().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.read().unwrap().failure_count
    }
}
