use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, CircuitBreakersConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

/// Failure-counting wrapper around an unhealthy dependency.
///
/// closed → open after `failure_threshold` consecutive failures;
/// open → half-open once `reset_timeout` has elapsed; half-open → closed on
/// the first success, back to open on failure. While open, `execute`
/// rejects without calling the wrapped function.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check_gate()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Reject when open; promote open → half-open after the reset timeout.
    fn check_gate(&self) -> Result<()> {
        let mut state = self.lock();
        match *state {
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    info!("circuit '{}' half-open", self.name);
                    *state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    bail!("circuit '{}' is open", self.name)
                }
            }
            _ => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        if *state != (BreakerState::Closed { failures: 0 }) {
            info!("circuit '{}' closed", self.name);
        }
        *state = BreakerState::Closed { failures: 0 };
    }

    fn record_failure(&self) {
        let mut state = self.lock();
        let next = match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!("circuit '{}' open after {failures} consecutive failures", self.name);
                    BreakerState::Open { opened_at: Instant::now() }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            BreakerState::HalfOpen => {
                warn!("circuit '{}' re-opened from half-open", self.name);
                BreakerState::Open { opened_at: Instant::now() }
            }
            open => open,
        };
        *state = next;
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), BreakerState::Open { .. })
    }

    pub fn state_name(&self) -> &'static str {
        match *self.lock() {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The breakers this system tracks: LLM calls and GitHub pushes/PR calls.
/// Either may be absent when the config does not enable it.
#[derive(Default)]
pub struct BreakerSet {
    pub claude: Option<Arc<CircuitBreaker>>,
    pub github: Option<Arc<CircuitBreaker>>,
}

impl BreakerSet {
    pub fn from_config(config: &CircuitBreakersConfig) -> Self {
        Self {
            claude: config.claude.map(|c| Arc::new(CircuitBreaker::new("claude", c))),
            github: config.github.map(|c| Arc::new(CircuitBreaker::new("github", c))),
        }
    }
}

/// Run `f` through the breaker when one is configured, directly otherwise.
pub async fn guarded<T, F, Fut>(breaker: Option<&CircuitBreaker>, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match breaker {
        Some(b) => b.execute(f).await,
        None => f().await,
    }
}
