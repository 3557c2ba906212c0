//! Circuit breaker for counter calls
//!
//! Three states: `Closed` passes calls through, `Open` short-circuits them
//! until the cooldown elapses, `HalfOpen` lets exactly one probe call decide
//! whether to close again. The breaker reacts to observed failures; the
//! health probe is the eager signal and flips independently.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
            failure_threshold,
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Run `fut` under the breaker. In `Open`, the call is refused with
    /// `BreakerOpen` until the cooldown has elapsed; the caller that finds
    /// the cooldown expired becomes the single `HalfOpen` probe, and other
    /// callers keep getting `BreakerOpen` until its outcome is recorded.
    ///
    /// The lock is only held to inspect and update state, never across the
    /// awaited call.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                BreakerState::Closed => {}
                BreakerState::Open => {
                    let cooled_down = inner
                        .last_failure
                        .map(|at| at.elapsed() >= self.cooldown)
                        .unwrap_or(true);
                    if !cooled_down {
                        return Err(LedgerError::BreakerOpen);
                    }
                    inner.state = BreakerState::HalfOpen;
                    log::info!("circuit breaker half-open, probing counter backend");
                }
                BreakerState::HalfOpen => return Err(LedgerError::BreakerOpen),
            }
        }

        let result = fut.await;

        let mut inner = self.inner.lock().unwrap();
        match &result {
            Ok(_) => {
                if inner.state != BreakerState::Closed {
                    log::info!("circuit breaker closed");
                }
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
            }
            Err(_) => {
                inner.consecutive_failures += 1;
                inner.last_failure = Some(Instant::now());

                let trip = inner.state == BreakerState::HalfOpen
                    || inner.consecutive_failures >= self.failure_threshold;
                if trip && inner.state != BreakerState::Open {
                    log::warn!(
                        "circuit breaker opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    inner.state = BreakerState::Open;
                }
            }
        }

        result
    }
}
