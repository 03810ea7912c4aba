//! Per-target circuit breakers.
//!
//! A breaker is created lazily on the first call to a target and lives for the
//! process lifetime. Its mutex is only taken to admit a call or record its
//! outcome, never across the call itself.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct BreakerSettings {
    /// Consecutive counted failures that open the breaker.
    pub failure_threshold: u32,
    /// Failures older than this no longer count towards the threshold.
    pub failure_window: Duration,
    /// Cool-down before a half-open trial call is admitted.
    pub open_duration: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    Closed {
        consecutive_failures: u32,
        window_start: Instant,
    },
    Open {
        reopen_at: Instant,
    },
    HalfOpen,
}

impl BreakerState {
    fn closed() -> Self {
        BreakerState::Closed {
            consecutive_failures: 0,
            window_start: Instant::now(),
        }
    }

    fn phase(&self) -> BreakerPhase {
        match self {
            BreakerState::Closed { .. } => BreakerPhase::Closed,
            BreakerState::Open { .. } => BreakerPhase::Open,
            BreakerState::HalfOpen => BreakerPhase::HalfOpen,
        }
    }
}

struct Breaker {
    target: String,
    settings: BreakerSettings,
    state: Mutex<BreakerState>,
}

impl Breaker {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, state: &mut BreakerState) {
        *state = BreakerState::Open {
            reopen_at: Instant::now() + self.settings.open_duration,
        };
        warn!(target_service = %self.target, reopen_in = ?self.settings.open_duration, "circuit breaker opened");
        self.event("open");
    }

    fn event(&self, state: &'static str) {
        counter!(
            "imp_rpc_breaker_events_total",
            "target" => self.target.clone(),
            "state" => state,
        )
        .increment(1);
    }
}

/// Admission ticket for one call. Dropping it unsettled (for example when the
/// caller is cancelled) returns a half-open breaker to open with no cool-down,
/// so the next call may try again.
pub struct Permit {
    breaker: Arc<Breaker>,
    trial: bool,
    settled: bool,
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The target answered. Application-level failures land here too.
    pub fn succeed(mut self) {
        self.settled = true;
        let mut state = self.breaker.lock();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
                ..
            } => {
                if *consecutive_failures > 0 {
                    debug!(failures = *consecutive_failures, "resetting failure counter");
                }
                *consecutive_failures = 0;
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => {
                info!(target_service = %self.breaker.target, "circuit breaker closed");
                self.breaker.event("closed");
                *state = BreakerState::closed();
            }
        }
    }

    /// Transport or availability failure.
    pub fn fail(mut self) {
        self.settled = true;
        let breaker = Arc::clone(&self.breaker);
        let mut state = breaker.lock();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
                window_start,
            } => {
                // The window opens at the first failure of a run.
                let now = Instant::now();
                if *consecutive_failures == 0
                    || now.duration_since(*window_start) > breaker.settings.failure_window
                {
                    *consecutive_failures = 0;
                    *window_start = now;
                }
                *consecutive_failures += 1;
                if *consecutive_failures >= breaker.settings.failure_threshold {
                    breaker.open(&mut state);
                }
            }
            BreakerState::HalfOpen => breaker.open(&mut state),
            BreakerState::Open { .. } => {}
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut state = self.breaker.lock();
        if matches!(*state, BreakerState::HalfOpen) {
            *state = BreakerState::Open {
                reopen_at: Instant::now(),
            };
        }
    }
}

/// Breakers keyed by target name.
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Arc::new(DashMap::new()),
        }
    }

    fn breaker(&self, target: &str) -> Arc<Breaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(Breaker {
                    target: target.to_string(),
                    settings: self.settings.clone(),
                    state: Mutex::new(BreakerState::closed()),
                })
            });
        Arc::clone(entry.value())
    }

    /// Admits a call, or returns `None` when the breaker is open or a half-open
    /// trial is already in flight.
    pub fn acquire(&self, target: &str) -> Option<Permit> {
        let breaker = self.breaker(target);
        let trial = {
            let mut state = breaker.lock();
            match *state {
                BreakerState::Closed { .. } => false,
                BreakerState::HalfOpen => return None,
                BreakerState::Open { reopen_at } => {
                    if Instant::now() < reopen_at {
                        return None;
                    }
                    *state = BreakerState::HalfOpen;
                    info!(target_service = %breaker.target, "circuit breaker half-open trial call");
                    breaker.event("half_open");
                    true
                }
            }
        };
        Some(Permit {
            breaker,
            trial,
            settled: false,
        })
    }

    pub fn phase(&self, target: &str) -> Option<BreakerPhase> {
        self.breakers
            .get(target)
            .map(|breaker| breaker.lock().phase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32) -> BreakerRegistry {
        BreakerRegistry::new(BreakerSettings {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_admits_one_trial() {
        let breakers = registry(3);
        for _ in 0..3 {
            breakers.acquire("gw").unwrap().fail();
        }
        assert_eq!(breakers.phase("gw"), Some(BreakerPhase::Open));
        assert!(breakers.acquire("gw").is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = breakers.acquire("gw").unwrap();
        assert!(trial.is_trial());
        assert!(breakers.acquire("gw").is_none());
        trial.succeed();
        assert_eq!(breakers.phase("gw"), Some(BreakerPhase::Closed));
        assert!(breakers.acquire("gw").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_fresh_cooldown() {
        let breakers = registry(1);
        breakers.acquire("gw").unwrap().fail();
        tokio::time::advance(Duration::from_secs(30)).await;
        breakers.acquire("gw").unwrap().fail();
        assert_eq!(breakers.phase("gw"), Some(BreakerPhase::Open));
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breakers.acquire("gw").is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breakers.acquire("gw").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failures_fall_out_of_the_window() {
        let breakers = registry(2);
        breakers.acquire("gw").unwrap().fail();
        tokio::time::advance(Duration::from_secs(61)).await;
        breakers.acquire("gw").unwrap().fail();
        assert_eq!(breakers.phase("gw"), Some(BreakerPhase::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn window_starts_at_the_first_failure() {
        let breakers = registry(2);
        breakers.acquire("gw").unwrap().succeed();
        tokio::time::advance(Duration::from_secs(59)).await;
        breakers.acquire("gw").unwrap().fail();
        tokio::time::advance(Duration::from_secs(2)).await;
        breakers.acquire("gw").unwrap().fail();
        assert_eq!(breakers.phase("gw"), Some(BreakerPhase::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_releases_half_open() {
        let breakers = registry(1);
        breakers.acquire("gw").unwrap().fail();
        tokio::time::advance(Duration::from_secs(30)).await;
        drop(breakers.acquire("gw").unwrap());
        assert!(breakers.acquire("gw").unwrap().is_trial());
    }

    #[test]
    fn targets_are_independent() {
        let breakers = registry(1);
        breakers.acquire("a").unwrap().fail();
        assert!(breakers.acquire("a").is_none());
        assert!(breakers.acquire("b").is_some());
    }
}
