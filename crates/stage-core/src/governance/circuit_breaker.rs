//! Circuit breaker guarding upstream calls (spec §4.3).
//!
//! Trips after `K` consecutive non-boundary failures within a window; the
//! open state blocks upstream calls for a cooldown, then half-opens for a
//! single trial call. Cursor-boundary errors never count toward the trip
//! threshold (spec §4.3, §7).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: State,
    consecutive_failures: u32,
    trip_threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(trip_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            trip_threshold,
            cooldown,
            opened_at: None,
        }
    }

    /// Returns whether a call is currently allowed through.
    pub fn allow_call(&mut self) -> bool {
        match self.state {
            State::Closed => true,
            State::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => true,
        }
    }

    /// Records a non-boundary failure; trips the breaker once the threshold
    /// is reached.
    pub fn record_failure(&mut self) {
        match self.state {
            State::HalfOpen => {
                self.trip();
            }
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.trip_threshold {
                    self.trip();
                }
            }
        }
    }

    /// Records a success, closing the breaker and resetting the counter.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = State::Closed;
        self.opened_at = None;
    }

    fn trip(&mut self) {
        self.state = State::Open;
        self.opened_at = Some(Instant::now());
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.allow_call());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow_call());
    }

    #[test]
    fn half_opens_after_cooldown_and_trial_failure_reopens() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow_call());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_breaker() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }
}
