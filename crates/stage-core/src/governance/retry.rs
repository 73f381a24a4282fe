//! Adaptive backoff: combines a retryable error's baseline wait with
//! observed congestion (queue backlog) and latency (RTT), plus jitter, so
//! that many clients retrying at once don't synchronize (spec §4.3
//! "exponential backoff retry").

use std::time::Duration;

use rand::Rng;

const MIN_COOLDOWN: Duration = Duration::from_millis(50);
const MAX_WAIT: Duration = Duration::from_secs(30);
const BACKLOG_CEILING: f64 = 64.0;
const BACKLOG_WEIGHT: f64 = 1.5;
const BASELINE_RTT_MS: f64 = 50.0;
const RTT_WEIGHT: f64 = 0.75;
const MAX_RTT_RATIO: f64 = 8.0;
const JITTER_FRACTION: f64 = 0.1;

/// Computes the wait duration for the next retry attempt.
///
/// `backlog` is a non-negative measure of outstanding work (e.g. consecutive
/// failed attempts); `rtt` is the most recently observed round-trip latency;
/// `base` is the error's baseline backoff. The result is clamped to
/// `[max(base, MIN_COOLDOWN), MAX_WAIT]` and carries up to ±10% jitter.
pub fn compute_backoff(backlog: u32, rtt: Duration, base: Duration) -> Duration {
    let cooled_base = base.max(MIN_COOLDOWN);

    let capped_backlog = (backlog as f64).min(BACKLOG_CEILING);
    let backlog_pressure = 1.0 + BACKLOG_WEIGHT * (capped_backlog / BACKLOG_CEILING).powf(1.35);

    let rtt_ratio = (rtt.as_secs_f64() * 1000.0 / BASELINE_RTT_MS).clamp(0.0, MAX_RTT_RATIO);
    let rtt_pressure = 1.0 + RTT_WEIGHT * rtt_ratio;

    let mut wait_secs = cooled_base.as_secs_f64() * backlog_pressure * rtt_pressure;

    let jitter = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    wait_secs *= jitter;

    let wait_secs = wait_secs.clamp(cooled_base.as_secs_f64(), MAX_WAIT.as_secs_f64());
    Duration::from_secs_f64(wait_secs)
}
