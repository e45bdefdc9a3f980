//! Retry helpers shared by the process supervisor and the MQTT event loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Exponential backoff, `delay[n] = min(initial * multiplier^n, max)`.
///
/// The returned delay is never zero, a zero initial delay is bumped to one
/// second so a crashing process can not spin the CPU.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = if initial.is_zero() { Duration::from_secs(1) } else { initial };
        let max = if max < initial { initial } else { max };
        return Backoff {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier: if multiplier < 1.0 { 1.0 } else { multiplier },
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current_delay;

        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = if next > self.max_delay { self.max_delay } else { next };

        return delay;
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        return self.attempt;
    }
}

/// Counts failures inside a sliding time window
#[derive(Debug, Clone)]
pub struct FailureWindow {
    window: Duration,
    max_failures: u32,
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        return FailureWindow {
            window,
            max_failures,
            failures: VecDeque::new(),
        }
    }

    /// Records a failure, returns true once the ceiling is reached
    pub fn record(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        return self.failures.len() as u32 >= self.max_failures;
    }

    pub fn max_failures(&self) -> u32 {
        return self.max_failures;
    }

    pub fn count(&self) -> u32 {
        return self.failures.len() as u32;
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }
}
