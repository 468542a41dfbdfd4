#![forbid(unsafe_code)]

//! Pacing and the retry policy shared by search, acquisition and finalize.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::DelayRange;
use crate::error::{FailureClass, HarvestError};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);

    /// True once pending work should stop instead of retrying.
    fn interrupted(&self) -> bool {
        false
    }
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Sleeps in short slices and returns early once the shutdown flag is set.
pub struct InterruptibleSleeper {
    shutdown: Arc<AtomicBool>,
}

impl InterruptibleSleeper {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self { shutdown }
    }
}

impl Sleeper for InterruptibleSleeper {
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Draws randomized pauses and hands them to a [`Sleeper`].
#[derive(Clone)]
pub struct Pacer {
    sleeper: Arc<dyn Sleeper>,
}

impl Pacer {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        Self { sleeper }
    }

    pub fn pause(&self, range: DelayRange) {
        let duration = range.sample();
        if !duration.is_zero() {
            log::debug!("Sleeping {:.1}s", duration.as_secs_f64());
        }
        self.sleeper.sleep(duration);
    }

    pub fn interrupted(&self) -> bool {
        self.sleeper.interrupted()
    }
}

/// Retry budget. Blocked responses have their own budget and longer backoff so
/// a burst of anti-automation answers does not eat the transient budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts for transient failures, including the first one.
    pub max_attempts: u32,
    /// Retries allowed after blocked responses.
    pub max_blocked_attempts: u32,
    pub transient_backoff: DelayRange,
    pub blocked_backoff: DelayRange,
}

impl RetryPolicy {
    /// Calls `operation` with the 1-based attempt number until it succeeds,
    /// fails with a terminal or skip class, or a budget runs out. The last
    /// error is returned on exhaustion. No retry is started once the pacer
    /// reports an interruption.
    pub fn run<T>(
        &self,
        pacer: &Pacer,
        label: &str,
        mut operation: impl FnMut(u32) -> Result<T, HarvestError>,
    ) -> Result<T, HarvestError> {
        let mut attempt = 0u32;
        let mut failures = 0u32;
        let mut blocked = 0u32;
        loop {
            attempt += 1;
            let err = match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match err.class() {
                FailureClass::Blocked if blocked < self.max_blocked_attempts => {
                    blocked += 1;
                    log::warn!(
                        "{label}: {err}; backing off ({blocked}/{})",
                        self.max_blocked_attempts
                    );
                    pacer.pause(self.blocked_backoff);
                }
                FailureClass::Transient if failures + 1 < self.max_attempts => {
                    failures += 1;
                    log::warn!(
                        "{label}: attempt {attempt} failed: {err}; retrying ({failures}/{})",
                        self.max_attempts.saturating_sub(1)
                    );
                    pacer.pause(self.transient_backoff);
                }
                FailureClass::Skip => return Err(err),
                _ => {
                    log::warn!("{label}: giving up after attempt {attempt}: {err}");
                    return Err(err);
                }
            }
            if pacer.interrupted() {
                log::warn!("{label}: not retrying after shutdown request");
                return Err(HarvestError::Interrupted);
            }
        }
    }
}
