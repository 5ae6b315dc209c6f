//! Bounded polling.
//!
//! Remote side effects (buffer creation, files appearing on other nodes)
//! have no synchronous ready signal, so the master polls. Every poll loop in
//! the crate goes through [`poll_until`], which always terminates: it either
//! sees the condition, runs out of time, or hits a hard error.

use std::time::{Duration, Instant};

use rand::Rng;

/// What one probe of the condition reported.
pub enum Poll<T> {
    Ready(T),
    NotReady,
}

/// How a bounded poll ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    Ready(T),
    /// The deadline passed without the condition holding. Callers degrade
    /// gracefully: report what is there, not hang for the rest.
    Timeout,
    Failed(E),
}

impl<T, E> PollOutcome<T, E> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// How much the interval stretches after each unsuccessful probe, and the
/// cap on that stretch.
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_MAX: f64 = 4.0;

/// Probe `f` at `interval` until it is ready or `timeout` has elapsed.
///
/// The first probe happens immediately. The sleep between probes backs off
/// gently and gets a small random jitter, so forty nodes polled from one
/// master do not line up.
pub fn poll_until<T, E, F>(interval: Duration, timeout: Duration, mut f: F) -> PollOutcome<T, E>
where
    F: FnMut() -> Result<Poll<T>, E>,
{
    let deadline = Instant::now() + timeout;
    let mut rng = rand::thread_rng();
    let mut stretch = 1.0;
    loop {
        match f() {
            Ok(Poll::Ready(value)) => return PollOutcome::Ready(value),
            Ok(Poll::NotReady) => (),
            Err(e) => return PollOutcome::Failed(e),
        }
        if Instant::now() >= deadline {
            return PollOutcome::Timeout;
        }
        let jitter: f64 = rng.gen_range(0.8..1.2);
        let sleep = interval.mul_f64(stretch * jitter);
        stretch = (stretch * BACKOFF_FACTOR).min(BACKOFF_MAX);
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(sleep.min(remaining));
    }
}
