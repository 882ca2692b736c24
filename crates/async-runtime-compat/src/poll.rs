//! Bounded polling with an optional outer deadline
//!
//! Remote confirmation loops (PID discovery, port release, health checks) are
//! plain "sleep, probe, repeat" loops with a fixed attempt budget. [`Poller`]
//! keeps that per-attempt budget intact while letting callers impose an outer
//! deadline: whichever is hit first ends the loop.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::runtime_utils::sleep;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every attempt
    Fixed(Duration),
    /// `first` before the first attempt, `then` before every later one
    Escalating {
        /// Delay before the first attempt
        first: Duration,
        /// Delay before each subsequent attempt
        then: Duration,
    },
}

impl Backoff {
    /// Delay to wait before the given zero-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Escalating { first, then } => {
                if attempt == 0 {
                    first
                } else {
                    then
                }
            }
        }
    }

    /// A schedule with no delay at all
    pub fn none() -> Self {
        Backoff::Fixed(Duration::ZERO)
    }
}

/// Outcome of a single probe
#[derive(Debug)]
pub enum Probe<T, E> {
    /// The condition holds; stop polling with this value
    Ready(T),
    /// Not yet; try again if the budget allows
    Pending,
    /// Terminal failure; no further attempts
    Fatal(E),
}

/// Why polling ended without a ready value
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// Every attempt returned [`Probe::Pending`]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
    },
    /// The outer deadline passed before the attempt budget was used up
    DeadlineExceeded {
        /// Number of attempts made before the deadline
        attempts: u32,
    },
    /// A probe reported a terminal failure
    Fatal(E),
}

/// Bounded retry loop
#[derive(Debug, Clone)]
pub struct Poller {
    attempts: u32,
    backoff: Backoff,
    deadline: Option<Instant>,
}

impl Poller {
    /// Create a poller making at most `attempts` probes
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts,
            backoff,
            deadline: None,
        }
    }

    /// Stop polling once `deadline` has passed, even if attempts remain
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Optional variant of [`Poller::with_deadline`]
    pub fn with_optional_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Maximum number of probes
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Total time spent sleeping if every attempt is used
    pub fn budget(&self) -> Duration {
        (0..self.attempts).map(|a| self.backoff.delay(a)).sum()
    }

    /// Run `probe` until it is ready, fails fatally, or the budget runs out
    ///
    /// The delay for an attempt is slept *before* the probe runs. `probe`
    /// receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut probe: F) -> Result<T, PollError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Probe<T, E>>,
    {
        for attempt in 0..self.attempts {
            let mut delay = self.backoff.delay(attempt);
            if let Some(deadline) = self.deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(PollError::DeadlineExceeded { attempts: attempt });
                }
                delay = delay.min(deadline - now);
            }
            sleep(delay).await;

            match probe(attempt).await {
                Probe::Ready(value) => {
                    tracing::trace!(attempt, "poll condition satisfied");
                    return Ok(value);
                }
                Probe::Pending => continue,
                Probe::Fatal(e) => return Err(PollError::Fatal(e)),
            }
        }

        Err(PollError::Exhausted {
            attempts: self.attempts,
        })
    }
}
