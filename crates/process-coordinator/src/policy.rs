//! Polling bounds for lifecycle operations

use std::time::{Duration, Instant};

use async_runtime_compat::poll::{Backoff, Poller};
use serde::{Deserialize, Serialize};

/// Attempt budget and delay schedule of one confirmation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Maximum number of probes
    pub attempts: u32,
    /// Delay before every probe, in milliseconds
    pub delay_ms: u64,
    /// Delay before the first probe when it differs from `delay_ms`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_delay_ms: Option<u64>,
}

impl PollPolicy {
    /// Fixed delay between probes
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
            first_delay_ms: None,
        }
    }

    /// `first` before the first probe, `then` before every later one
    pub fn escalating(attempts: u32, first: Duration, then: Duration) -> Self {
        Self {
            attempts,
            delay_ms: then.as_millis() as u64,
            first_delay_ms: Some(first.as_millis() as u64),
        }
    }

    /// Same attempt budget without any waiting
    pub fn immediate(attempts: u32) -> Self {
        Self::fixed(attempts, Duration::ZERO)
    }

    fn backoff(&self) -> Backoff {
        let then = Duration::from_millis(self.delay_ms);
        match self.first_delay_ms {
            Some(first) => Backoff::Escalating {
                first: Duration::from_millis(first),
                then,
            },
            None => Backoff::Fixed(then),
        }
    }

    /// Build a poller, optionally cut short by `deadline`
    pub fn poller(&self, deadline: Option<Instant>) -> Poller {
        Poller::new(self.attempts, self.backoff()).with_optional_deadline(deadline)
    }

    /// Total waiting time when every attempt is used
    pub fn budget(&self) -> Duration {
        Poller::new(self.attempts, self.backoff()).budget()
    }
}

fn default_start() -> PollPolicy {
    PollPolicy::fixed(10, Duration::from_secs(1))
}

fn default_health() -> PollPolicy {
    PollPolicy::fixed(300, Duration::from_secs(3))
}

fn default_stop() -> PollPolicy {
    PollPolicy::escalating(10, Duration::from_secs(1), Duration::from_secs(3))
}

fn default_concurrency() -> usize {
    10
}

/// Bounds used by a [`Coordinator`](crate::Coordinator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorPolicy {
    /// PID discovery after launch
    #[serde(default = "default_start")]
    pub start: PollPolicy,
    /// Port binding confirmation
    #[serde(default = "default_health")]
    pub health: PollPolicy,
    /// Port release confirmation after kill
    #[serde(default = "default_stop")]
    pub stop: PollPolicy,
    /// Maximum number of servers handled at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Outer limit on any single server operation, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self {
            start: default_start(),
            health: default_health(),
            stop: default_stop(),
            concurrency: default_concurrency(),
            deadline_secs: None,
        }
    }
}

impl CoordinatorPolicy {
    /// Default attempt budgets with every delay removed
    pub fn immediate() -> Self {
        let defaults = Self::default();
        Self {
            start: PollPolicy::immediate(defaults.start.attempts),
            health: PollPolicy::immediate(defaults.health.attempts),
            stop: PollPolicy::immediate(defaults.stop.attempts),
            ..defaults
        }
    }

    /// Set the fan-out limit
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the outer deadline
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline_secs = deadline.map(|d| d.as_secs());
        self
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }
}
