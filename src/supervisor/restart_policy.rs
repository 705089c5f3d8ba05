use serde::Deserialize;
use std::cmp::max;
use std::fmt;
use std::time::Duration;

/// Delay between an exit and the next launch when nothing else is configured.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Uptime after which a child is considered healthy again.
///
/// A child that stayed up longer than this restarts the backoff sequence from the base delay.
pub const LAST_RETRY_INTERVAL: Duration = Duration::new(30, 0);

/// Upper bound for the restart counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxRestarts {
    Limited(u32),
    #[default]
    Unlimited,
}

impl From<Option<u32>> for MaxRestarts {
    fn from(value: Option<u32>) -> Self {
        value.map_or(MaxRestarts::Unlimited, MaxRestarts::Limited)
    }
}

impl fmt::Display for MaxRestarts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxRestarts::Limited(n) => write!(f, "{n}"),
            MaxRestarts::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// How the restart delay grows between consecutive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Rules governing delay and maximum attempts between restarts. Immutable once built.
///
/// Any exit counts towards the policy, successful ones included: the supervised workload is
/// expected to run forever.
#[derive(Clone, Debug, PartialEq)]
pub struct RestartPolicy {
    restart_delay: Duration,
    max_restarts: MaxRestarts,
    test_mode: bool,
    backoff: BackoffStrategy,
    last_retry_interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::new(DEFAULT_RESTART_DELAY)
    }
}

impl RestartPolicy {
    pub fn new(restart_delay: Duration) -> Self {
        Self {
            restart_delay,
            max_restarts: MaxRestarts::Unlimited,
            test_mode: false,
            backoff: BackoffStrategy::Fixed,
            last_retry_interval: LAST_RETRY_INTERVAL,
        }
    }

    pub fn with_max_restarts(self, max_restarts: MaxRestarts) -> Self {
        Self {
            max_restarts,
            ..self
        }
    }

    /// In test mode the command runs once and is never restarted.
    pub fn with_test_mode(self, test_mode: bool) -> Self {
        Self { test_mode, ..self }
    }

    pub fn with_backoff(self, backoff: BackoffStrategy) -> Self {
        Self { backoff, ..self }
    }

    pub fn with_last_retry_interval(self, last_retry_interval: Duration) -> Self {
        Self {
            last_retry_interval,
            ..self
        }
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn max_restarts(&self) -> MaxRestarts {
        self.max_restarts
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn backoff_strategy(&self) -> BackoffStrategy {
        self.backoff
    }

    /// Whether one more restart fits in the budget after `restarts` already performed.
    pub fn allows_restart(&self, restarts: u32) -> bool {
        match self.max_restarts {
            MaxRestarts::Limited(max) => restarts < max,
            MaxRestarts::Unlimited => true,
        }
    }

    /// A fresh delay sequence for one supervisor session.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            strategy: self.backoff,
            initial_delay: self.restart_delay,
            last_retry_interval: self.last_retry_interval,
            tries: 0,
        }
    }
}

/// Mutable side of the policy: tracks consecutive quick failures to compute the next delay.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    strategy: BackoffStrategy,
    initial_delay: Duration,
    last_retry_interval: Duration,
    tries: u32,
}

impl Backoff {
    /// Delay before the next launch, given how long the previous child stayed up.
    /// Never shorter than the configured restart delay.
    pub fn next_delay(&mut self, uptime: Duration) -> Duration {
        if uptime > self.last_retry_interval {
            self.tries = 0
        }
        self.tries = self.tries.saturating_add(1);

        match self.strategy {
            BackoffStrategy::Fixed => fixed(self.tries, self.initial_delay),
            BackoffStrategy::Linear => linear(self.tries, self.initial_delay),
            BackoffStrategy::Exponential => exponential(self.tries, self.initial_delay),
        }
    }
}

/// fixed always returns the initial delay
pub fn fixed(_: u32, initial_delay: Duration) -> Duration {
    initial_delay
}

/// linear grows the delay by the initial delay on every try
pub fn linear(tries: u32, initial_delay: Duration) -> Duration {
    initial_delay.saturating_mul(max(tries, 1))
}

/// exponential doubles the delay on every try
pub fn exponential(tries: u32, initial_delay: Duration) -> Duration {
    let base: u32 = 2;
    initial_delay.saturating_mul(base.saturating_pow(max(tries, 1) - 1))
}
