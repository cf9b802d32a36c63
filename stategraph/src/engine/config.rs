//! Runtime configuration
//!
//! Step guard, map parallelism, checkpoint cadence, timeouts, and retry
//! backoff. Built from a definition's `defaults:` block and adjustable by the
//! caller through the `with_*` builders.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::definition::Defaults;

/// Graph runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum node steps per run before forced termination
    pub max_steps: usize,

    /// Maximum concurrent map tasks
    pub parallelism: usize,

    /// Checkpoint frequency (every N steps, 0 = only on suspension and completion)
    pub checkpoint_interval: usize,

    /// Checkpoints kept per thread after each save; `None` keeps the full history
    #[serde(default)]
    pub checkpoint_retention: Option<usize>,

    /// Timeout for a single node attempt
    #[serde(default, with = "humantime_serde")]
    pub node_timeout: Option<Duration>,

    /// Timeout for a whole run
    #[serde(default, with = "humantime_serde")]
    pub workflow_timeout: Option<Duration>,

    /// Backoff applied between retries of nodes with `on_error: retry`
    pub retry_policy: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            parallelism: num_cpus::get(),
            checkpoint_interval: 1,
            checkpoint_retention: None,
            node_timeout: None,
            workflow_timeout: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration described by a definition's `defaults:` block
    pub fn from_defaults(defaults: &Defaults) -> Self {
        Self {
            max_steps: defaults.max_steps,
            parallelism: defaults.parallelism.unwrap_or_else(num_cpus::get).max(1),
            checkpoint_interval: defaults.checkpoint_interval,
            checkpoint_retention: defaults.checkpoint_retention.map(|keep| keep.max(1)),
            node_timeout: defaults.node_timeout,
            workflow_timeout: defaults.workflow_timeout,
            retry_policy: RetryPolicy::new(defaults.max_retries)
                .with_backoff_base(defaults.backoff_base)
                .with_backoff_max(defaults.backoff_max),
        }
    }

    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Prune each thread to its `keep` most recent checkpoints (at least one)
    pub fn with_checkpoint_retention(mut self, keep: usize) -> Self {
        self.checkpoint_retention = Some(keep.max(1));
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Whether a mid-run checkpoint is due after `step`
    #[allow(clippy::manual_is_multiple_of)]
    pub fn should_checkpoint(&self, step: usize) -> bool {
        self.checkpoint_interval > 0 && step > 0 && step % self.checkpoint_interval == 0
    }
}

/// Retry bound and exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default retry bound for nodes that do not set `max_retries`
    pub max_retries: usize,

    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Delay before retry number `attempt` (0-based), doubling each time
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt as u32);
        let delay = self.backoff_base.saturating_mul(multiplier);
        delay.min(self.backoff_max)
    }

    /// No retries and no delay
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::ZERO,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_defaults() {
        let defaults = Defaults {
            max_steps: 7,
            parallelism: Some(0),
            node_timeout: Some(Duration::from_secs(2)),
            max_retries: 5,
            backoff_base: Duration::from_millis(10),
            checkpoint_retention: Some(0),
            ..Default::default()
        };
        let config = RuntimeConfig::from_defaults(&defaults);

        assert_eq!(config.max_steps, 7);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.node_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.workflow_timeout, None);
        assert_eq!(config.retry_policy.max_retries, 5);
        assert_eq!(config.checkpoint_retention, Some(1));
        assert_eq!(config.retry_policy.delay_for_attempt(1), Duration::from_millis(20));
    }

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::default()
            .with_max_steps(50)
            .with_parallelism(4)
            .with_checkpoint_interval(5)
            .with_checkpoint_retention(0)
            .with_workflow_timeout(Duration::from_secs(30));

        assert_eq!(config.max_steps, 50);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.workflow_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.checkpoint_retention, Some(1));
        assert_eq!(RuntimeConfig::default().with_parallelism(0).parallelism, 1);
        assert_eq!(RuntimeConfig::default().checkpoint_retention, None);
    }

    #[test]
    fn test_should_checkpoint() {
        let config = RuntimeConfig::default().with_checkpoint_interval(5);
        assert!(!config.should_checkpoint(0));
        assert!(!config.should_checkpoint(1));
        assert!(config.should_checkpoint(5));
        assert!(config.should_checkpoint(10));

        let disabled = config.with_checkpoint_interval(0);
        assert!(!disabled.should_checkpoint(5));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));

        let capped = policy.with_backoff_max(Duration::from_millis(300));
        assert_eq!(capped.delay_for_attempt(10), Duration::from_millis(300));
        assert_eq!(RetryPolicy::no_retry().delay_for_attempt(3), Duration::ZERO);
    }
}
