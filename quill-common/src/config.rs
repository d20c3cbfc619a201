//! Runtime configuration for the concurrency manager and its pools.

use std::time::Duration;

use crate::error::{QuillError, QuillResult};

/// Queue capacities above this value silently select an unbounded queue,
/// mirroring the historical behavior of the write service configuration.
pub const UNBOUNDED_QUEUE_THRESHOLD: usize = 5000;

/// Caller-side latency policy applied when a bounded task queue approaches
/// saturation.
///
/// The historical implementation hard-wired the threshold and delay behind a
/// compile-time switch; here backpressure is an explicit, configurable policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressurePolicy {
    /// Whether admission applies dynamic latency at all.
    pub enabled: bool,
    /// Queue fill ratio (0, 1] at which callers start sleeping.
    pub threshold: f64,
    /// Sleep applied per saturated retry.
    pub delay: Duration,
    /// Retries before admission fails with `Rejected`.
    pub retry_limit: u32,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.91,
            delay: Duration::from_millis(50),
            retry_limit: 40,
        }
    }
}

/// Configuration of the unisolated write service.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePoolConfig {
    /// Minimum resident write workers.
    pub core_pool_size: usize,
    /// Maximum write workers; must be >= the core size. Because a finished
    /// task absorbs its worker thread until the group commit returns, sizing
    /// this above the natural task parallelism grows commit groups.
    pub maximum_pool_size: usize,
    /// Idle-worker culling time for workers beyond the core size.
    pub keep_alive: Duration,
    /// Eagerly create all core workers at startup.
    pub prestart_core: bool,
    /// Task queue depth. Zero or values above `UNBOUNDED_QUEUE_THRESHOLD`
    /// select an unbounded linked queue.
    pub queue_capacity: usize,
    /// How long the first-finished task of a forming commit group waits for
    /// others to join. Zero disables grouping: every group holds one task.
    pub group_commit_timeout: Duration,
}

impl Default for WritePoolConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 10,
            maximum_pool_size: 50,
            keep_alive: Duration::from_millis(60_000),
            prestart_core: false,
            queue_capacity: 1000,
            group_commit_timeout: Duration::from_millis(100),
        }
    }
}

/// Top-level configuration of the concurrency manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    /// Transaction pool core size. Zero selects an unbounded handoff pool.
    pub tx_pool_core_size: usize,
    /// Read pool core size. Zero selects an unbounded handoff pool.
    pub read_pool_core_size: usize,
    /// Write service shape and group-commit timing.
    pub write_pool: WritePoolConfig,
    /// Budget for orderly shutdown across all pools. Zero waits forever.
    pub shutdown_timeout: Duration,
    /// Enables the once-per-second queue statistics sampler.
    pub collect_queue_statistics: bool,
    /// Admission-side saturation policy for bounded queues.
    pub backpressure: BackpressurePolicy,
    /// Bounded wait for store-manager readiness at admission.
    pub readiness_timeout: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            tx_pool_core_size: 0,
            read_pool_core_size: 0,
            write_pool: WritePoolConfig::default(),
            shutdown_timeout: Duration::from_millis(20_000),
            collect_queue_statistics: false,
            backpressure: BackpressurePolicy::default(),
            readiness_timeout: Duration::from_secs(5),
        }
    }
}

impl ConcurrencyConfig {
    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidConfig` when the write pool maximum is
    /// below its core size, when the write pool maximum is zero, or when the
    /// backpressure threshold lies outside `(0, 1]`.
    pub fn validate(&self) -> QuillResult<()> {
        if self.write_pool.maximum_pool_size == 0 {
            return Err(QuillError::InvalidConfig(
                "write pool maximum size must be positive",
            ));
        }
        if self.write_pool.maximum_pool_size < self.write_pool.core_pool_size {
            return Err(QuillError::InvalidConfig(
                "write pool maximum size must be >= core size",
            ));
        }
        if self.backpressure.threshold <= 0.0 || self.backpressure.threshold > 1.0 {
            return Err(QuillError::InvalidConfig(
                "backpressure threshold must lie in (0, 1]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConcurrencyConfig, UNBOUNDED_QUEUE_THRESHOLD};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    fn default_config_is_valid() {
        let config = ConcurrencyConfig::default();
        assert_that!(config.validate().is_ok(), eq(true));
        assert_that!(config.write_pool.core_pool_size, eq(10_usize));
        assert_that!(config.write_pool.maximum_pool_size, eq(50_usize));
        assert_that!(config.write_pool.queue_capacity, eq(1000_usize));
        assert_that!(
            config.write_pool.group_commit_timeout,
            eq(Duration::from_millis(100))
        );
        assert_that!(UNBOUNDED_QUEUE_THRESHOLD, eq(5000_usize));
    }

    #[rstest]
    fn validate_rejects_maximum_below_core() {
        let mut config = ConcurrencyConfig::default();
        config.write_pool.maximum_pool_size = 4;
        config.write_pool.core_pool_size = 8;
        assert_that!(config.validate().is_err(), eq(true));
    }

    #[rstest]
    #[case(0.0)]
    #[case(-0.5)]
    #[case(1.5)]
    fn validate_rejects_out_of_range_threshold(#[case] threshold: f64) {
        let mut config = ConcurrencyConfig::default();
        config.backpressure.threshold = threshold;
        assert_that!(config.validate().is_err(), eq(true));
    }
}
