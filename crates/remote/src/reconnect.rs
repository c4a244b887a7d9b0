//! Reconnect, heartbeat and timeout policy for the progress channel.

use std::time::Duration;

use bulkload_core::job::SourceFormat;

/// Tunable timing for one progress channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Factor by which the delay grows per attempt.
    pub growth: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Reconnect budget. `None` uses the per-format default.
    pub max_retries: Option<u32>,
    /// How often the stall check runs.
    pub heartbeat_interval: Duration,
    /// Silence longer than this on an open channel forces a reconnect.
    pub stall_threshold: Duration,
    /// Ceiling on the whole import, measured from when the channel opens.
    pub absolute_timeout: Duration,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            growth: 1.5,
            max_delay: Duration::from_millis(10_000),
            max_retries: None,
            heartbeat_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(30),
            absolute_timeout: Duration::from_secs(180),
        }
    }
}

impl ChannelPolicy {
    /// Backoff before the attempt that follows `retry_count` earlier
    /// attempts: `min(base * growth^retry_count, max)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.growth.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    pub fn max_retries_for(&self, format: SourceFormat) -> u32 {
        self.max_retries
            .unwrap_or_else(|| format.default_max_retries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence() {
        let policy = ChannelPolicy::default();
        let millis: Vec<u128> = (0..8).map(|r| policy.delay_for(r).as_millis()).collect();
        assert_eq!(millis, [1000, 1500, 2250, 3375, 5062, 7593, 10000, 10000]);
    }

    #[test]
    fn backoff_is_non_decreasing_until_cap() {
        let policy = ChannelPolicy::default();
        let mut previous = Duration::ZERO;
        for retry in 0..64 {
            let delay = policy.delay_for(retry);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn retry_budget_defaults_per_format() {
        let policy = ChannelPolicy::default();
        assert_eq!(policy.max_retries_for(SourceFormat::Csv), 3);
        assert_eq!(policy.max_retries_for(SourceFormat::Json), 5);

        let policy = ChannelPolicy {
            max_retries: Some(9),
            ..Default::default()
        };
        assert_eq!(policy.max_retries_for(SourceFormat::Csv), 9);
    }
}
