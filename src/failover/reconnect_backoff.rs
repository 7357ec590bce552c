use std::cmp::min;
use std::time::Duration;

use crate::failover::failover_config::FailoverConfig;

/// Delays between connection attempts: the first attempt of a series waits the initial delay,
///  the second one the reconnect delay, and every further attempt multiplies the previous delay
///  by the backoff factor up to a maximum.
pub struct ReconnectBackoff {
    attempts: u32,
    next_delay: Duration,

    config_initial_delay: Duration,
    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ReconnectBackoff {
    pub fn new(config: &FailoverConfig) -> ReconnectBackoff {
        let config_factor_eighths = if config.use_reconnect_backoff {
            (config.reconnect_backoff_multiplier * 8.0).round() as u32
        }
        else {
            8
        };

        ReconnectBackoff {
            attempts: 0,
            next_delay: config.reconnect_delay,
            config_initial_delay: config.initial_reconnect_delay,
            config_max_delay: config.max_reconnect_delay,
            config_factor_eighths: config_factor_eighths.max(8),
        }
    }

    /// number of delays handed out so far, i.e. the number of attempts made
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// the delay to wait before the next attempt
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts == 1 {
            return self.config_initial_delay;
        }

        let result = min(self.next_delay, self.config_max_delay);
        self.next_delay = self.next_delay.checked_mul(self.config_factor_eighths)
            .map(|d| d / 8)
            .unwrap_or(self.config_max_delay);
        self.next_delay = min(self.next_delay, self.config_max_delay);
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::default(0, 10, 30_000, true, 2.0, vec![0, 10, 20, 40, 80])]
    #[case::initial_delay(5, 10, 30_000, true, 2.0, vec![5, 10, 20, 40])]
    #[case::capped(0, 10, 35, true, 2.0, vec![0, 10, 20, 35, 35, 35])]
    #[case::factor_1_5(0, 16, 1_000, true, 1.5, vec![0, 16, 24, 36, 54])]
    #[case::no_backoff(0, 10, 30_000, false, 2.0, vec![0, 10, 10, 10])]
    #[case::factor_below_one(0, 10, 30_000, true, 0.5, vec![0, 10, 10, 10])]
    fn test_next_delay(
        #[case] initial: u64,
        #[case] reconnect: u64,
        #[case] max: u64,
        #[case] use_backoff: bool,
        #[case] multiplier: f64,
        #[case] expected: Vec<u64>,
    ) {
        let mut config = FailoverConfig::default();
        config.initial_reconnect_delay = ms(initial);
        config.reconnect_delay = ms(reconnect);
        config.max_reconnect_delay = ms(max);
        config.use_reconnect_backoff = use_backoff;
        config.reconnect_backoff_multiplier = multiplier;

        let mut backoff = ReconnectBackoff::new(&config);
        let actual = (0..expected.len())
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
        assert_eq!(backoff.attempts(), expected.len() as u32);
    }
}
