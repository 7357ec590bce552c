use std::time::Duration;

use anyhow::bail;

use crate::provider::broker_addr::BrokerAddr;

/// What happens to a request that is issued while the connection is not usable
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InterruptedRequestPolicy {
    /// the request waits (subject to its own timeout) until the connection is restored
    QueueUntilRestored,
    /// the request fails with [crate::error::ClientError::Interrupted] right away
    FailFast,
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// used when no discovery feed is configured, or when it has no candidates
    pub static_addresses: Vec<BrokerAddr>,

    /// attempts before the initial connect gives up, negative for 'unlimited'
    pub startup_max_reconnect_attempts: i32,
    /// attempts per reconnect once a connection was established, negative for 'unlimited'
    pub max_reconnect_attempts: i32,

    pub initial_reconnect_delay: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub use_reconnect_backoff: bool,
    /// >= 1.0
    pub reconnect_backoff_multiplier: f64,

    /// timeout for establishing a single transport
    pub connect_timeout: Duration,

    /// shuffle the static addresses once on startup
    pub randomize_candidates: bool,
    /// A redirect from the broker is tried on the next attempt if this is set, otherwise it
    ///  fails the connection.
    pub follow_redirects: bool,

    /// for create / start / stop / pull
    pub resource_requests_while_interrupted: InterruptedRequestPolicy,
    /// for send / acknowledge / transaction control
    pub one_shot_requests_while_interrupted: InterruptedRequestPolicy,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FailoverConfig {
    pub fn new(static_addresses: Vec<BrokerAddr>) -> FailoverConfig {
        FailoverConfig {
            static_addresses,
            startup_max_reconnect_attempts: -1,
            max_reconnect_attempts: -1,
            initial_reconnect_delay: Duration::ZERO,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(30),
            use_reconnect_backoff: true,
            reconnect_backoff_multiplier: 2.0,
            connect_timeout: Duration::from_secs(15),
            randomize_candidates: false,
            follow_redirects: false,
            resource_requests_while_interrupted: InterruptedRequestPolicy::QueueUntilRestored,
            one_shot_requests_while_interrupted: InterruptedRequestPolicy::FailFast,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconnect_backoff_multiplier < 1.0 || !self.reconnect_backoff_multiplier.is_finite() {
            bail!("reconnect backoff multiplier must be >= 1.0, is {}", self.reconnect_backoff_multiplier);
        }
        if self.max_reconnect_delay < self.reconnect_delay {
            bail!("max reconnect delay {:?} is less than reconnect delay {:?}", self.max_reconnect_delay, self.reconnect_delay);
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        Ok(())
    }

    /// `None` for 'unlimited'
    pub fn attempt_limit(&self, ever_connected: bool) -> Option<u32> {
        let raw = if ever_connected {
            self.max_reconnect_attempts
        }
        else {
            self.startup_max_reconnect_attempts
        };
        u32::try_from(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(FailoverConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::multiplier(|c: &mut FailoverConfig| c.reconnect_backoff_multiplier = 0.5)]
    #[case::multiplier_nan(|c: &mut FailoverConfig| c.reconnect_backoff_multiplier = f64::NAN)]
    #[case::max_delay(|c: &mut FailoverConfig| c.max_reconnect_delay = Duration::from_millis(1))]
    #[case::connect_timeout(|c: &mut FailoverConfig| c.connect_timeout = Duration::ZERO)]
    fn test_invalid(#[case] modify: fn(&mut FailoverConfig)) {
        let mut config = FailoverConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::startup_unlimited(-1, 5, false, None)]
    #[case::startup_limited(3, -1, false, Some(3))]
    #[case::reconnect_unlimited(3, -1, true, None)]
    #[case::reconnect_limited(3, 7, true, Some(7))]
    #[case::zero(0, 0, false, Some(0))]
    fn test_attempt_limit(#[case] startup: i32, #[case] reconnect: i32, #[case] ever_connected: bool, #[case] expected: Option<u32>) {
        let mut config = FailoverConfig::default();
        config.startup_max_reconnect_attempts = startup;
        config.max_reconnect_attempts = reconnect;
        assert_eq!(config.attempt_limit(ever_connected), expected);
    }
}
