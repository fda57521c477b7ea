//! Service and registration retry configuration.

use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_LOG_TARGET: &str = "job_leader";

/// Backoff policy of a retrying registration.
///
/// A registration call that times out is retried at once with a doubled
/// timeout, capped at `max_registration_timeout`. Transport errors pause for
/// `error_delay`; a declined registration pauses for `refused_delay` and
/// resets the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_registration_timeout: Duration,
    pub max_registration_timeout: Duration,
    pub error_delay: Duration,
    pub refused_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_registration_timeout: Duration::from_millis(100),
            max_registration_timeout: Duration::from_secs(30),
            error_delay: Duration::from_secs(10),
            refused_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn initial_registration_timeout(mut self, timeout: Duration) -> Self {
        self.initial_registration_timeout = timeout;
        self
    }

    pub fn max_registration_timeout(mut self, timeout: Duration) -> Self {
        self.max_registration_timeout = timeout;
        self
    }

    pub fn error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    pub fn refused_delay(mut self, delay: Duration) -> Self {
        self.refused_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_registration_timeout.is_zero() {
            return Err(Error::Config(
                "initial registration timeout must be positive".to_string(),
            ));
        }
        if self.max_registration_timeout < self.initial_registration_timeout {
            return Err(Error::Config(format!(
                "max registration timeout {:?} is below the initial timeout {:?}",
                self.max_registration_timeout, self.initial_registration_timeout
            )));
        }
        if self.error_delay.is_zero() || self.refused_delay.is_zero() {
            return Err(Error::Config("retry delays must be positive".to_string()));
        }
        Ok(())
    }

    /// Timeout for the attempt after `current` timed out.
    pub(crate) fn next_timeout(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(self.max_registration_timeout)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// `log` target used by the service and everything it creates.
    pub log_target: String,
    pub retry: RetryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_target: DEFAULT_LOG_TARGET.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_config_is_valid() {
        RetryConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_max_below_initial() {
        let config = RetryConfig::default()
            .initial_registration_timeout(Duration::from_secs(5))
            .max_registration_timeout(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_delays() {
        let config = RetryConfig::default().error_delay(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_doubles_up_to_max() {
        let config = RetryConfig::default()
            .initial_registration_timeout(Duration::from_millis(100))
            .max_registration_timeout(Duration::from_millis(300));
        let second = config.next_timeout(config.initial_registration_timeout);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(config.next_timeout(second), Duration::from_millis(300));
        assert_eq!(config.next_timeout(Duration::from_millis(300)), Duration::from_millis(300));
    }
}
