use crate::config::RetryConfig;
use crate::domain::app::App;
use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Exponential backoff for failed deliveries: `base * 2^n`, capped, plus up to `jitter`
/// of the delay at random.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
    pub jitter: f64,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_ms),
            cap: Duration::from_millis(config.retry_cap_ms),
            max_retries: config.max_retries,
            jitter: config.retry_jitter,
        }
    }

    /// The global policy with the app's overrides applied.
    ///
    /// # Errors
    /// Returns `Error::Configuration` if the overrides leave a zero base delay or set a cap below it.
    pub fn for_app(&self, app: &App) -> Result<Self> {
        let overrides = app.retry;
        let base = overrides.base_ms.map_or(self.base, Duration::from_millis);
        // The global cap stretches to fit an app's larger base; an explicit app cap does not.
        let cap = overrides.cap_ms.map_or(self.cap.max(base), Duration::from_millis);
        if base.is_zero() {
            return Err(Error::Configuration(format!("app {} has a zero retry base delay", app.id)));
        }
        if cap < base {
            return Err(Error::Configuration(format!("app {} has a retry cap below its base delay", app.id)));
        }
        Ok(Self { base, cap, max_retries: overrides.max_retries.unwrap_or(self.max_retries), jitter: self.jitter })
    }

    /// Deterministic delay before retry number `retry_count + 1`.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Decides what happens to a notification that has already been retried `retry_count` times.
    #[must_use]
    pub fn next_attempt(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_for(retry_count);
        let jitter = if self.jitter > 0.0 { rand::thread_rng().gen_range(0.0..self.jitter) } else { 0.0 };
        RetryDecision::Retry { delay: delay.mul_f64(1.0 + jitter).min(self.cap) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::app::{BackendKind, Credential, CredentialMaterial, RetryOverrides};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_retries: 8,
            jitter: 0.2,
        }
    }

    #[test]
    fn test_delay_strictly_increases_until_cap() {
        let policy = policy();
        let mut previous = Duration::ZERO;
        for n in 0..6 {
            let delay = policy.delay_for(n);
            assert!(delay > previous, "delay for {n} should grow");
            previous = delay;
        }
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_delay_stays_between_base_delay_and_next_step() {
        let policy = policy();
        for n in 0..5 {
            for _ in 0..50 {
                let RetryDecision::Retry { delay } = policy.next_attempt(n) else {
                    unreachable!("below max_retries")
                };
                assert!(delay >= policy.delay_for(n));
                assert!(delay < policy.delay_for(n + 1));
            }
        }
    }

    #[test]
    fn test_gives_up_at_max_retries() {
        let policy = policy();
        assert!(matches!(policy.next_attempt(7), RetryDecision::Retry { .. }));
        assert_eq!(policy.next_attempt(8), RetryDecision::GiveUp);
        assert_eq!(policy.next_attempt(100), RetryDecision::GiveUp);
    }

    fn app_with(retry: RetryOverrides) -> App {
        let mut app = App::new(
            "ios",
            BackendKind::Apns,
            Credential { material: CredentialMaterial::ApiKey { secret: String::new() }, expires_at: None },
        );
        app.retry = retry;
        app
    }

    #[test]
    fn test_app_overrides_win() {
        let app = app_with(RetryOverrides { base_ms: Some(10), cap_ms: None, max_retries: Some(2) });

        let effective = policy().for_app(&app).unwrap();
        assert_eq!(effective.base, Duration::from_millis(10));
        assert_eq!(effective.cap, Duration::from_secs(60));
        assert_eq!(effective.max_retries, 2);
    }

    #[test]
    fn test_overrides_that_break_backoff_are_rejected() {
        let zero_base = app_with(RetryOverrides { base_ms: Some(0), cap_ms: None, max_retries: None });
        assert!(matches!(policy().for_app(&zero_base), Err(Error::Configuration(msg)) if msg.contains("zero")));

        let low_cap = app_with(RetryOverrides { base_ms: Some(5_000), cap_ms: Some(1_000), max_retries: None });
        assert!(matches!(policy().for_app(&low_cap), Err(Error::Configuration(_))));

        let above_global_cap = app_with(RetryOverrides { base_ms: Some(90_000), cap_ms: None, max_retries: None });
        assert_eq!(policy().for_app(&above_global_cap).unwrap().cap, Duration::from_secs(90));
    }
}
