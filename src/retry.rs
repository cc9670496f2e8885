//! Bounded exponential backoff for lookups.
//!
//! Only transient lookup errors are retried. Delays grow by `multiplier` per
//! attempt, are capped at `max_delay` and spread by ±`jitter` so that many
//! lookups failing together do not retry in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::{Cause, KumoError, LookupError};

/// Retry configuration for a lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied to the delay after every attempt.
    pub multiplier: f64,
    /// Relative spread applied to every delay, `0.2` means ±20%.
    pub jitter: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::with_max_attempts(1)
    }

    /// Nominal delay after the `attempt`-th failure (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Serializable form of [`RetryPolicy`], as found in configuration files.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl TryFrom<&RetrySettings> for RetryPolicy {
    type Error = KumoError;

    fn try_from(settings: &RetrySettings) -> Result<Self, KumoError> {
        let invalid = |key: &str, reason: &str| KumoError::InvalidConfiguration {
            key: format!("lookup.{key}"),
            reason: reason.to_owned(),
        };

        if !settings.multiplier.is_finite() || settings.multiplier < 1.0 {
            return Err(invalid("multiplier", "must be a finite number of at least 1.0"));
        }
        if !settings.jitter.is_finite() || settings.jitter < 0.0 {
            return Err(invalid("jitter", "must be a finite, non-negative fraction"));
        }

        Ok(Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts.max(1),
        })
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of
/// attempts. Returns the value along with the number of attempts made.
pub(crate) async fn retry_lookup<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> (u32, Result<T, Cause>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LookupError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return (attempt, Ok(value)),
            Err(err) if !err.is_transient() => {
                tracing::error!(lookup = %label, attempt, error = %err, "lookup failed permanently");
                return (attempt, Err(Cause::LookupPermanent(err)));
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(lookup = %label, attempt, error = %err, "lookup gave up");
                return (
                    attempt,
                    Err(Cause::RetryExhausted {
                        attempts: attempt,
                        last: err,
                    }),
                );
            }
            Err(err) => {
                let delay = policy.jittered(policy.delay_for(attempt));
                tracing::warn!(
                    lookup = %label,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "lookup failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<u32, LookupError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(LookupError::Transient(format!("attempt {n}")))
            } else {
                Ok(n)
            })
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 6,
        };

        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = policy.jittered(Duration::from_secs(2));
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let calls = Arc::new(AtomicU32::new(0));

        let (attempts, result) =
            retry_lookup(&RetryPolicy::default(), "lb", flaky(4, calls.clone())).await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let (attempts, result) =
            retry_lookup(&RetryPolicy::default(), "lb", flaky(6, calls.clone())).await;

        match result {
            Err(Cause::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last, LookupError::Transient("attempt 5".into()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let (attempts, result) = retry_lookup(&RetryPolicy::default(), "lb", move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<(), _>(LookupError::PermissionDenied("iam".into())))
        })
        .await;

        assert!(matches!(result, Err(Cause::LookupPermanent(_))));
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };

        let start = tokio::time::Instant::now();
        let (_, result) = retry_lookup(&policy, "lb", flaky(3, calls)).await;

        assert!(result.is_ok());
        // 2s + 4s + 8s
        assert_eq!(start.elapsed(), Duration::from_secs(14));
    }

    #[test]
    fn test_settings_into_policy() {
        let settings: RetrySettings =
            serde_json::from_str(r#"{ "base_delay_ms": 500, "max_attempts": 0 }"#).unwrap();
        let policy = RetryPolicy::try_from(&settings).unwrap();

        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_settings_reject_unusable_growth() {
        for json in [
            r#"{ "multiplier": -2.0 }"#,
            r#"{ "multiplier": 0.5 }"#,
            r#"{ "jitter": -0.1 }"#,
        ] {
            let settings: RetrySettings = serde_json::from_str(json).unwrap();
            assert!(
                matches!(RetryPolicy::try_from(&settings), Err(KumoError::InvalidConfiguration { .. })),
                "{json}"
            );
        }

        let settings = RetrySettings {
            jitter: f64::NAN,
            ..Default::default()
        };
        assert!(RetryPolicy::try_from(&settings).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_delay_never_goes_negative() {
        let policy = RetryPolicy {
            multiplier: -2.0,
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(2), Duration::ZERO);

        let calls = Arc::new(AtomicU32::new(0));
        let (attempts, result) = retry_lookup(&policy, "lb", flaky(2, calls)).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }
}
