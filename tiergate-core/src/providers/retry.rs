//! Retry policy and executor for single-candidate attempts
//!
//! The executor wraps one (provider, model) candidate. It consults the
//! circuit breaker before every attempt, backs off between retryable
//! failures and reports the candidate's final outcome to the breaker.

use super::error::{GatewayError, GatewayResult};
use crate::circuit::{CircuitRegistry, CircuitStatus};
use crate::config::RetrySettings;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff and retry limits for one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    /// Fraction of the delay randomised in both directions (0.0 to 1.0)
    pub jitter_factor: f64,
    pub respect_retry_after: bool,
    /// Upper bound on time spent retrying one candidate
    pub timeout_ms: Option<u64>,
    pub retry_on_zero_output: bool,
    pub zero_output_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay_ms: settings.initial_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            exponential_base: settings.exponential_base,
            jitter_factor: settings.jitter_factor,
            respect_retry_after: settings.respect_retry_after,
            timeout_ms: settings.timeout_ms,
            retry_on_zero_output: settings.retry_on_zero_output,
            zero_output_max_retries: settings.zero_output_max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Single attempt, nothing retried
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            zero_output_max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (zero based)
    pub fn calculate_delay(&self, attempt: u32, error: &GatewayError) -> Duration {
        if self.respect_retry_after {
            if let Some(retry_after) = error.retry_after() {
                return retry_after.min(Duration::from_millis(self.max_delay_ms));
            }
        }

        let base_delay = self.initial_delay_ms as f64 * self.exponential_base.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let delay_with_jitter = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_millis(delay_with_jitter as u64)
    }

    /// Whether another attempt is allowed after `error`
    ///
    /// `attempt` counts retries already made; zero-output failures are
    /// additionally capped by their own budget.
    pub fn should_retry(&self, error: &GatewayError, attempt: u32, zero_output_retries: u32) -> bool {
        if attempt >= self.max_retries || !error.is_retryable() {
            return false;
        }
        if matches!(error, GatewayError::ZeroOutputTokens { .. }) {
            return self.retry_on_zero_output && zero_output_retries < self.zero_output_max_retries;
        }
        true
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct AttemptOptions {
    /// Health probe: bypasses the breaker gate and never records failures
    pub probe: bool,
    /// Deadline applied to each individual attempt
    pub attempt_timeout: Option<Duration>,
}

impl AttemptOptions {
    pub fn probe() -> Self {
        Self {
            probe: true,
            attempt_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// Result of running one candidate
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: GatewayResult<T>,
    /// Attempts actually sent upstream
    pub attempts: u32,
    pub total_delay: Duration,
}

/// Runs attempts for one candidate against the shared circuit registry
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    circuits: Arc<CircuitRegistry>,
}

impl RetryExecutor {
    pub fn new(circuits: Arc<CircuitRegistry>) -> Self {
        Self { circuits }
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    /// Execute `operation` for `provider` under `policy`
    pub async fn execute<F, Fut, T>(
        &self,
        provider: &str,
        policy: &RetryPolicy,
        options: &AttemptOptions,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let started = Instant::now();
        let mut retries = 0u32;
        let mut zero_output_retries = 0u32;
        let mut attempts = 0u32;
        let mut total_delay = Duration::ZERO;

        let finish = |result: GatewayResult<T>, attempts: u32, total_delay: Duration| RetryOutcome {
            result,
            attempts,
            total_delay,
        };

        loop {
            let probing = if options.probe {
                false
            } else {
                if !self.circuits.is_call_allowed(provider) {
                    debug!("Circuit for '{}' denied attempt {}", provider, attempts + 1);
                    return finish(
                        Err(GatewayError::ProviderUnavailable {
                            provider: provider.to_string(),
                        }),
                        attempts,
                        total_delay,
                    );
                }
                self.circuits.status(provider) == CircuitStatus::HalfOpen
            };

            attempts += 1;
            let result = match options.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation(attempts)).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::UpstreamTimeout(limit)),
                },
                None => operation(attempts).await,
            };

            let error = match result {
                Ok(value) => {
                    self.circuits.record_success(provider);
                    return finish(Ok(value), attempts, total_delay);
                }
                Err(error) => error,
            };

            if options.probe {
                return finish(Err(error), attempts, total_delay);
            }

            if !error.trips_circuit() {
                self.circuits.release_probe(provider);
                return finish(Err(error), attempts, total_delay);
            }

            let budget_left = !probing
                && policy.should_retry(&error, retries, zero_output_retries)
                && policy
                    .timeout_ms
                    .map_or(true, |limit| started.elapsed() < Duration::from_millis(limit));

            if !budget_left {
                warn!(
                    "Provider '{}' failed after {} attempt(s): {}",
                    provider, attempts, error
                );
                self.circuits.record_failure(provider);
                return finish(Err(error), attempts, total_delay);
            }

            if matches!(error, GatewayError::ZeroOutputTokens { .. }) {
                zero_output_retries += 1;
            }
            let delay = policy.calculate_delay(retries, &error);
            debug!(
                "Attempt {} on '{}' failed ({}), retrying in {:?}",
                attempts, provider, error, delay
            );
            total_delay += delay;
            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerSettings;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            exponential_base: 2.0,
            jitter_factor: 0.0,
            respect_retry_after: true,
            timeout_ms: None,
            retry_on_zero_output: true,
            zero_output_max_retries: 1,
        }
    }

    fn executor(threshold: u32) -> RetryExecutor {
        RetryExecutor::new(Arc::new(CircuitRegistry::new(CircuitBreakerSettings {
            failure_threshold: threshold,
            recovery_timeout: 60,
        })))
    }

    fn server_error() -> GatewayError {
        GatewayError::Upstream {
            status: 503,
            message: "overloaded".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = fixed_policy(5);
        let err = server_error();
        let delays: Vec<u128> = (0..5)
            .map(|attempt| policy.calculate_delay(attempt, &err).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let policy = fixed_policy(3);
        let err = GatewayError::Upstream {
            status: 429,
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_millis(700)),
        };
        assert_eq!(policy.calculate_delay(0, &err), Duration::from_millis(700));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..fixed_policy(3)
        };
        for _ in 0..50 {
            let delay = policy.calculate_delay(0, &server_error()).as_millis();
            assert!((50..=150).contains(&delay));
        }
    }

    #[test]
    fn test_zero_output_has_its_own_cap() {
        let policy = fixed_policy(3);
        let err = GatewayError::ZeroOutputTokens {
            provider: "p".to_string(),
            model: "m".to_string(),
        };
        assert!(policy.should_retry(&err, 0, 0));
        assert!(!policy.should_retry(&err, 1, 1));

        let disabled = RetryPolicy {
            retry_on_zero_output: false,
            ..fixed_policy(3)
        };
        assert!(!disabled.should_retry(&err, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let executor = executor(5);
        let calls = AtomicU32::new(0);
        let outcome = executor
            .execute("p", &fixed_policy(2), &AttemptOptions::default(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(server_error())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(300));
        assert_eq!(executor.circuits().snapshot_of("p").unwrap().total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_records_one_failure() {
        let executor = executor(5);
        let outcome: RetryOutcome<()> = executor
            .execute("p", &fixed_policy(2), &AttemptOptions::default(), |_| async {
                Err(server_error())
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        let snapshot = executor.circuits().snapshot_of("p").unwrap();
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_client_fault_is_not_retried_or_recorded() {
        let executor = executor(1);
        let outcome: RetryOutcome<()> = executor
            .execute("p", &fixed_policy(3), &AttemptOptions::default(), |_| async {
                Err(GatewayError::Upstream {
                    status: 400,
                    message: "bad".to_string(),
                    retry_after: None,
                })
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(executor.circuits().status("p"), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_denies_without_attempting() {
        let executor = executor(1);
        executor.circuits().record_failure("p");
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = executor
            .execute("p", &fixed_policy(3), &AttemptOptions::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(
            outcome.result,
            Err(GatewayError::ProviderUnavailable { .. })
        ));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_maps_to_upstream_timeout() {
        let executor = executor(5);
        let options = AttemptOptions::default().with_timeout(Duration::from_millis(50));
        let outcome: RetryOutcome<()> = executor
            .execute("p", &fixed_policy(0), &options, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(outcome.result, Err(GatewayError::UpstreamTimeout(_))));
    }

    #[tokio::test]
    async fn test_probe_skips_gate_and_failure_recording() {
        let executor = executor(1);
        executor.circuits().record_failure("p");
        let outcome: RetryOutcome<()> = executor
            .execute("p", &fixed_policy(3), &AttemptOptions::probe(), |_| async {
                Err(server_error())
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            executor.circuits().snapshot_of("p").unwrap().consecutive_failures,
            1
        );
    }
}
