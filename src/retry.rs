use crate::error::InferenceError;
use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,
    /// Spread retries uniformly over [delay/2, delay]
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set the maximum delay between retries
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Preset: Standard retries for inference calls (3 attempts)
    /// Delays: 1s, 2s = 3s total wait time
    pub fn inference_call() -> Self {
        Self::new(3, Duration::from_secs(1)).with_max_delay(Duration::from_secs(30))
    }

    /// Calculate the delay for a given attempt number (0-indexed), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }

    /// Delay actually applied before `attempt`, jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let max_ms = delay.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(max_ms / 2..=max_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::inference_call()
    }
}

/// Lifecycle of one translation unit.
///
/// `attempt` always counts requests already sent, so the attempt reported in
/// an outcome record is the number of calls the endpoint saw for that unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitState {
    Pending,
    Dispatched { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl UnitState {
    /// Pending or Retrying -> Dispatched. Any other state is returned unchanged.
    pub fn dispatch(self) -> UnitState {
        match self {
            UnitState::Pending => UnitState::Dispatched { attempt: 1 },
            UnitState::Retrying { attempt, .. } => UnitState::Dispatched {
                attempt: attempt + 1,
            },
            other => other,
        }
    }

    pub fn succeed(self) -> UnitState {
        match self {
            UnitState::Dispatched { attempt } => UnitState::Succeeded { attempts: attempt },
            other => other,
        }
    }

    /// Dispatched -> Retrying when the error is transient and attempts remain,
    /// otherwise Dispatched -> Failed.
    pub fn fail(self, error: &InferenceError, policy: &RetryConfig) -> UnitState {
        match self {
            UnitState::Dispatched { attempt } => {
                if error.is_retryable() && attempt < policy.max_attempts {
                    UnitState::Retrying {
                        attempt,
                        delay: policy.backoff(attempt),
                    }
                } else if error.is_retryable() {
                    UnitState::Failed {
                        attempts: attempt,
                        reason: format!("gave up after {} attempts: {}", attempt, error),
                    }
                } else {
                    UnitState::Failed {
                        attempts: attempt,
                        reason: error.to_string(),
                    }
                }
            }
            other => other,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            UnitState::Pending => 0,
            UnitState::Dispatched { attempt } | UnitState::Retrying { attempt, .. } => *attempt,
            UnitState::Succeeded { attempts } | UnitState::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded { .. } | UnitState::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_secs(1)).with_jitter(false)
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_builder_pattern() {
        let config = RetryConfig::new(2, Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(1.5)
            .with_jitter(false);

        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.initial_delay, Duration::from_millis(50));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert!((config.backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert!(!config.jitter);
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(4, Duration::from_secs(1)).with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_respects_max() {
        let config = RetryConfig::new(10, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_backoff_multiplier(2.0);

        // Attempt 4 would be 8 seconds, but max is 3
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_calculation_with_multiplier_1() {
        let config = RetryConfig::new(5, Duration::from_millis(200)).with_backoff_multiplier(1.0);

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let config = no_jitter(5);
        assert_eq!(config.backoff(2), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let config = RetryConfig::new(5, Duration::from_secs(1));
        for _ in 0..50 {
            let delay = config.backoff(3);
            assert!(delay >= Duration::from_secs(2), "{:?}", delay);
            assert!(delay <= Duration::from_secs(4), "{:?}", delay);
        }
    }

    // ==================== Unit State Machine Tests ====================

    #[test]
    fn test_dispatch_counts_attempts() {
        let state = UnitState::Pending.dispatch();
        assert_eq!(state, UnitState::Dispatched { attempt: 1 });
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn test_success_records_attempts() {
        let state = UnitState::Pending.dispatch().succeed();
        assert_eq!(state, UnitState::Succeeded { attempts: 1 });
        assert!(state.is_terminal());
    }

    #[test]
    fn test_transient_failure_retries_with_backoff() {
        let policy = no_jitter(3);
        let state = UnitState::Pending
            .dispatch()
            .fail(&InferenceError::Empty, &policy);

        assert_eq!(
            state,
            UnitState::Retrying {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_two_transient_failures_then_success() {
        let policy = no_jitter(3);
        let err = InferenceError::Server {
            status: 503,
            body: String::new(),
        };

        let state = UnitState::Pending
            .dispatch()
            .fail(&err, &policy)
            .dispatch()
            .fail(&err, &policy);
        assert_eq!(
            state,
            UnitState::Retrying {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );

        let state = state.dispatch().succeed();
        assert_eq!(state, UnitState::Succeeded { attempts: 3 });
    }

    #[test]
    fn test_exhausting_attempts_becomes_terminal() {
        let policy = no_jitter(2);
        let state = UnitState::Pending
            .dispatch()
            .fail(&InferenceError::RateLimited, &policy)
            .dispatch()
            .fail(&InferenceError::RateLimited, &policy);

        match state {
            UnitState::Failed { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("gave up after 2 attempts"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_error_is_not_retried() {
        let policy = no_jitter(5);
        let state = UnitState::Pending.dispatch().fail(
            &InferenceError::Client {
                status: 400,
                body: "bad request".to_string(),
            },
            &policy,
        );

        assert!(matches!(state, UnitState::Failed { attempts: 1, .. }));
    }

    #[test]
    fn test_single_attempt_config_never_retries() {
        let policy = no_jitter(1);
        let state = UnitState::Pending
            .dispatch()
            .fail(&InferenceError::Timeout(Duration::from_secs(1)), &policy);

        assert!(state.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_are_ignored() {
        let done = UnitState::Succeeded { attempts: 2 };
        assert_eq!(done.clone().dispatch(), done);
        assert_eq!(UnitState::Pending.succeed(), UnitState::Pending);
    }
}
