//! Per-stage retry and device fallback policy.
//!
//! Each stage run owns an [`AttemptPolicy`]: an explicit state machine that
//! decides, after every failed attempt, whether to retry on the same
//! device, demote to CPU, or give up. Plain retries wait according to the
//! configured backoff and jitter.

use crate::core::{Device, StageDefinition};
use crate::errors::StageError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// Retry budget and pacing shared by all stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Plain retries after the first attempt.
    pub base_retries: u32,
    /// Base delay between retries in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_retries: 1,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the plain retry budget.
    #[must_use]
    pub fn with_base_retries(mut self, retries: u32) -> Self {
        self.base_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Attempt budget of a stage: one initial attempt plus the base retries,
    /// plus one more reserved for device fallback on accelerated stages.
    #[must_use]
    pub fn max_attempts(&self, stage: &StageDefinition) -> u32 {
        let reserved = u32::from(stage.is_accelerated());
        self.plain_attempts() + reserved
    }

    /// Attempts available to plain retries: the initial attempt plus the
    /// base retries. The fallback slot is never spent on a plain retry.
    #[must_use]
    pub fn plain_attempts(&self) -> u32 {
        1 + self.base_retries
    }

    /// Delay before the retry with 0-based index `retry`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Where a stage is in its attempt lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// The first attempt on the requested device.
    Initial,
    /// A plain retry on the same device.
    Retry,
    /// The single attempt forced to CPU after a resource fault.
    FallbackDevice,
    /// No attempts remain.
    Exhausted,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Run again on the same device after the delay.
    Retry(Duration),
    /// Run again immediately, forced to CPU.
    FallbackToCpu,
    /// The failure is terminal.
    GiveUp,
}

/// Attempt state machine for one stage in one run.
#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    config: RetryConfig,
    max_attempts: u32,
    plain_attempts: u32,
    fallback_allowed: bool,
    phase: AttemptPhase,
    attempts: u32,
    retries: u32,
}

impl AttemptPolicy {
    /// Creates the policy for a stage.
    #[must_use]
    pub fn new(config: &RetryConfig, stage: &StageDefinition) -> Self {
        Self {
            config: config.clone(),
            max_attempts: config.max_attempts(stage),
            plain_attempts: config.plain_attempts(),
            fallback_allowed: stage.is_accelerated() && !stage.device_pinned,
            phase: AttemptPhase::Initial,
            attempts: 0,
            retries: 0,
        }
    }

    /// The attempt budget.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true once the device has been forced to CPU.
    #[must_use]
    pub fn forced_cpu(&self) -> bool {
        self.phase == AttemptPhase::FallbackDevice
    }

    /// Starts the next attempt and returns its 1-based number, or `None`
    /// when the policy is exhausted.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if self.phase == AttemptPhase::Exhausted || self.attempts >= self.max_attempts {
            self.phase = AttemptPhase::Exhausted;
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Decides the follow-up to a failed attempt that ran on `device`.
    pub fn on_failure(&mut self, error: &StageError, device: Device) -> AttemptDecision {
        if self.phase == AttemptPhase::FallbackDevice {
            self.phase = AttemptPhase::Exhausted;
            return AttemptDecision::GiveUp;
        }

        let first_failure = self.phase == AttemptPhase::Initial;
        if first_failure
            && self.fallback_allowed
            && device.is_accelerated()
            && error.is_fallback_eligible()
        {
            self.phase = AttemptPhase::FallbackDevice;
            return AttemptDecision::FallbackToCpu;
        }

        if self.attempts >= self.plain_attempts {
            self.phase = AttemptPhase::Exhausted;
            return AttemptDecision::GiveUp;
        }

        let delay = self.config.delay(self.retries);
        self.retries += 1;
        self.phase = AttemptPhase::Retry;
        AttemptDecision::Retry(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CrashSignal;

    fn quick() -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    fn oom() -> StageError {
        StageError::Crash {
            signal: CrashSignal::OutOfMemory,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_retries, 1);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_max_attempts_by_resource_class() {
        let config = RetryConfig::new().with_base_retries(2);
        assert_eq!(config.max_attempts(&StageDefinition::new("mux", "m")), 3);
        assert_eq!(
            config.max_attempts(&StageDefinition::new("asr", "a").accelerated()),
            4
        );
    }

    #[test]
    fn test_delay_backoff_no_jitter() {
        let exp = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::None);
        assert_eq!(exp.delay(0), Duration::from_millis(100));
        assert_eq!(exp.delay(2), Duration::from_millis(400));

        let linear = exp.clone().with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay(2), Duration::from_millis(300));

        let constant = exp.with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay(5), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        assert_eq!(config.delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_stays_below_delay() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        for _ in 0..20 {
            assert!(config.delay(0) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_plain_retries_are_bounded() {
        let stage = StageDefinition::new("mux", "m");
        let mut policy = AttemptPolicy::new(&quick().with_base_retries(2), &stage);

        let mut runs = 0;
        while policy.begin_attempt().is_some() {
            runs += 1;
            let decision = policy.on_failure(&StageError::Failure { exit_code: 1 }, Device::Cpu);
            if decision == AttemptDecision::GiveUp {
                break;
            }
            assert_eq!(policy.phase(), AttemptPhase::Retry);
        }

        assert_eq!(runs, 3);
        assert_eq!(policy.phase(), AttemptPhase::Exhausted);
        assert_eq!(policy.begin_attempt(), None);
    }

    #[test]
    fn test_oom_on_first_attempt_falls_back_once() {
        let stage = StageDefinition::new("asr", "a").accelerated();
        let mut policy = AttemptPolicy::new(&quick(), &stage);

        assert_eq!(policy.begin_attempt(), Some(1));
        assert_eq!(policy.on_failure(&oom(), Device::Cuda), AttemptDecision::FallbackToCpu);
        assert!(policy.forced_cpu());

        assert_eq!(policy.begin_attempt(), Some(2));
        assert_eq!(policy.on_failure(&oom(), Device::Cpu), AttemptDecision::GiveUp);
        assert_eq!(policy.phase(), AttemptPhase::Exhausted);
    }

    #[test]
    fn test_fallback_only_on_first_failure() {
        let stage = StageDefinition::new("asr", "a").accelerated();
        let mut policy = AttemptPolicy::new(&quick().with_base_retries(2), &stage);

        policy.begin_attempt();
        let decision = policy.on_failure(&StageError::Failure { exit_code: 1 }, Device::Cuda);
        assert!(matches!(decision, AttemptDecision::Retry(_)));

        policy.begin_attempt();
        let decision = policy.on_failure(&oom(), Device::Cuda);
        assert!(matches!(decision, AttemptDecision::Retry(_)));
        assert!(!policy.forced_cpu());
    }

    #[test]
    fn test_device_pinned_stage_never_falls_back() {
        let stage = StageDefinition::new("diarization", "d").accelerated().device_pinned();
        let mut policy = AttemptPolicy::new(&quick(), &stage);

        policy.begin_attempt();
        let decision = policy.on_failure(&oom(), Device::Cuda);
        assert!(matches!(decision, AttemptDecision::Retry(_)));
    }

    #[test]
    fn test_no_fallback_from_cpu_or_for_plain_failures() {
        let stage = StageDefinition::new("asr", "a").accelerated();

        let mut on_cpu = AttemptPolicy::new(&quick(), &stage);
        on_cpu.begin_attempt();
        assert!(matches!(on_cpu.on_failure(&oom(), Device::Cpu), AttemptDecision::Retry(_)));

        let mut timeout = AttemptPolicy::new(&quick(), &stage);
        timeout.begin_attempt();
        let decision = timeout.on_failure(&StageError::Timeout { timeout_secs: 1 }, Device::Cuda);
        assert!(matches!(decision, AttemptDecision::Retry(_)));
    }

    #[test]
    fn test_plain_retries_never_use_fallback_slot() {
        let stage = StageDefinition::new("asr", "a").accelerated();
        let mut policy = AttemptPolicy::new(&quick(), &stage);
        assert_eq!(policy.max_attempts(), 3);

        let mut runs = 0;
        while policy.begin_attempt().is_some() {
            runs += 1;
            let decision = policy.on_failure(&StageError::Failure { exit_code: 1 }, Device::Cuda);
            if decision == AttemptDecision::GiveUp {
                break;
            }
        }

        assert_eq!(runs, 2);
        assert_eq!(policy.phase(), AttemptPhase::Exhausted);
    }

    #[test]
    fn test_fallback_then_budget_for_accelerated_stage() {
        let stage = StageDefinition::new("asr", "a").accelerated();
        let mut policy = AttemptPolicy::new(&quick().with_base_retries(2), &stage);

        assert_eq!(policy.begin_attempt(), Some(1));
        assert_eq!(policy.on_failure(&oom(), Device::Cuda), AttemptDecision::FallbackToCpu);
        assert_eq!(policy.begin_attempt(), Some(2));
        assert_eq!(
            policy.on_failure(&StageError::Failure { exit_code: 1 }, Device::Cpu),
            AttemptDecision::GiveUp
        );
        assert_eq!(policy.begin_attempt(), None);
    }
}
