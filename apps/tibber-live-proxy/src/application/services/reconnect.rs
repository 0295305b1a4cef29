//! Session Restart Policy
//!
//! Exponential backoff with jitter, used by the supervisor to restart a
//! device session that ended while its credential was still active.
//!
//! The attempt budget is bounded by default. A session that delivered at
//! least one record counts as healthy and resets the budget, so a flaky but
//! working connection is retried indefinitely while a dead one gives up.

use std::time::Duration;

use rand::Rng;

use crate::SessionSettings;

/// Configuration for restart behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first restart.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Restarts allowed without a healthy session in between (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Build from session settings, keeping the default jitter.
    #[must_use]
    pub const fn from_session_settings(settings: &SessionSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Backoff state for one device session.
///
/// # Example
///
/// ```rust
/// use tibber_live_proxy::application::services::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert!(policy.next_delay().is_some());
///
/// // A session that streamed records resets the budget.
/// policy.session_ended(12);
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy with a fresh budget.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next restart, or `None` once the budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);
        let grown = self.current_delay.as_secs_f64() * self.config.multiplier;
        self.current_delay = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);

        Some(delay)
    }

    /// Feed back how many records the last session delivered.
    pub const fn session_ended(&mut self, records: u64) {
        if records > 0 {
            self.reset();
        }
    }

    /// Restore the initial delay and budget.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Restarts consumed since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another restart is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (base_millis + jitter).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}
