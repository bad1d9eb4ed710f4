use crate::config::ManagerConfig;
use std::time::Duration;

/// Exponential backoff policy for crash-driven restarts.
///
/// The delay doubles on every attempt and is capped; once a process has
/// spent its restart budget no further attempt is made.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first restart attempt
    pub base_delay: Duration,
    /// Upper bound on the computed delay
    pub max_delay: Duration,
    /// Total restarts allowed over a process's logical lifetime
    pub max_restarts: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_restarts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_restarts,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.restart_base_delay_ms),
            max_delay: Duration::from_millis(config.restart_max_delay_ms),
            max_restarts: config.max_restarts,
        }
    }

    /// Whether another restart may be attempted given the count so far
    pub fn should_restart(&self, restarts: u32, budget: u32) -> bool {
        restarts < budget
    }

    /// Delay before restart attempt number `attempt` (zero-based).
    ///
    /// delay = base * 2^attempt, capped at max_delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 2_u64.saturating_pow(attempt);
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_restarts, 3);
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3);

        // 1 * 2^0 = 1
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        // 1 * 2^1 = 2
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        // 1 * 2^2 = 4
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        // 1 * 2^3 = 8
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 3);

        // 1 * 2^5 = 32, capped at 30
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        // Overflow-prone attempts stay capped
        assert_eq!(policy.delay_for(63), Duration::from_secs(30));
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn test_should_restart_respects_budget() {
        let policy = BackoffPolicy::default();

        assert!(policy.should_restart(0, 3));
        assert!(policy.should_restart(2, 3));
        assert!(!policy.should_restart(3, 3));
        assert!(!policy.should_restart(10, 3));
    }

    #[test]
    fn test_subsecond_base_delay() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30), 3);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }
}
