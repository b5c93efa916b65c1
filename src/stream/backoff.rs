//! Reconnect timing

use std::time::{Duration, Instant};

/// Timings used by the restart controller
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Backoff after the first failure
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Starting backoff after a manual restart
    pub manual_backoff: Duration,
    /// Pause between attempts, added on top of any backoff
    pub attempt_pause: Duration,
    /// Extra wait after stopping the previous attempt on a manual restart
    pub restart_grace: Duration,
    /// How long stop waits for the controller before giving up on it
    pub stop_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            manual_backoff: Duration::from_millis(250),
            attempt_pause: Duration::from_secs(1),
            restart_grace: Duration::from_millis(350),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Exponential backoff, doubling per failure up to the policy ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: &RestartPolicy) -> Self {
        Self::starting_at(policy.initial_backoff, policy)
    }

    /// Backoff for a controller started by a manual restart
    pub fn manual(policy: &RestartPolicy) -> Self {
        Self::starting_at(policy.manual_backoff, policy)
    }

    fn starting_at(current: Duration, policy: &RestartPolicy) -> Self {
        Self {
            current: current.min(policy.max_backoff),
            initial: policy.initial_backoff,
            max: policy.max_backoff,
            failures: 0,
            next_attempt: None,
        }
    }

    /// Delay to use if the next attempt fails
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Record a failed attempt; returns the delay before the next one
    pub fn on_failure(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.failures = self.failures.saturating_add(1);
        self.next_attempt = Some(now + delay);
        delay
    }

    /// An attempt delivered frames: back to the initial delay
    pub fn on_progress(&mut self) {
        self.current = self.initial;
        self.failures = 0;
        self.next_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(v: u64) -> Duration {
        Duration::from_secs(v)
    }

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(&RestartPolicy::default());
        let now = Instant::now();
        let delays: Vec<_> = (0..8).map(|_| backoff.on_failure(now)).collect();
        assert_eq!(
            delays,
            vec![secs(1), secs(2), secs(4), secs(8), secs(16), secs(30), secs(30), secs(30)]
        );
        assert_eq!(backoff.failures(), 8);
        assert_eq!(backoff.next_attempt(), Some(now + secs(30)));
    }

    #[test]
    fn test_progress_resets() {
        let mut backoff = Backoff::new(&RestartPolicy::default());
        let now = Instant::now();
        backoff.on_failure(now);
        backoff.on_failure(now);
        assert_eq!(backoff.current(), secs(4));

        backoff.on_progress();
        assert_eq!(backoff.current(), secs(1));
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_attempt().is_none());
    }

    #[test]
    fn test_manual_restart_starts_short() {
        let policy = RestartPolicy::default();
        let mut backoff = Backoff::manual(&policy);
        let now = Instant::now();
        assert_eq!(backoff.on_failure(now), Duration::from_millis(250));
        assert_eq!(backoff.on_failure(now), Duration::from_millis(500));
        assert_eq!(backoff.on_failure(now), secs(1));

        backoff.on_progress();
        assert_eq!(backoff.current(), policy.initial_backoff);
    }
}
