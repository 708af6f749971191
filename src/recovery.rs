//! Connection recovery triggers
//!
//! Decides when the coordinator should force a transport reconnect:
//! either too many consecutive cycle failures, or data that has stopped
//! changing for too long. A cooldown window keeps recovery from looping.

use std::time::{Duration, Instant};

/// Why a recovery attempt was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    ConsecutiveFailures(u32),
    StaleData { age: Duration },
}

/// Tracks failure and staleness state for one inverter connection
#[derive(Debug)]
pub struct RecoveryManager {
    failure_threshold: u32,
    staleness_threshold: Duration,
    cooldown: Duration,
    consecutive_failures: u32,
    last_data_change: Option<Instant>,
    last_recovery_attempt: Option<Instant>,
}

impl RecoveryManager {
    pub fn new(failure_threshold: u32, staleness_threshold: Duration, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            staleness_threshold,
            cooldown,
            consecutive_failures: 0,
            last_data_change: None,
            last_recovery_attempt: None,
        }
    }

    /// Record the outcome of a refresh cycle. `data_changed` marks cycles
    /// where at least one block produced new values.
    pub fn record_cycle(&mut self, success: bool, data_changed: bool, now: Instant) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        if data_changed {
            self.last_data_change = Some(now);
        } else if self.last_data_change.is_none() {
            // Start the staleness clock at first observation
            self.last_data_change = Some(now);
        }
    }

    /// Escalate a per-block failure streak to a cycle-level trigger
    pub fn saturate_failures(&mut self) {
        self.consecutive_failures = self.consecutive_failures.max(self.failure_threshold);
    }

    /// Whether a recovery attempt is warranted right now.
    ///
    /// The cooldown gate is checked first; within the window nothing
    /// triggers regardless of state.
    pub fn should_recover(&self, now: Instant) -> Option<RecoveryReason> {
        if let Some(last) = self.last_recovery_attempt {
            if now.duration_since(last) < self.cooldown {
                return None;
            }
        }
        if self.consecutive_failures >= self.failure_threshold {
            return Some(RecoveryReason::ConsecutiveFailures(
                self.consecutive_failures,
            ));
        }
        if let Some(changed) = self.last_data_change {
            let age = now.duration_since(changed);
            if age >= self.staleness_threshold {
                return Some(RecoveryReason::StaleData { age });
            }
        }
        None
    }

    /// Record that a recovery attempt was made. Resets the failure counter
    /// so the next trigger needs a fresh streak.
    pub fn record_recovery_attempt(&mut self, now: Instant) {
        self.last_recovery_attempt = Some(now);
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RecoveryManager {
        RecoveryManager::new(
            5,
            Duration::from_secs(600),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn triggers_after_failure_streak() {
        let mut m = manager();
        let now = Instant::now();
        for _ in 0..4 {
            m.record_cycle(false, false, now);
        }
        assert!(m.should_recover(now).is_none());
        m.record_cycle(false, false, now);
        assert!(matches!(
            m.should_recover(now),
            Some(RecoveryReason::ConsecutiveFailures(5))
        ));
    }

    #[test]
    fn success_resets_streak() {
        let mut m = manager();
        let now = Instant::now();
        for _ in 0..4 {
            m.record_cycle(false, false, now);
        }
        m.record_cycle(true, true, now);
        assert_eq!(m.consecutive_failures(), 0);
        assert!(m.should_recover(now).is_none());
    }

    #[test]
    fn staleness_triggers_even_with_successful_cycles() {
        let mut m = manager();
        let t0 = Instant::now();
        m.record_cycle(true, true, t0);
        let later = t0 + Duration::from_secs(700);
        m.record_cycle(true, false, later);
        assert!(matches!(
            m.should_recover(later),
            Some(RecoveryReason::StaleData { .. })
        ));
    }

    #[test]
    fn cooldown_suppresses_retrigger() {
        let mut m = manager();
        let t0 = Instant::now();
        for _ in 0..5 {
            m.record_cycle(false, false, t0);
        }
        assert!(m.should_recover(t0).is_some());
        m.record_recovery_attempt(t0);

        // Counter was reset; build a fresh streak inside the cooldown
        for _ in 0..5 {
            m.record_cycle(false, false, t0);
        }
        assert!(m.should_recover(t0 + Duration::from_secs(100)).is_none());
        assert!(m.should_recover(t0 + Duration::from_secs(300)).is_some());
    }

    #[test]
    fn saturate_escalates_block_failures() {
        let mut m = manager();
        let now = Instant::now();
        m.saturate_failures();
        assert!(m.should_recover(now).is_some());
    }
}
