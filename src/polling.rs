//! Adaptive per-block polling intervals
//!
//! Each register block keeps its own interval. Blocks whose values change
//! speed up, unchanged blocks slow down, so quiet blocks (settings,
//! lifetime energy counters) stop competing for bus time with the fast
//! power readings.

use crate::registers::FieldMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const INTERVAL_FLOOR: Duration = Duration::from_secs(10);
const SPEED_UP_FACTOR: f64 = 0.9;
const SLOW_DOWN_FACTOR: f64 = 1.1;

/// Per-block polling state
#[derive(Debug, Clone)]
pub struct PollingState {
    interval: Duration,
    last_poll: Option<Instant>,
    pub consecutive_failures: u32,
    pub cached_values: FieldMap,
}

impl PollingState {
    fn new(default_interval: Duration) -> Self {
        Self {
            interval: default_interval,
            last_poll: None,
            consecutive_failures: 0,
            cached_values: FieldMap::new(),
        }
    }
}

/// Adaptive poller tracking all register blocks of one inverter
#[derive(Debug)]
pub struct AdaptivePoller {
    min_interval: Duration,
    max_interval: Duration,
    default_interval: Duration,
    blocks: HashMap<&'static str, PollingState>,
}

impl AdaptivePoller {
    pub fn new(min_interval: Duration, max_interval: Duration, default_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            default_interval,
            blocks: HashMap::new(),
        }
    }

    fn state_mut(&mut self, block: &'static str) -> &mut PollingState {
        let default_interval = self.default_interval;
        self.blocks
            .entry(block)
            .or_insert_with(|| PollingState::new(default_interval))
    }

    /// Whether the block's interval has elapsed. A never-polled block is
    /// always due.
    pub fn should_poll(&self, block: &str, now: Instant) -> bool {
        match self.blocks.get(block) {
            Some(state) => match state.last_poll {
                Some(last) => now.duration_since(last) >= state.interval,
                None => true,
            },
            None => true,
        }
    }

    /// Record a successful poll and adapt the interval.
    ///
    /// Changed data speeds the block up by 10 percent, unchanged data slows
    /// it down by 10 percent, clamped to [max(min, 10 s), max].
    pub fn update_after_poll(&mut self, block: &'static str, values: FieldMap, now: Instant) {
        let min = self.min_interval.max(INTERVAL_FLOOR);
        let max = self.max_interval;
        let state = self.state_mut(block);

        let changed = state.cached_values != values;
        let factor = if changed {
            SPEED_UP_FACTOR
        } else {
            SLOW_DOWN_FACTOR
        };
        let next = Duration::from_secs_f64(state.interval.as_secs_f64() * factor);
        state.interval = next.clamp(min, max);
        state.last_poll = Some(now);
        state.consecutive_failures = 0;
        state.cached_values = values;
    }

    /// Record a failed poll. The timestamp advances so the block is not
    /// hammered every cycle, but the interval is left alone.
    pub fn record_failure(&mut self, block: &'static str, now: Instant) -> u32 {
        let state = self.state_mut(block);
        state.last_poll = Some(now);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.consecutive_failures
    }

    /// Cached values from the block's last successful poll
    pub fn cached_values(&self, block: &str) -> Option<&FieldMap> {
        self.blocks.get(block).map(|s| &s.cached_values)
    }

    /// Current interval, for diagnostics
    pub fn interval(&self, block: &str) -> Option<Duration> {
        self.blocks.get(block).map(|s| s.interval)
    }
}
