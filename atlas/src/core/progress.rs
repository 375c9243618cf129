//! Progress heuristic deciding when the loop needs a full replan.

/// Result of observing one post-action state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The state changed or fewer required inputs are empty.
    Advanced,
    /// No progress yet, but the replan window has not elapsed.
    Stalled { steps: u32 },
    /// No progress for a full multiple of the replan window.
    ReplanDue { steps: u32 },
}

/// Tracks stalled steps between observations.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    window: u32,
    last_state_key: Option<String>,
    last_required_empty: Option<usize>,
    stalled: u32,
}

impl ProgressTracker {
    /// `window` of zero is treated as one (replan on every stalled step).
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            last_state_key: None,
            last_required_empty: None,
            stalled: 0,
        }
    }

    /// Seed the baseline without judging progress (used for the start state).
    pub fn baseline(&mut self, state_key: &str, required_empty: usize) {
        self.last_state_key = Some(state_key.to_string());
        self.last_required_empty = Some(required_empty);
    }

    pub fn observe(&mut self, state_key: &str, required_empty: usize) -> Progress {
        let key_changed = self.last_state_key.as_deref() != Some(state_key);
        let fewer_empty = self
            .last_required_empty
            .is_some_and(|previous| required_empty < previous);
        self.baseline(state_key, required_empty);

        if key_changed || fewer_empty {
            self.stalled = 0;
            return Progress::Advanced;
        }
        self.stalled += 1;
        if self.stalled % self.window == 0 {
            Progress::ReplanDue {
                steps: self.stalled,
            }
        } else {
            Progress::Stalled {
                steps: self.stalled,
            }
        }
    }

    /// Forget the stall count (after an explicit replan).
    pub fn reset(&mut self) {
        self.stalled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_state_counts_as_progress() {
        let mut tracker = ProgressTracker::new(3);
        tracker.baseline("a", 2);
        assert_eq!(tracker.observe("b", 2), Progress::Advanced);
    }

    #[test]
    fn fewer_required_empty_counts_as_progress() {
        let mut tracker = ProgressTracker::new(3);
        tracker.baseline("a", 2);
        assert_eq!(tracker.observe("a", 1), Progress::Advanced);
    }

    #[test]
    fn replan_fires_on_window_multiples() {
        let mut tracker = ProgressTracker::new(2);
        tracker.baseline("a", 1);
        assert_eq!(tracker.observe("a", 1), Progress::Stalled { steps: 1 });
        assert_eq!(tracker.observe("a", 1), Progress::ReplanDue { steps: 2 });
        assert_eq!(tracker.observe("a", 1), Progress::Stalled { steps: 3 });
        assert_eq!(tracker.observe("a", 1), Progress::ReplanDue { steps: 4 });
        assert_eq!(tracker.observe("b", 1), Progress::Advanced);
        assert_eq!(tracker.observe("b", 1), Progress::Stalled { steps: 1 });
    }

    #[test]
    fn more_required_empty_is_not_progress() {
        let mut tracker = ProgressTracker::new(5);
        tracker.baseline("a", 1);
        assert_eq!(tracker.observe("a", 3), Progress::Stalled { steps: 1 });
    }
}
