//! Shared time budget helpers for deterministic orchestration.

use std::time::Duration;

use tokio::time::Instant;

/// Return the remaining time budget until the provided deadline.
///
/// `None` means the budget is spent; callers treat that as a control signal,
/// not an error. Uses tokio's clock, so a paused test runtime controls it.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_has_no_budget() {
        let deadline = Instant::now() - Duration::from_millis(5);
        assert_eq!(remaining_budget(deadline), None);
    }

    #[test]
    fn future_deadline_reports_remaining() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let remaining = remaining_budget(deadline).expect("budget left");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }
}
