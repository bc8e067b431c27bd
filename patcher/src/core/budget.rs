//! Session time budget helpers.

use std::time::Duration;

/// Convert a configured budget in seconds into a wait bound.
///
/// Zero means unbounded: the supervisor imposes no cap of its own.
pub fn session_budget(timeout_secs: u64) -> Option<Duration> {
    (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_unbounded() {
        assert_eq!(session_budget(0), None);
    }

    #[test]
    fn positive_is_bounded() {
        assert_eq!(session_budget(90), Some(Duration::from_secs(90)));
    }
}
