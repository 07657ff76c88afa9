//! # Supervision
//!
//! What happens when a behavior fails. The strategy belongs to the failing actor and is set
//! through [`crate::Props::with_supervision`].

use crate::behavior::ActorFailure;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SupervisionStrategy {
    /// Stop the actor; the parent is notified without an escalation.
    #[default]
    Stop,
    /// Drop the failing message and keep the current behavior.
    Resume,
    /// Rebuild the actor from its factory under a new incarnation, at most `max_restarts` times
    /// within the sliding window `within`. Past the quota the actor stops and escalates.
    Restart { max_restarts: u32, within: Duration },
    /// Stop and hand the failure to the parent.
    Escalate,
}

impl SupervisionStrategy {
    pub fn restart(max_restarts: u32, within: Duration) -> Self {
        Self::Restart {
            max_restarts,
            within,
        }
    }

    pub(crate) fn restart_window(&self) -> Option<RestartWindow> {
        match self {
            Self::Restart {
                max_restarts,
                within,
            } => Some(RestartWindow::new(*max_restarts, *within)),
            _ => None,
        }
    }
}

/// Sliding-window restart counter.
#[derive(Debug, Clone)]
pub struct RestartWindow {
    max_restarts: u32,
    within: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartWindow {
    pub fn new(max_restarts: u32, within: Duration) -> Self {
        Self {
            max_restarts,
            within,
            restarts: VecDeque::new(),
        }
    }

    /// Records a restart at `now`. Returns `false` when the restart would exceed the quota, in
    /// which case nothing is recorded.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) >= self.within {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= self.max_restarts as usize {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    pub fn restarts_in_window(&self) -> usize {
        self.restarts.len()
    }
}

/// Why an actor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StopReason {
    Stopped,
    Failed(ActorFailure),
    Escalated(ActorFailure),
}

impl StopReason {
    pub(crate) fn escalation(&self) -> Option<ActorFailure> {
        match self {
            StopReason::Escalated(failure) => Some(failure.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Stopped => f.write_str("stopped"),
            StopReason::Failed(failure) => write!(f, "failed: {failure}"),
            StopReason::Escalated(failure) => write!(f, "escalated: {failure}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_within_window() {
        let start = Instant::now();
        let mut window = RestartWindow::new(3, Duration::from_secs(10));
        assert!(window.record(start));
        assert!(window.record(start + Duration::from_secs(1)));
        assert!(window.record(start + Duration::from_secs(2)));
        assert!(!window.record(start + Duration::from_secs(3)));
        assert_eq!(window.restarts_in_window(), 3);
    }

    #[test]
    fn test_old_restarts_slide_out() {
        let start = Instant::now();
        let mut window = RestartWindow::new(2, Duration::from_secs(5));
        assert!(window.record(start));
        assert!(window.record(start + Duration::from_secs(1)));
        assert!(!window.record(start + Duration::from_secs(2)));
        assert!(window.record(start + Duration::from_secs(6)));
        assert_eq!(window.restarts_in_window(), 2);
    }

    #[test]
    fn test_zero_quota_never_restarts() {
        let mut window = RestartWindow::new(0, Duration::from_secs(1));
        assert!(!window.record(Instant::now()));
    }

    #[test]
    fn test_only_escalation_carries_failure() {
        let failure = ActorFailure::msg("boom");
        assert_eq!(StopReason::Stopped.escalation(), None);
        assert_eq!(StopReason::Failed(failure.clone()).escalation(), None);
        assert_eq!(
            StopReason::Escalated(failure.clone()).escalation(),
            Some(failure)
        );
    }
}
