//! Sleep/wake state of a simulation instance.
//!
//! An instance only simulates while its transforms are being consumed. Each filter
//! call keeps it awake. When filter calls stop arriving it goes dormant after a few
//! frames. A filter request on a dormant instance starts waking it up, and it needs two
//! more filter calls to become active so the animation pose is fresh when it resumes.

use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Filter calls a waking instance needs before it simulates.
pub const WAKEUP_FILTER_CALLS: u32 = 2;

/// Activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ActivityState {
    /// Not simulating; pose ingestion and filtering are ignored.
    #[default]
    Dormant,
    /// Waiting for enough filter calls to resume.
    WakingUp,
    /// Simulating every step.
    Active,
}

/// Activity state plus the counters that drive its transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Activity {
    state: ActivityState,
    filter_calls: u32,
    frames_invisible: u32,
}

impl Activity {
    /// Dormant activity.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: ActivityState::Dormant,
            filter_calls: 0,
            frames_invisible: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ActivityState {
        self.state
    }

    /// Whether the instance simulates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ActivityState::Active
    }

    /// Whether the instance is dormant.
    #[must_use]
    pub fn is_dormant(&self) -> bool {
        self.state == ActivityState::Dormant
    }

    /// Frames since the last filter call.
    #[must_use]
    pub const fn frames_invisible(&self) -> u32 {
        self.frames_invisible
    }

    /// Start waking up a dormant instance.
    pub fn go_wakeup(&mut self) {
        if self.state == ActivityState::Dormant {
            debug!("softbody waking up");
            self.state = ActivityState::WakingUp;
            self.filter_calls = 0;
            self.frames_invisible = 0;
        }
    }

    /// Put the instance to sleep.
    pub fn go_dormant(&mut self) {
        if self.state != ActivityState::Dormant {
            debug!(from = ?self.state, "softbody going dormant");
        }
        self.state = ActivityState::Dormant;
    }

    /// Record a filter call; returns whether the filter should run.
    pub fn before_filter_transforms(&mut self) -> bool {
        self.frames_invisible = 0;
        match self.state {
            ActivityState::Active => true,
            ActivityState::WakingUp => {
                self.filter_calls += 1;
                if self.filter_calls >= WAKEUP_FILTER_CALLS {
                    debug!("softbody active");
                    self.state = ActivityState::Active;
                    true
                } else {
                    false
                }
            }
            ActivityState::Dormant => {
                self.go_wakeup();
                false
            }
        }
    }

    /// Count a frame without a filter call; goes dormant once past `frames_before_dormant`.
    pub fn advance_sleep_counter(&mut self, frames_before_dormant: u32) {
        self.frames_invisible = self.frames_invisible.saturating_add(1);
        if self.frames_invisible > frames_before_dormant {
            self.go_dormant();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_takes_two_filters() {
        let mut activity = Activity::new();
        assert!(activity.is_dormant());

        activity.go_wakeup();
        assert_eq!(activity.state(), ActivityState::WakingUp);
        assert!(!activity.before_filter_transforms());
        assert!(activity.before_filter_transforms());
        assert!(activity.is_active());
        assert!(activity.before_filter_transforms());
    }

    #[test]
    fn test_sleeps_after_invisible_frames() {
        let mut activity = Activity::new();
        activity.go_wakeup();
        activity.before_filter_transforms();
        activity.before_filter_transforms();

        activity.advance_sleep_counter(2);
        activity.advance_sleep_counter(2);
        assert!(activity.is_active());
        activity.advance_sleep_counter(2);
        assert!(activity.is_dormant());
    }

    #[test]
    fn test_filter_resets_sleep_counter() {
        let mut activity = Activity::new();
        activity.go_wakeup();
        activity.advance_sleep_counter(2);
        activity.advance_sleep_counter(2);
        assert!(!activity.before_filter_transforms());
        assert_eq!(activity.frames_invisible(), 0);
        activity.advance_sleep_counter(2);
        assert_eq!(activity.state(), ActivityState::WakingUp);
    }

    #[test]
    fn test_filter_request_wakes_dormant() {
        let mut activity = Activity::new();
        assert!(!activity.before_filter_transforms());
        assert_eq!(activity.state(), ActivityState::WakingUp);
    }

    #[test]
    fn test_wakeup_is_noop_when_active() {
        let mut activity = Activity::new();
        activity.go_wakeup();
        activity.before_filter_transforms();
        activity.before_filter_transforms();
        activity.go_wakeup();
        assert!(activity.is_active());
    }
}
