//! Maintenance snapshot scheduling.
//!
//! The scheduler owns only the decision of whether and when the next
//! maintenance tick should fire. The runtime that hosts the coordinator
//! owns the actual timer; the scheduler tells it to cancel the outstanding
//! timer and, if maintenance is active, arm a new one. At most one
//! maintenance timer is therefore outstanding at any time.

use std::time::Duration;

/// What the host runtime must do with the maintenance timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceSchedule {
    /// Cancel the outstanding timer and arm a new one after the interval.
    Rearm(Duration),
    /// Cancel the outstanding timer and leave none armed.
    Cancel,
}

/// Recurring maintenance snapshot timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceScheduler {
    interval: Option<Duration>,
    active: bool,
    armed: bool,
}

impl MaintenanceScheduler {
    /// Create an inactive scheduler. `interval = None` disables maintenance
    /// snapshots entirely.
    pub const fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            active: false,
            armed: false,
        }
    }

    /// Activate maintenance and arm the first tick.
    pub const fn start(&mut self) -> MaintenanceSchedule {
        self.active = true;
        self.reschedule()
    }

    /// Deactivate maintenance; no further ticks are armed.
    pub const fn stop(&mut self) -> MaintenanceSchedule {
        self.active = false;
        self.armed = false;
        MaintenanceSchedule::Cancel
    }

    /// Re-arm after a resolved attempt or a no-op tick.
    pub const fn reschedule(&mut self) -> MaintenanceSchedule {
        match self.interval {
            Some(interval) if self.active => {
                self.armed = true;
                MaintenanceSchedule::Rearm(interval)
            }
            _ => {
                self.armed = false;
                MaintenanceSchedule::Cancel
            }
        }
    }

    /// Record that the armed timer has fired.
    pub const fn fired(&mut self) {
        self.armed = false;
    }

    /// Whether maintenance is active.
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Whether a maintenance timer is currently armed.
    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// The configured interval.
    pub const fn interval(&self) -> Option<Duration> {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(60);

    #[test]
    fn inactive_scheduler_never_arms() {
        let mut scheduler = MaintenanceScheduler::new(Some(INTERVAL));
        assert_eq!(scheduler.reschedule(), MaintenanceSchedule::Cancel);
        assert!(!scheduler.is_armed());
    }

    #[test]
    fn start_arms_and_reschedule_rearms() {
        let mut scheduler = MaintenanceScheduler::new(Some(INTERVAL));
        assert_eq!(scheduler.start(), MaintenanceSchedule::Rearm(INTERVAL));
        assert!(scheduler.is_armed());
        scheduler.fired();
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.reschedule(), MaintenanceSchedule::Rearm(INTERVAL));
    }

    #[test]
    fn stop_disables_future_rescheduling() {
        let mut scheduler = MaintenanceScheduler::new(Some(INTERVAL));
        scheduler.start();
        assert_eq!(scheduler.stop(), MaintenanceSchedule::Cancel);
        assert_eq!(scheduler.reschedule(), MaintenanceSchedule::Cancel);
        assert!(!scheduler.is_active());
    }

    #[test]
    fn disabled_interval_cancels_even_when_started() {
        let mut scheduler = MaintenanceScheduler::new(None);
        assert_eq!(scheduler.start(), MaintenanceSchedule::Cancel);
        assert!(scheduler.is_active());
        assert!(!scheduler.is_armed());
    }
}
