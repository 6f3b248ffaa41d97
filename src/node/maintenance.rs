//! Timers of the periodic bucket refresh and replicate/expire passes.

use std::time::{Duration, Instant};

/// Maintenance timers state
#[derive(Debug)]
pub struct Maintenance {
    refresh_interval: Duration,
    replicate_interval: Duration,
    last_refresh: Instant,
    last_replicate: Instant,
}

/// Decisions about periodic maintenance
#[derive(Debug, Default, PartialEq)]
pub struct MaintenanceDecisions {
    /// Whether to refresh stale buckets, starting from bucket 0.
    pub should_refresh: bool,

    /// Whether to replicate due items, then expire old ones.
    pub should_replicate: bool,
}

impl Maintenance {
    /// Create new maintenance timers, the first passes are due one interval from now.
    pub fn new(refresh_interval: Duration, replicate_interval: Duration) -> Self {
        let now = Instant::now();

        Maintenance {
            refresh_interval,
            replicate_interval,
            last_refresh: now,
            last_replicate: now,
        }
    }

    /// Determine which maintenance passes are due, resetting their timers.
    pub fn decisions(&mut self) -> MaintenanceDecisions {
        self.decisions_at(Instant::now())
    }

    fn decisions_at(&mut self, now: Instant) -> MaintenanceDecisions {
        let should_refresh = now.saturating_duration_since(self.last_refresh) >= self.refresh_interval;
        let should_replicate =
            now.saturating_duration_since(self.last_replicate) >= self.replicate_interval;

        if should_refresh {
            self.last_refresh = now;
        }

        if should_replicate {
            self.last_replicate = now;
        }

        MaintenanceDecisions {
            should_refresh,
            should_replicate,
        }
    }
}
