/// Liveness tracking for the no-activity timeout.
///
/// The job's output stream calls `observe` whenever it appends output; the
/// watchdog polls `idle_at`. Only the latest timestamp is kept, stored as
/// milliseconds since the monitor was created so it fits in one atomic.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ActivityMonitor {
    origin: Instant,
    last_millis: AtomicU64,
}

impl ActivityMonitor {
    /// Create a monitor. Creation counts as the first activity.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn observe(&self) {
        self.observe_at(Instant::now());
    }

    /// Record activity at `at`. Older timestamps never move the clock back.
    pub fn observe_at(&self, at: Instant) {
        let millis = at.saturating_duration_since(self.origin).as_millis();
        let millis = u64::try_from(millis).unwrap_or(u64::MAX);
        self.last_millis.fetch_max(millis, Ordering::AcqRel);
    }

    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_millis.load(Ordering::Acquire))
    }

    /// Silence between the last activity and `now`.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
