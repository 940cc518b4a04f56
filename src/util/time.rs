//! Time utilities for game simulation
//!
//! Every gameplay timer (cooldowns, reloads, respawns, invulnerability,
//! regeneration, crate respawns) reads time through [`Clock`]. Timestamps are
//! durations since the clock's own epoch, so a [`ManualClock`] can jump
//! minutes ahead without any wall-clock waiting.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Logical time source for the simulation
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current logical time, measured from the clock's epoch
    fn now(&self) -> Duration;
}

/// Clock shared between a match and its components
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by tokio's monotonic `Instant`, which also
/// follows paused time in tests
#[derive(Debug, Clone)]
pub struct RealClock {
    origin: tokio::time::Instant,
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock for tests and deterministic replays
///
/// ```
/// use std::time::Duration;
/// use arena_server::util::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_secs(3));
/// assert_eq!(clock.now(), Duration::from_secs(3));
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    current: RwLock<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write();
        *current += by;
    }

    /// Jump to an absolute logical time
    pub fn set(&self, to: Duration) {
        *self.current.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.current.read()
    }
}

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Fixed physics step (in seconds) for a given tick rate
pub fn tick_delta(tick_rate: u32) -> f32 {
    1.0 / tick_rate.max(1) as f32
}

/// Wall-clock period of one tick at the given rate
pub fn tick_period(rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / rate.max(1) as u64)
}

/// Logical timestamp in whole milliseconds, as sent on the wire
pub fn as_millis(t: Duration) -> u64 {
    t.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_without_waiting() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_secs(180));
        assert_eq!(clock.now(), Duration::from_secs(180));
    }

    #[test]
    fn set_jumps_to_absolute_time() {
        let clock = ManualClock::new();
        clock.set(Duration::from_millis(1500));
        assert_eq!(as_millis(clock.now()), 1500);
    }

    #[test]
    fn real_clock_is_monotonic() {
        let clock = RealClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn tick_helpers_match_rate() {
        assert!((tick_delta(60) - 1.0 / 60.0).abs() < f32::EPSILON);
        assert_eq!(tick_period(20), Duration::from_millis(50));
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }
}
