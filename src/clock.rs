// Clock domains and timeline arithmetic
//
// Three named time bases flow through a measurement: the host wall clock
// (slewable, nanoseconds), the sampling device's microsecond timer
// (read-only, unwrapped to nanoseconds by the sampler link), and the
// synchronisation timeline (ticks at a configured rate). Conversions only
// ever happen through the explicit mappings defined here and in the
// translator; there is no implicit "now" outside a named domain.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Tick rate of the synchronisation timeline, expressed the way the
/// protocol carries it: `units_per_sec / units_per_tick` ticks per second
/// (e.g. 90000/1 for a PTS timeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    pub units_per_tick: u32,
    pub units_per_sec: u32,
}

impl TickRate {
    pub fn new(units_per_tick: u32, units_per_sec: u32) -> Self {
        TickRate { units_per_tick, units_per_sec }
    }

    /// Ticks per second.
    pub fn per_second(&self) -> f64 {
        self.units_per_sec as f64 / self.units_per_tick as f64
    }

    pub fn ticks_to_secs(&self, ticks: f64) -> f64 {
        ticks / self.per_second()
    }

    pub fn secs_to_ticks(&self, secs: f64) -> f64 {
        secs * self.per_second()
    }
}

/// Correlation anchoring the timeline in wall-clock time: at wall-clock
/// instant `wall_nanos` the timeline read `ticks`, advancing at
/// `speed` × nominal rate. `speed == 0.0` is a paused timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub wall_nanos: i64,
    pub ticks: i64,
    pub speed: f64,
}

impl Correlation {
    /// Timeline position at wall-clock instant `wall_nanos`, in fractional
    /// ticks. A paused correlation holds its tick value.
    pub fn ticks_at(&self, wall_nanos: i64, rate: &TickRate) -> f64 {
        let elapsed_secs = (wall_nanos - self.wall_nanos) as f64 / NANOS_PER_SEC;
        self.ticks as f64 + elapsed_secs * self.speed * rate.per_second()
    }

    pub fn is_paused(&self) -> bool {
        self.speed == 0.0
    }
}

/// A control timestamp as exposed to the rest of the system: the
/// originating content-id, the tick rate, and the correlation.
/// `correlation == None` is the "null" control timestamp, signalling that
/// no timeline is currently available.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlTimestamp {
    pub content_id: String,
    pub tick_rate: TickRate,
    pub correlation: Option<Correlation>,
}

/// A control timestamp stamped with the host wall-clock instant at which it
/// was received. Successive entries form the monotone-by-arrival CT history
/// the translator snapshots.
#[derive(Debug, Clone)]
pub struct TimestampedCt {
    pub received_wall_nanos: i64,
    pub ct: ControlTimestamp,
}

/// The host wall clock: a monotonic base plus a slewable offset. The
/// wall-clock client adjusts the offset as better sync candidates arrive;
/// everything else only reads it.
pub struct WallClock {
    base: Instant,
    offset_nanos: AtomicI64,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock {
            base: Instant::now(),
            offset_nanos: AtomicI64::new(0),
        }
    }

    pub fn now_nanos(&self) -> i64 {
        self.base.elapsed().as_nanos() as i64 + self.offset_nanos.load(Ordering::Relaxed)
    }

    /// Slew the clock by `delta_nanos`. Used only by the wall-clock client
    /// when it adopts a better offset candidate.
    pub fn adjust(&self, delta_nanos: i64) {
        self.offset_nanos.fetch_add(delta_nanos, Ordering::Relaxed);
    }

    /// Empirically measure the read precision of this clock, in seconds:
    /// the smallest observable nonzero difference between consecutive reads.
    pub fn measure_precision(&self) -> f64 {
        let mut min_delta = i64::MAX;
        for _ in 0..1000 {
            let t1 = self.now_nanos();
            let mut t2 = self.now_nanos();
            while t2 == t1 {
                t2 = self.now_nanos();
            }
            min_delta = min_delta.min(t2 - t1);
        }
        min_delta as f64 / NANOS_PER_SEC
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The server-role synchronisation timeline: a correlation against the host
/// wall clock, mutable by the orchestrator (pause/unpause), read by the
/// timeline service when it builds control timestamps.
pub struct TimelineClock {
    wall: std::sync::Arc<WallClock>,
    tick_rate: TickRate,
    correlation: Mutex<Correlation>,
}

impl TimelineClock {
    /// Create a timeline paused at `start_ticks`.
    pub fn new_paused(wall: std::sync::Arc<WallClock>, tick_rate: TickRate, start_ticks: i64) -> Self {
        let correlation = Correlation {
            wall_nanos: wall.now_nanos(),
            ticks: start_ticks,
            speed: 0.0,
        };
        TimelineClock {
            wall,
            tick_rate,
            correlation: Mutex::new(correlation),
        }
    }

    pub fn tick_rate(&self) -> TickRate {
        self.tick_rate
    }

    pub fn correlation(&self) -> Correlation {
        *self.correlation.lock().unwrap()
    }

    pub fn ticks_now(&self) -> f64 {
        let now = self.wall.now_nanos();
        self.correlation().ticks_at(now, &self.tick_rate)
    }

    /// Rebase the correlation at the current tick value and freeze it.
    pub fn pause(&self) {
        let now = self.wall.now_nanos();
        let mut corr = self.correlation.lock().unwrap();
        let ticks = corr.ticks_at(now, &self.tick_rate);
        *corr = Correlation {
            wall_nanos: now,
            ticks: ticks.round() as i64,
            speed: 0.0,
        };
    }

    /// Resume at normal speed from the held tick value.
    pub fn unpause(&self) {
        let now = self.wall.now_nanos();
        let mut corr = self.correlation.lock().unwrap();
        *corr = Correlation {
            wall_nanos: now,
            ticks: corr.ticks,
            speed: 1.0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tick_rate_per_second() {
        let rate = TickRate::new(1, 90000);
        assert_eq!(rate.per_second(), 90000.0);
        assert_eq!(rate.secs_to_ticks(2.0), 180000.0);
        assert_eq!(rate.ticks_to_secs(45000.0), 0.5);

        let rate = TickRate::new(2, 90000);
        assert_eq!(rate.per_second(), 45000.0);
    }

    #[test]
    fn test_correlation_ticks_at() {
        let rate = TickRate::new(1, 90000);
        let corr = Correlation { wall_nanos: 1_000_000_000, ticks: 5000, speed: 1.0 };
        assert_eq!(corr.ticks_at(1_000_000_000, &rate), 5000.0);
        assert_eq!(corr.ticks_at(2_000_000_000, &rate), 95000.0);
        // extrapolation backwards is legal
        assert_eq!(corr.ticks_at(0, &rate), -85000.0);
    }

    #[test]
    fn test_paused_correlation_holds() {
        let rate = TickRate::new(1, 90000);
        let corr = Correlation { wall_nanos: 0, ticks: 1234, speed: 0.0 };
        assert!(corr.is_paused());
        assert_eq!(corr.ticks_at(5_000_000_000, &rate), 1234.0);
    }

    #[test]
    fn test_wall_clock_monotone_and_adjustable() {
        let clock = WallClock::new();
        let t1 = clock.now_nanos();
        let t2 = clock.now_nanos();
        assert!(t2 >= t1);

        clock.adjust(1_000_000_000);
        let t3 = clock.now_nanos();
        assert!(t3 - t2 >= 1_000_000_000);

        clock.adjust(-500_000_000);
        assert!(clock.now_nanos() < t3 + 1_000_000_000);
    }

    #[test]
    fn test_wall_clock_precision_positive() {
        let clock = WallClock::new();
        let p = clock.measure_precision();
        assert!(p > 0.0);
        assert!(p < 0.01);
    }

    #[test]
    fn test_timeline_pause_unpause() {
        let wall = Arc::new(WallClock::new());
        let rate = TickRate::new(1, 90000);
        let timeline = TimelineClock::new_paused(wall.clone(), rate, 12345678);

        // paused at construction: ticks do not advance
        let t1 = timeline.ticks_now();
        let t2 = timeline.ticks_now();
        assert_eq!(t1, 12345678.0);
        assert_eq!(t1, t2);

        timeline.unpause();
        assert_eq!(timeline.correlation().speed, 1.0);
        assert_eq!(timeline.correlation().ticks, 12345678);

        timeline.pause();
        let held = timeline.ticks_now();
        assert_eq!(timeline.correlation().speed, 0.0);
        assert_eq!(timeline.ticks_now(), held);
    }
}
