// Time translation: device-clock instants to timeline ticks with bounds
//
// Composes the three mappings established during a measurement: device
// clock → host wall clock (offset estimates), host wall clock → peer wall
// clock (already folded into the host clock by the wall-clock client's
// slewing), and wall clock → timeline (the latest control timestamp in
// effect). Every translated instant carries an error bound that is the SUM
// of the contributing uncertainties; summing rather than taking the
// maximum is deliberate conservatism.

use crate::clock::{TickRate, TimestampedCt};
use crate::dispersion::DispersionRecorder;
use crate::error::MeasureError;
use crate::sampler::DeviceToWall;

/// Quantum of one sampling block: a pulse edge is located to within half a
/// millisecond block.
const SAMPLING_QUANTUM_SECS: f64 = 0.0005;
/// Quantum of the device's microsecond timer.
const DEVICE_TIMER_QUANTUM_SECS: f64 = 1e-6;

/// A device instant re-expressed on the synchronisation timeline.
#[derive(Debug, Clone, Copy)]
pub struct TranslatedInstant {
    pub ticks: f64,
    /// Non-negative error bound, in ticks.
    pub bound_ticks: f64,
}

/// Translator over immutable snapshots captured at ANALYSING entry.
pub struct TimeTranslator {
    dev_to_wall: DeviceToWall,
    /// CT history in receipt order.
    ct_history: Vec<TimestampedCt>,
    dispersion: DispersionRecorder,
    tick_rate: TickRate,
}

impl TimeTranslator {
    pub fn new(
        dev_to_wall: DeviceToWall,
        ct_history: Vec<TimestampedCt>,
        dispersion: DispersionRecorder,
        tick_rate: TickRate,
    ) -> Self {
        TimeTranslator { dev_to_wall, ct_history, dispersion, tick_rate }
    }

    /// The control timestamp in effect at a wall-clock instant: the last
    /// one received at or before it. Receipt order is authoritative, so
    /// the history is scanned rather than bisected (a wall-clock slew can
    /// stamp a later arrival with an earlier instant).
    fn ct_in_effect(&self, wall_nanos: i64) -> Option<&TimestampedCt> {
        let mut found = None;
        for entry in &self.ct_history {
            if entry.received_wall_nanos <= wall_nanos {
                found = Some(entry);
            }
        }
        found
    }

    /// Translate a device-clock instant to timeline ticks with its error
    /// bound. Fails with no-timeline if no control timestamp was in effect
    /// at that instant, or the one in effect was null or paused.
    pub fn to_timeline(&self, device_nanos: i64) -> Result<TranslatedInstant, MeasureError> {
        let wall_nanos = self.dev_to_wall.wall_at(device_nanos);

        let entry = self.ct_in_effect(wall_nanos).ok_or(MeasureError::NoTimeline)?;
        let correlation = entry.ct.correlation.ok_or(MeasureError::NoTimeline)?;
        if correlation.is_paused() {
            return Err(MeasureError::NoTimeline);
        }

        let ticks = correlation.ticks_at(wall_nanos, &self.tick_rate);

        let dispersion_secs = self.dispersion.dispersion_at(wall_nanos).unwrap_or(0.0);
        let bound_secs = self.dev_to_wall.bound_secs()
            + dispersion_secs
            + 0.5 / self.tick_rate.per_second()
            + SAMPLING_QUANTUM_SECS
            + DEVICE_TIMER_QUANTUM_SECS;

        Ok(TranslatedInstant {
            ticks,
            bound_ticks: self.tick_rate.secs_to_ticks(bound_secs),
        })
    }

    pub fn tick_rate(&self) -> TickRate {
        self.tick_rate
    }
}
