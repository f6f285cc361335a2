// Pulse detection over per-millisecond min/max envelopes
//
// Light channels flash white-on-black; audio channels carry a tone burst
// over silence. For light we track the per-block maximum, for audio the
// max−min envelope. A single threshold halfway between the 5th and 95th
// percentile separates pulse from floor, and a hold interval after each
// falling edge absorbs backlight modulation and per-frame chopping, which
// can drop the signal to the floor for a few milliseconds mid-pulse.

use crate::clock::NANOS_PER_SEC;
use crate::sampler::Capture;

/// Percentiles that define the detection threshold. Chosen as a robust
/// default; tunable if a sensor with a very different duty cycle shows up.
const FLOOR_PERCENTILE: f64 = 0.05;
const CEILING_PERCENTILE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseKind {
    Flash,
    Beep,
}

/// One detected pulse, timed on the device clock. Created once by the
/// detector and never mutated.
#[derive(Debug, Clone, Copy)]
pub struct Pulse {
    pub channel: usize,
    pub kind: PulseKind,
    /// Device-clock instant of the pulse midpoint.
    pub mid_device_nanos: i64,
    /// Half the rising-to-falling interval, in nanoseconds.
    pub half_width_nanos: i64,
}

/// Derived per-block signal for a channel: what the edge finder scans.
fn derived_signal(kind: PulseKind, max: &[u8], min: &[u8]) -> Vec<i32> {
    match kind {
        PulseKind::Flash => max.iter().map(|&v| v as i32).collect(),
        PulseKind::Beep => max
            .iter()
            .zip(min.iter())
            .map(|(&hi, &lo)| hi as i32 - lo as i32)
            .collect(),
    }
}

/// Threshold halfway between the signal floor and ceiling, estimated by
/// percentile over a single sorted pass.
fn threshold(signal: &[i32]) -> f64 {
    let mut sorted = signal.to_vec();
    sorted.sort_unstable();
    let pick = |p: f64| sorted[((sorted.len() - 1) as f64 * p).round() as usize];
    let floor = pick(FLOOR_PERCENTILE);
    let ceiling = pick(CEILING_PERCENTILE);
    (floor + ceiling) as f64 / 2.0
}

/// Edge-finder state machine. Returns `(rise, fall)` index pairs where
/// `rise` is the first block at or above threshold and `fall` the first
/// block past the last high one. Starts in the high state so a pulse
/// already in progress when sampling began is discarded rather than
/// reported with a truncated width.
fn scan_edges(signal: &[i32], thr: f64, hold_blocks: usize) -> Vec<(usize, usize)> {
    #[derive(PartialEq)]
    enum State {
        Lo,
        Hi,
    }

    let mut intervals = Vec::new();
    let mut state = State::Hi;
    let mut ignore_first = true;
    let mut rise = 0usize;
    let mut latest_hi: i64 = -1;

    for (i, &v) in signal.iter().enumerate() {
        match state {
            State::Lo => {
                if v as f64 >= thr {
                    state = State::Hi;
                    rise = i;
                    latest_hi = i as i64;
                }
            }
            State::Hi => {
                if v as f64 >= thr {
                    latest_hi = i as i64;
                } else if i as i64 - latest_hi > hold_blocks as i64 {
                    state = State::Lo;
                    if !ignore_first {
                        intervals.push((rise, (latest_hi + 1) as usize));
                    }
                    ignore_first = false;
                }
            }
        }
    }
    // a pulse still high at the end of the buffer is truncated; drop it
    intervals
}

/// Detect the pulses on one channel of a capture.
///
/// `approx_duration_secs` is the metadata's hint for the pulse length; it
/// sets the hold interval (half the duration) and the width gate (a pulse
/// narrower than a quarter or wider than three times the hint is noise).
/// Deterministic and restartable: the same capture yields the same pulses.
pub fn detect_pulses(
    capture: &Capture,
    position: usize,
    channel: usize,
    kind: PulseKind,
    approx_duration_secs: f64,
) -> Vec<Pulse> {
    let (max, min) = capture.channel_samples(position);
    let signal = derived_signal(kind, &max, &min);
    if signal.is_empty() {
        return Vec::new();
    }

    let thr = threshold(&signal);
    let hold_blocks = (approx_duration_secs * 500.0).floor() as usize;
    let block_nanos = (capture.end_device_nanos - capture.start_device_nanos) as f64
        / capture.n_blocks as f64;

    let min_width_secs = approx_duration_secs / 4.0;
    let max_width_secs = approx_duration_secs * 3.0;

    let mut pulses = Vec::new();
    for (rise, fall) in scan_edges(&signal, thr, hold_blocks) {
        let width_secs = (fall - rise) as f64 * block_nanos / NANOS_PER_SEC;
        if width_secs < min_width_secs || width_secs > max_width_secs {
            continue;
        }
        let mid_blocks = (rise + fall) as f64 / 2.0;
        pulses.push(Pulse {
            channel,
            kind,
            mid_device_nanos: capture.start_device_nanos
                + (mid_blocks * block_nanos).round() as i64,
            half_width_nanos: ((fall - rise) as f64 / 2.0 * block_nanos).round() as i64,
        });
    }
    pulses
}
