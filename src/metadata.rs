// Test-sequence metadata
//
// The test video generator emits a JSON document alongside the clip listing
// when each beep/flash is centred, how long the maximal-length-sequence
// window is, and the approximate pulse durations. We consume it read-only.

use std::path::Path;

use serde::Deserialize;

use crate::clock::TickRate;
use crate::detect::PulseKind;
use crate::error::MeasureError;

/// Parsed metadata for one test sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceMetadata {
    /// Centre time of each beep/flash, in seconds from sequence start.
    pub event_centre_times: Vec<f64>,
    /// Total sequence duration: 2^patternWindowLength − 1 seconds.
    pub duration_secs: u64,
    /// The maximal-length-sequence window N: any N consecutive events
    /// uniquely identify a position in the sequence.
    pub pattern_window_length: usize,
    pub fps: f64,
    /// Video frame size (width, height). Informational only.
    pub size: [u32; 2],
    pub approx_flash_duration_secs: f64,
    pub approx_beep_duration_secs: f64,
}

impl SequenceMetadata {
    pub fn load(path: &Path) -> Result<SequenceMetadata, MeasureError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MeasureError::Config(format!("cannot read metadata file {}: {}", path.display(), e))
        })?;
        let meta: SequenceMetadata = serde_json::from_str(&text).map_err(|e| {
            MeasureError::Config(format!("bad metadata JSON in {}: {}", path.display(), e))
        })?;
        if meta.event_centre_times.is_empty() {
            return Err(MeasureError::Config(format!(
                "metadata file {} lists no events",
                path.display()
            )));
        }
        Ok(meta)
    }

    /// Expected timeline tick of every event, given the tick value declared
    /// to correspond to the first frame of the test video.
    pub fn expected_ticks(&self, first_frame_ticks: i64, rate: &TickRate) -> Vec<f64> {
        self.event_centre_times
            .iter()
            .map(|t| first_frame_ticks as f64 + rate.secs_to_ticks(*t))
            .collect()
    }

    pub fn approx_duration_secs(&self, kind: PulseKind) -> f64 {
        match kind {
            PulseKind::Flash => self.approx_flash_duration_secs,
            PulseKind::Beep => self.approx_beep_duration_secs,
        }
    }
}
