// Sequence correlation
//
// The observed pulse train is a contiguous window of the known test
// sequence. Because the sequence's gaps follow a maximal-length pattern,
// any window of at least `pattern_window_length` events is unique, so the
// lowest-variance alignment of observed against expected identifies the
// playback position. Residual sign convention: positive means the pulse
// was observed EARLY relative to the expected timeline instant, negative
// means late.

use crate::error::MeasureError;
use crate::translate::TranslatedInstant;

/// One aligned observation.
#[derive(Debug, Clone, Copy)]
pub struct Residual {
    pub observed_ticks: f64,
    pub expected_ticks: f64,
    /// `expected − observed`, in ticks. Positive = early, negative = late.
    pub diff_ticks: f64,
    /// Measurement error bound for this observation, in ticks.
    pub bound_ticks: f64,
}

/// Best-fit alignment of the observed pulse train against the expected
/// sequence.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Index into the expected list matched by the first observation.
    pub match_index: usize,
    /// Mean residual, in ticks.
    pub offset_ticks: f64,
    /// Standard deviation of the residuals, in ticks.
    pub jitter_ticks: f64,
    pub residuals: Vec<Residual>,
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population variance.
fn variance(data: &[f64]) -> f64 {
    let avg = mean(data);
    data.iter().map(|v| (v - avg) * (v - avg)).sum::<f64>() / data.len() as f64
}

/// Align `observed` (timeline ticks with bounds, in pulse order) against
/// `expected` (ticks of every event in the full sequence).
///
/// Tries every offset, scores each by the variance of its residuals, and
/// picks the minimum; ties break towards the smallest |mean residual|,
/// then the smallest offset. Assumes no observed pulse was missed or
/// inserted.
pub fn align(
    observed: &[TranslatedInstant],
    expected: &[f64],
    pattern_window_length: usize,
) -> Result<Alignment, MeasureError> {
    if observed.len() < pattern_window_length || observed.is_empty() {
        return Err(MeasureError::InsufficientObservations {
            got: observed.len(),
            need: pattern_window_length.max(1),
        });
    }
    if observed.len() > expected.len() {
        return Err(MeasureError::ExcessObservations {
            got: observed.len(),
            expected: expected.len(),
        });
    }

    let last_offset = expected.len() - observed.len();
    let mut best: Option<(f64, f64, usize)> = None; // (variance, |mean|, offset)

    for k in 0..=last_offset {
        let diffs: Vec<f64> = observed
            .iter()
            .enumerate()
            .map(|(i, o)| expected[i + k] - o.ticks)
            .collect();
        let var = variance(&diffs);
        let abs_mean = mean(&diffs).abs();
        let candidate = (var, abs_mean, k);
        let better = match best {
            None => true,
            Some(b) => (candidate.0, candidate.1, candidate.2) < b,
        };
        if better {
            best = Some(candidate);
        }
    }

    let (var, _, match_index) = best.expect("at least one offset was scored");

    let residuals: Vec<Residual> = observed
        .iter()
        .enumerate()
        .map(|(i, o)| Residual {
            observed_ticks: o.ticks,
            expected_ticks: expected[i + match_index],
            diff_ticks: expected[i + match_index] - o.ticks,
            bound_ticks: o.bound_ticks,
        })
        .collect();
    let diffs: Vec<f64> = residuals.iter().map(|r| r.diff_ticks).collect();

    Ok(Alignment {
        match_index,
        offset_ticks: mean(&diffs),
        jitter_ticks: var.sqrt(),
        residuals,
    })
}
