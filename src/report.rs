// Verdict reporting
//
// Classifies each aligned residual against the operator's tolerance and
// prints the human-readable measurement report. A pulse is in tolerance
// when the interval [diff − bound, diff + bound] overlaps [−tol, +tol];
// equivalently |diff| − bound ≤ tol. The report is the tool's product and
// goes to stdout; diagnostics go through tracing like everything else.

use crate::clock::TickRate;
use crate::correlate::Alignment;

/// Tolerance classification for one channel's residuals.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    /// Per-pulse excess beyond tolerance-plus-bound, in seconds. Zero for
    /// pulses that passed; signed like the residual (positive = early).
    pub excesses: Vec<f64>,
}

/// Gap between two closed ranges, zero if they overlap. The sign says
/// which side: negative when `a` lies below `b`, positive when above.
fn gap_between_ranges(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (a_lo, a_hi) = a;
    let (b_lo, b_hi) = b;
    if a_lo > b_hi {
        a_lo - b_hi
    } else if a_hi < b_lo {
        a_hi - b_lo
    } else {
        0.0
    }
}

/// Judge every residual of an alignment against `tolerance_secs`.
pub fn assess(alignment: &Alignment, rate: &TickRate, tolerance_secs: f64) -> Verdict {
    let mut excesses = Vec::with_capacity(alignment.residuals.len());
    let mut passed = true;
    for r in &alignment.residuals {
        let diff = rate.ticks_to_secs(r.diff_ticks);
        let bound = rate.ticks_to_secs(r.bound_ticks);
        let gap = gap_between_ranges((diff - bound, diff + bound), (-tolerance_secs, tolerance_secs));
        if gap != 0.0 {
            passed = false;
        }
        excesses.push(gap);
    }
    Verdict { passed, excesses }
}

fn early_late(value: f64) -> &'static str {
    if value > 0.0 {
        "(EARLY)"
    } else if value < 0.0 {
        "(LATE)"
    } else {
        ""
    }
}

fn to_millis(secs: f64) -> f64 {
    secs * 1000.0
}

/// Print the per-channel measurement report, and the tolerance test result
/// when a tolerance was supplied. Returns the verdict (pass when no
/// tolerance was requested).
pub fn print_channel_report(
    channel_name: &str,
    alignment: &Alignment,
    first_frame_ticks: i64,
    rate: &TickRate,
    tolerance_secs: Option<f64>,
) -> Verdict {
    let diffs_secs: Vec<f64> = alignment
        .residuals
        .iter()
        .map(|r| rate.ticks_to_secs(r.diff_ticks))
        .collect();
    let bounds_secs: Vec<f64> = alignment
        .residuals
        .iter()
        .map(|r| rate.ticks_to_secs(r.bound_ticks))
        .collect();

    let matched_secs = rate
        .ticks_to_secs(alignment.residuals[0].expected_ticks - first_frame_ticks as f64);

    println!();
    println!("Results for channel: {}", channel_name);
    println!("----------------------------");
    println!(
        "First observed flash/beep matched to one expected at {:.3} seconds into the test video sequence. There were {} readings recorded.",
        matched_secs,
        diffs_secs.len()
    );

    let min = diffs_secs.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = diffs_secs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let offset_secs = rate.ticks_to_secs(alignment.offset_ticks);
    let jitter_secs = rate.ticks_to_secs(alignment.jitter_ticks);

    println!();
    println!("Range of offsets between observed and expected:");
    println!("    Lowest        : {:7.0}   milliseconds {}", to_millis(min).round(), early_late(min));
    println!("    AVERAGE (mean): {:7.0}   milliseconds {}", to_millis(offset_secs).round(), early_late(offset_secs));
    println!("    Highest       : {:7.0}   milliseconds {}", to_millis(max).round(), early_late(max));
    println!("    Std. deviation: {:9.1} milliseconds", to_millis(jitter_secs));

    let err_min = bounds_secs.iter().cloned().fold(f64::INFINITY, f64::min);
    let err_max = bounds_secs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let err_mean = bounds_secs.iter().sum::<f64>() / bounds_secs.len() as f64;

    println!();
    println!("Total measurement error bounds (range of uncertainty):");
    println!("   Lowest        : {:8.3} milliseconds", to_millis(err_min));
    println!("   Average (mean): {:8.3} milliseconds", to_millis(err_mean));
    println!("   Highest       : {:8.3} milliseconds", to_millis(err_max));

    let Some(tolerance) = tolerance_secs else {
        return Verdict { passed: true, excesses: vec![0.0; diffs_secs.len()] };
    };

    let verdict = assess(alignment, rate, tolerance);
    println!();
    println!("Accuracy tolerance specified of {:.3} milliseconds", to_millis(tolerance));
    if verdict.passed {
        println!("    PASSED ... all observations within the tolerance interval");
        println!("               (after taking into account measurement error bounds)");
    } else {
        let num_fails = verdict.excesses.iter().filter(|&&e| e != 0.0).count();
        println!(
            "    FAILED ... {} of {} observations outside the tolerance interval",
            num_fails,
            verdict.excesses.len()
        );
        println!("               (taking into account measurement error bounds)");
        println!();
        for (i, &e) in verdict.excesses.iter().enumerate() {
            if e != 0.0 {
                println!(
                    "        Observation {} was outside tolerance and error margin by {:.3} milliseconds {}",
                    i + 1,
                    to_millis(e),
                    early_late(e)
                );
            }
        }
    }
    println!();
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::Residual;

    const RATE: TickRate = TickRate { units_per_tick: 1, units_per_sec: 90000 };

    fn alignment_of(diffs_ms: &[f64], bound_ms: f64) -> Alignment {
        let residuals: Vec<Residual> = diffs_ms
            .iter()
            .map(|&d| Residual {
                observed_ticks: 0.0,
                expected_ticks: d / 1000.0 * 90000.0,
                diff_ticks: d / 1000.0 * 90000.0,
                bound_ticks: bound_ms / 1000.0 * 90000.0,
            })
            .collect();
        let diffs: Vec<f64> = residuals.iter().map(|r| r.diff_ticks).collect();
        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let var = diffs.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / diffs.len() as f64;
        Alignment { match_index: 0, offset_ticks: mean, jitter_ticks: var.sqrt(), residuals }
    }

    #[test]
    fn test_gap_between_ranges() {
        assert_eq!(gap_between_ranges((0.0, 10.0), (15.0, 25.0)), -5.0);
        assert_eq!(gap_between_ranges((0.0, 10.0), (9.0, 20.0)), 0.0);
        assert_eq!(gap_between_ranges((20.0, 30.0), (10.0, 18.0)), 2.0);
    }

    #[test]
    fn test_within_tolerance_passes() {
        // residuals near 2 ms with 1 ms bounds against an 8 ms tolerance
        let alignment = alignment_of(&[1.8, 2.1, -1.5, 0.4], 1.0);
        let verdict = assess(&alignment, &RATE, 0.008);
        assert!(verdict.passed);
        assert!(verdict.excesses.iter().all(|&e| e == 0.0));
    }

    #[test]
    fn test_bound_rescues_marginal_residual() {
        // 15 ms residual with a bound that reaches back inside a 23 ms
        // tolerance passes; the same residual with a tiny bound against a
        // 10 ms tolerance does not
        let alignment = alignment_of(&[15.0], 9.0);
        assert!(assess(&alignment, &RATE, 0.023).passed);

        let alignment = alignment_of(&[15.0], 0.5);
        let verdict = assess(&alignment, &RATE, 0.010);
        assert!(!verdict.passed);
        assert!((verdict.excesses[0] - 0.0045).abs() < 1e-9);
    }

    #[test]
    fn test_consistent_lag_fails_with_sign() {
        // device lags 30 ms, tolerance 10 ms, bounds 2 ms: every pulse
        // fails on the late side
        let alignment = alignment_of(&[-30.0, -29.6, -30.2], 2.0);
        let verdict = assess(&alignment, &RATE, 0.010);
        assert!(!verdict.passed);
        assert_eq!(verdict.excesses.iter().filter(|&&e| e != 0.0).count(), 3);
        assert!(verdict.excesses.iter().all(|&e| e < 0.0));
        assert!((verdict.excesses[0] + 0.018).abs() < 1e-9);
    }

    #[test]
    fn test_print_report_smoke() {
        let alignment = alignment_of(&[1.4, 1.2, 1.6], 0.9);
        let verdict = print_channel_report("LIGHT_0", &alignment, 0, &RATE, Some(0.008));
        assert!(verdict.passed);
        let verdict = print_channel_report("LIGHT_0", &alignment, 0, &RATE, None);
        assert!(verdict.passed);
    }
}
