// Error taxonomy for the measurement pipeline
//
// Out-of-tolerance is deliberately NOT an error: a completed measurement
// that fails the tolerance test is a verdict, produced by the reporter.
// Only the binaries map errors to process exit codes.

use thiserror::Error;

/// Exit code for a measurement that ran to completion and passed.
pub const EXIT_PASS: i32 = 0;
/// Exit code for a measurement that ran to completion but failed the
/// tolerance test.
pub const EXIT_FAIL: i32 = 1;

#[derive(Debug, Error)]
pub enum MeasureError {
    /// Serial framing or read failure on the sampler link. Fatal.
    #[error("sampler link fault: {0}")]
    LinkFault(String),

    /// Unexpected termination or malformed frame on any of the three
    /// protocol services. Fatal.
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// A translation was requested while the in-effect correlation was
    /// null or paused.
    #[error("no timeline available at the queried instant")]
    NoTimeline,

    /// Fewer pulses were detected than the maximal-length-sequence window;
    /// the observation cannot be uniquely placed in the sequence.
    #[error("insufficient observations: {got} pulses detected, need at least {need}")]
    InsufficientObservations { got: usize, need: usize },

    /// More pulses detected than the metadata lists. Usually the wrong
    /// input is plugged into the sampler.
    #[error("{got} pulses detected but only {expected} expected; is the right input connected?")]
    ExcessObservations { got: usize, expected: usize },

    /// Wall-clock dispersion never fell below the configured ceiling
    /// within the allowed interval (TV-measuring mode only).
    #[error("wall clock dispersion {got_millis:.3} ms still above ceiling {ceiling_millis:.3} ms")]
    DispersionCeiling { got_millis: f64, ceiling_millis: f64 },

    /// Operator cancelled the measurement.
    #[error("measurement aborted by operator")]
    UserAbort,

    /// Bad command line or metadata input.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MeasureError {
    /// Process exit code for this error, per the documented CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            MeasureError::LinkFault(_)
            | MeasureError::ProtocolFault(_)
            | MeasureError::NoTimeline
            | MeasureError::ExcessObservations { .. }
            | MeasureError::DispersionCeiling { .. }
            | MeasureError::Config(_) => 2,
            MeasureError::InsufficientObservations { .. } => 3,
            MeasureError::UserAbort => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MeasureError::LinkFault("x".into()).exit_code(), 2);
        assert_eq!(MeasureError::ProtocolFault("x".into()).exit_code(), 2);
        assert_eq!(MeasureError::NoTimeline.exit_code(), 2);
        assert_eq!(MeasureError::InsufficientObservations { got: 3, need: 7 }.exit_code(), 3);
        assert_eq!(MeasureError::UserAbort.exit_code(), 4);
    }

    #[test]
    fn test_messages_name_the_numbers() {
        let e = MeasureError::InsufficientObservations { got: 3, need: 7 };
        let msg = e.to_string();
        assert!(msg.contains('3') && msg.contains('7'));
    }
}
