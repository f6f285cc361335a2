// Dispersion recorder
//
// Piecewise-constant log of wall-clock dispersion over the measurement
// window. In the client role the wall-clock client appends an entry each
// time it adopts a new sync candidate; in the server role the host's own
// clock is the reference and a single zero entry covers the whole window.
// Append-only during measurement; the analysis works on a clone taken at
// ANALYSING entry.

/// One recorded dispersion observation.
#[derive(Debug, Clone, Copy)]
pub struct DispersionRecord {
    pub wall_nanos: i64,
    pub dispersion_secs: f64,
}

#[derive(Debug, Clone)]
pub struct DispersionRecorder {
    records: Vec<DispersionRecord>,
}

impl DispersionRecorder {
    pub fn new() -> Self {
        DispersionRecorder { records: Vec::new() }
    }

    /// Recorder for the server role: the host clock is the reference, so
    /// dispersion is zero for the entire measurement.
    pub fn zero(wall_nanos: i64) -> Self {
        DispersionRecorder {
            records: vec![DispersionRecord { wall_nanos, dispersion_secs: 0.0 }],
        }
    }

    pub fn record(&mut self, wall_nanos: i64, dispersion_secs: f64) {
        debug_assert!(dispersion_secs >= 0.0);
        self.records.push(DispersionRecord { wall_nanos, dispersion_secs });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<DispersionRecord> {
        self.records.last().copied()
    }

    /// Dispersion in effect at wall-clock instant `wall_nanos`: the most
    /// recently recorded value at or before it, held constant between
    /// updates. A query before the first record returns the first record's
    /// value. Entries are scanned in receipt order rather than bisected
    /// because a clock slew can move recorded instants backwards.
    pub fn dispersion_at(&self, wall_nanos: i64) -> Option<f64> {
        let mut found = None;
        for r in &self.records {
            if r.wall_nanos <= wall_nanos {
                found = Some(r.dispersion_secs);
            }
        }
        found.or_else(|| self.records.first().map(|r| r.dispersion_secs))
    }
}

impl Default for DispersionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_has_no_answer() {
        let rec = DispersionRecorder::new();
        assert!(rec.dispersion_at(0).is_none());
    }

    #[test]
    fn test_zero_recorder() {
        let rec = DispersionRecorder::zero(100);
        assert_eq!(rec.dispersion_at(0), Some(0.0));
        assert_eq!(rec.dispersion_at(1_000_000), Some(0.0));
    }

    #[test]
    fn test_lookup_holds_last_value() {
        let mut rec = DispersionRecorder::new();
        rec.record(100, 0.002);
        rec.record(200, 0.004);
        rec.record(300, 0.006);

        assert_eq!(rec.dispersion_at(100), Some(0.002));
        assert_eq!(rec.dispersion_at(150), Some(0.002));
        assert_eq!(rec.dispersion_at(200), Some(0.004));
        assert_eq!(rec.dispersion_at(299), Some(0.004));
        assert_eq!(rec.dispersion_at(10_000), Some(0.006));
    }

    #[test]
    fn test_query_before_first_returns_first() {
        let mut rec = DispersionRecorder::new();
        rec.record(1000, 0.0015);
        rec.record(2000, 0.0025);
        assert_eq!(rec.dispersion_at(500), Some(0.0015));
    }

    #[test]
    fn test_backwards_slew_uses_latest_entry() {
        // a clock adjustment can stamp a later entry with an earlier
        // wall instant; the later entry must win for instants it covers
        let mut rec = DispersionRecorder::new();
        rec.record(1000, 0.005);
        rec.record(900, 0.001);
        assert_eq!(rec.dispersion_at(950), Some(0.001));
        assert_eq!(rec.dispersion_at(1500), Some(0.001));
    }
}
