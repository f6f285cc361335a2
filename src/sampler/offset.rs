// Clock-offset estimation between the host wall clock and the device timer
//
// One `'T'` ping yields one estimate: the device timestamp is assumed to
// lie at the midpoint of the host-side round trip, so half the round trip
// bounds the uncertainty. Two estimates bracket the sampling window; any
// device instant inside it converts to host time by linear interpolation.

use crate::clock::NANOS_PER_SEC;
use crate::error::MeasureError;
use crate::sampler::link::RoundTrip;

/// One request/response estimate of (device clock − host wall clock).
#[derive(Debug, Clone, Copy)]
pub struct OffsetEstimate {
    /// Host wall-clock midpoint of the round trip.
    pub host_nanos: i64,
    /// Device timestamp returned in the reply.
    pub device_nanos: i64,
    /// Half the host-side round-trip time, in seconds. Bounds the error of
    /// `device_nanos − host_nanos`.
    pub half_rtt_secs: f64,
}

impl OffsetEstimate {
    pub fn from_round_trip(rt: &RoundTrip) -> Self {
        OffsetEstimate {
            host_nanos: (rt.sent_wall_nanos + rt.received_wall_nanos) / 2,
            device_nanos: rt.device_nanos,
            half_rtt_secs: (rt.received_wall_nanos - rt.sent_wall_nanos) as f64 / 2.0
                / NANOS_PER_SEC,
        }
    }
}

/// Linear device→host mapping through the pre- and post-sampling
/// estimates, with a conservative constant error bound.
#[derive(Debug, Clone, Copy)]
pub struct DeviceToWall {
    pre: OffsetEstimate,
    post: OffsetEstimate,
}

impl DeviceToWall {
    pub fn new(pre: OffsetEstimate, post: OffsetEstimate) -> Result<Self, MeasureError> {
        if post.device_nanos <= pre.device_nanos || post.host_nanos <= pre.host_nanos {
            return Err(MeasureError::LinkFault(
                "clock-offset estimates do not bracket the sampling window".into(),
            ));
        }
        Ok(DeviceToWall { pre, post })
    }

    /// Host wall-clock instant corresponding to `device_nanos`, by the
    /// straight line through the two estimate points. Extrapolates beyond
    /// them, which the error bound already covers.
    pub fn wall_at(&self, device_nanos: i64) -> i64 {
        let frac = (device_nanos - self.pre.device_nanos) as f64
            / (self.post.device_nanos - self.pre.device_nanos) as f64;
        self.pre.host_nanos
            + (frac * (self.post.host_nanos - self.pre.host_nanos) as f64).round() as i64
    }

    /// Conservative uncertainty of any conversion inside the window: the
    /// two half-round-trips summed, not interpolated.
    pub fn bound_secs(&self) -> f64 {
        self.pre.half_rtt_secs + self.post.half_rtt_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(host: i64, device: i64, half_rtt_secs: f64) -> OffsetEstimate {
        OffsetEstimate { host_nanos: host, device_nanos: device, half_rtt_secs }
    }

    #[test]
    fn test_estimate_from_round_trip() {
        let rt = RoundTrip {
            sent_wall_nanos: 1_000_000_000,
            device_nanos: 58_200_015_000,
            received_wall_nanos: 1_000_350_000,
        };
        let est = OffsetEstimate::from_round_trip(&rt);
        assert_eq!(est.host_nanos, 1_000_175_000);
        assert_eq!(est.device_nanos, 58_200_015_000);
        assert!((est.half_rtt_secs - 175e-9 * 1000.0).abs() < 1e-12);
    }

    #[test]
    fn test_interpolation_hits_endpoints_and_midpoint() {
        let conv =
            DeviceToWall::new(estimate(100, 1000, 0.001), estimate(200, 2000, 0.002)).unwrap();
        assert_eq!(conv.wall_at(1000), 100);
        assert_eq!(conv.wall_at(2000), 200);
        assert_eq!(conv.wall_at(1500), 150);
        // extrapolation
        assert_eq!(conv.wall_at(2500), 250);
    }

    #[test]
    fn test_interpolation_monotone() {
        let conv = DeviceToWall::new(
            estimate(1_000_000, 5_000_000, 0.0005),
            estimate(16_000_000, 20_000_123, 0.0007),
        )
        .unwrap();
        let mut prev = conv.wall_at(5_000_000);
        for d in (5_000_000..20_000_000).step_by(1_000_000) {
            let w = conv.wall_at(d);
            assert!(w >= prev);
            prev = w;
        }
    }

    #[test]
    fn test_bound_is_sum_of_half_round_trips() {
        let conv =
            DeviceToWall::new(estimate(0, 0, 0.0003), estimate(1000, 1000, 0.0004)).unwrap();
        assert!((conv.bound_secs() - 0.0007).abs() < 1e-12);
        assert!(conv.bound_secs() >= 0.0003);
        assert!(conv.bound_secs() >= 0.0004);
    }

    #[test]
    fn test_degenerate_estimates_rejected() {
        assert!(DeviceToWall::new(estimate(100, 1000, 0.0), estimate(100, 2000, 0.0)).is_err());
        assert!(DeviceToWall::new(estimate(100, 2000, 0.0), estimate(200, 2000, 0.0)).is_err());
    }
}
