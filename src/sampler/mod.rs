// Sampling microcontroller interface: the framed serial conversation and
// the host↔device clock-offset estimation built on top of it.

pub mod link;
pub mod offset;

pub use link::{Capture, RoundTrip, SamplerLink, SamplerPort, SerialSamplerPort};
pub use offset::{DeviceToWall, OffsetEstimate};
