// Sampler link
//
// Framed binary conversation with the sampling microcontroller over its
// USB virtual COM port. The command language is eight single-byte opcodes;
// every host→device byte triggers a reply that begins with a four-byte
// big-endian device-clock microsecond counter, followed by opcode-specific
// payload. The 32-bit microsecond counter wraps roughly every 71 minutes,
// so the link unwraps it into a monotone nanosecond value.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::WallClock;
use crate::error::MeasureError;

const OPCODE_ENABLE: [u8; 4] = [b'0', b'1', b'2', b'3'];
const OPCODE_PREPARE: u8 = b'4';
const OPCODE_SAMPLE: u8 = b'S';
const OPCODE_BULK: u8 = b'B';
const OPCODE_PING: u8 = b'T';

/// Sample buffer capacity of the device, in bytes.
pub const BUFFER_CAPACITY: usize = 92_160;
/// Serial line settings for the device's virtual COM port.
pub const BAUD_RATE: u32 = 2_304_200;
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Device microsecond counter wrap period, in nanoseconds.
const DEVICE_WRAP_NANOS: i64 = (1u64 << 32) as i64 * 1000;

/// Number of millisecond blocks the device captures for a given channel
/// count. Host-side mirror of the device's buffer arithmetic, used to
/// cross-check what `prepare` reports.
pub fn blocks_for_channels(n_channels: usize) -> usize {
    BUFFER_CAPACITY / (2 * n_channels)
}

/// Byte transport to the sampler. Implemented by the real serial port and
/// by a scripted in-memory port in tests.
pub trait SamplerPort: Send {
    fn send(&mut self, byte: u8) -> io::Result<()>;
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// The real transport: a USB virtual COM port at 2,304,200 baud 8N1.
pub struct SerialSamplerPort {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialSamplerPort {
    pub fn open(path: &str) -> Result<Self, MeasureError> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| MeasureError::LinkFault(format!("cannot open {}: {}", path, e)))?;
        info!("Sampler connected on {}", path);
        Ok(SerialSamplerPort { port })
    }
}

impl SamplerPort for SerialSamplerPort {
    fn send(&mut self, byte: u8) -> io::Result<()> {
        self.port.write_all(&[byte])?;
        self.port.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.port.read_exact(buf)
    }
}

/// Round-trip timing for one command exchange: host wall-clock instants
/// bracketing the read of the device's leading timestamp.
#[derive(Debug, Clone, Copy)]
pub struct RoundTrip {
    /// Host wall clock just before the command byte was sent.
    pub sent_wall_nanos: i64,
    /// Device clock (unwrapped, nanoseconds) when the command arrived.
    pub device_nanos: i64,
    /// Host wall clock just after the device timestamp was fully read.
    pub received_wall_nanos: i64,
}

/// One completed capture: per-channel (max, min) byte pairs for every
/// millisecond block, plus the device-clock instants bounding the window.
#[derive(Debug, Clone)]
pub struct Capture {
    pub start_device_nanos: i64,
    pub end_device_nanos: i64,
    pub n_blocks: usize,
    pub n_channels: usize,
    /// `n_blocks * n_channels * 2` bytes, `(max, min)` per channel per
    /// block, channels in ascending enabled-index order.
    pub data: Vec<u8>,
}

impl Capture {
    /// Split out one channel (by position among the enabled channels) into
    /// separate max and min sample vectors.
    pub fn channel_samples(&self, position: usize) -> (Vec<u8>, Vec<u8>) {
        assert!(position < self.n_channels);
        let mut max = Vec::with_capacity(self.n_blocks);
        let mut min = Vec::with_capacity(self.n_blocks);
        for block in 0..self.n_blocks {
            let base = (block * self.n_channels + position) * 2;
            max.push(self.data[base]);
            min.push(self.data[base + 1]);
        }
        (max, min)
    }

    /// Cap the capture at `max_blocks` millisecond blocks, rescaling the
    /// end instant to the new last block boundary. Used to honour a
    /// configured measurement duration shorter than the device's buffer.
    pub fn truncate_blocks(&mut self, max_blocks: usize) {
        if max_blocks == 0 || max_blocks >= self.n_blocks {
            return;
        }
        let span = self.end_device_nanos - self.start_device_nanos;
        let kept_span = (span as f64 * max_blocks as f64 / self.n_blocks as f64) as i64;
        self.end_device_nanos = self.start_device_nanos + kept_span;
        self.n_blocks = max_blocks;
        self.data.truncate(max_blocks * self.n_channels * 2);
    }
}

/// The framed conversation itself. Owns the port exclusively; all methods
/// are blocking and are expected to run on the blocking thread pool.
pub struct SamplerLink<P: SamplerPort> {
    port: P,
    wall: Arc<WallClock>,
    /// Accumulated wrap offset added to every device timestamp.
    device_epoch_nanos: i64,
    last_device_nanos: i64,
}

impl<P: SamplerPort> SamplerLink<P> {
    pub fn new(port: P, wall: Arc<WallClock>) -> Self {
        SamplerLink {
            port,
            wall,
            device_epoch_nanos: 0,
            last_device_nanos: 0,
        }
    }

    fn read_u32(&mut self) -> Result<u32, MeasureError> {
        let mut buf = [0u8; 4];
        self.port
            .read_exact(&mut buf)
            .map_err(|e| MeasureError::LinkFault(format!("short read: {}", e)))?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Unwrap a raw 32-bit microsecond reading into monotone nanoseconds.
    fn unwrap_device_micros(&mut self, micros: u32) -> i64 {
        let mut nanos = micros as i64 * 1000 + self.device_epoch_nanos;
        while nanos < self.last_device_nanos {
            self.device_epoch_nanos += DEVICE_WRAP_NANOS;
            nanos += DEVICE_WRAP_NANOS;
        }
        self.last_device_nanos = nanos;
        nanos
    }

    /// Send one opcode and read the universal leading timestamp, timing
    /// the round trip on the host wall clock.
    fn exchange(&mut self, opcode: u8) -> Result<RoundTrip, MeasureError> {
        let sent_wall_nanos = self.wall.now_nanos();
        self.port
            .send(opcode)
            .map_err(|e| MeasureError::LinkFault(format!("write failed: {}", e)))?;
        let micros = self.read_u32()?;
        let received_wall_nanos = self.wall.now_nanos();
        let device_nanos = self.unwrap_device_micros(micros);
        debug!(
            "sampler exchange '{}': device={}ns rtt={}ns",
            opcode as char,
            device_nanos,
            received_wall_nanos - sent_wall_nanos
        );
        Ok(RoundTrip { sent_wall_nanos, device_nanos, received_wall_nanos })
    }

    /// Enable sampling of channel index 0..3. Idempotent; must precede
    /// `prepare`.
    pub fn enable_channel(&mut self, channel: usize) -> Result<RoundTrip, MeasureError> {
        let opcode = *OPCODE_ENABLE
            .get(channel)
            .ok_or_else(|| MeasureError::LinkFault(format!("no such channel: {}", channel)))?;
        self.exchange(opcode)
    }

    /// Ask the device what the next capture will look like. Returns
    /// (active channel count, millisecond block count).
    pub fn prepare(&mut self) -> Result<(usize, usize), MeasureError> {
        self.exchange(OPCODE_PREPARE)?;
        let n_channels = self.read_u32()? as usize;
        let n_blocks = self.read_u32()? as usize;
        if n_channels == 0 || n_blocks == 0 {
            return Err(MeasureError::LinkFault(
                "prepare reported zero channels or blocks; channel configuration lost".into(),
            ));
        }
        info!("Sampler prepared: {} channels, {} ms blocks", n_channels, n_blocks);
        Ok((n_channels, n_blocks))
    }

    /// Run the capture. Blocks for the entire sampling window (up to ~46 s
    /// with one channel enabled). Returns the device-clock window bounds
    /// and the block count.
    pub fn sample(&mut self) -> Result<(i64, i64, usize), MeasureError> {
        self.exchange(OPCODE_SAMPLE)?;
        let start_micros = self.read_u32()?;
        let end_micros = self.read_u32()?;
        let n_blocks = self.read_u32()? as usize;
        let start_device_nanos = self.unwrap_device_micros(start_micros);
        let end_device_nanos = self.unwrap_device_micros(end_micros);
        if end_device_nanos <= start_device_nanos || n_blocks == 0 {
            return Err(MeasureError::LinkFault(format!(
                "sample window inverted or empty: start={} end={} blocks={}",
                start_device_nanos, end_device_nanos, n_blocks
            )));
        }
        info!(
            "Sampler captured {} blocks over {:.3} s of device time",
            n_blocks,
            (end_device_nanos - start_device_nanos) as f64 / 1e9
        );
        Ok((start_device_nanos, end_device_nanos, n_blocks))
    }

    /// Upload the captured buffer. `n_blocks`/`n_channels` must come from
    /// the preceding `sample`/`prepare` replies; a count mismatch from the
    /// device is a link fault.
    pub fn bulk(&mut self, n_blocks: usize, n_channels: usize) -> Result<Vec<u8>, MeasureError> {
        self.exchange(OPCODE_BULK)?;
        let count = self.read_u32()? as usize;
        let expected = n_blocks * n_channels * 2;
        if count != expected {
            return Err(MeasureError::LinkFault(format!(
                "bulk count mismatch: device says {} bytes, expected {}",
                count, expected
            )));
        }
        let mut data = vec![0u8; count];
        self.port
            .read_exact(&mut data)
            .map_err(|e| MeasureError::LinkFault(format!("bulk transfer failed: {}", e)))?;
        Ok(data)
    }

    /// Timestamp-only exchange, used by the clock-offset estimator.
    pub fn ping(&mut self) -> Result<RoundTrip, MeasureError> {
        self.exchange(OPCODE_PING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted port: replays canned response bytes and records what the
    /// host sent.
    struct ScriptedPort {
        responses: Vec<u8>,
        cursor: usize,
        sent: Vec<u8>,
    }

    impl ScriptedPort {
        fn new(responses: Vec<u8>) -> Self {
            ScriptedPort { responses, cursor: 0, sent: Vec::new() }
        }
    }

    impl SamplerPort for ScriptedPort {
        fn send(&mut self, byte: u8) -> io::Result<()> {
            self.sent.push(byte);
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
            if self.cursor + buf.len() > self.responses.len() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "script exhausted"));
            }
            buf.copy_from_slice(&self.responses[self.cursor..self.cursor + buf.len()]);
            self.cursor += buf.len();
            Ok(())
        }
    }

    fn be32(v: u32) -> [u8; 4] {
        v.to_be_bytes()
    }

    fn link_with(responses: Vec<u8>) -> SamplerLink<ScriptedPort> {
        SamplerLink::new(ScriptedPort::new(responses), Arc::new(WallClock::new()))
    }

    #[test]
    fn test_capacity_arithmetic() {
        assert_eq!(blocks_for_channels(1), 46080);
        assert_eq!(blocks_for_channels(2), 23040);
        assert_eq!(blocks_for_channels(3), 15360);
        assert_eq!(blocks_for_channels(4), 11520);
    }

    #[test]
    fn test_ping_reads_exactly_the_timestamp() {
        let mut script = Vec::new();
        script.extend_from_slice(&be32(1_000_000));
        let mut link = link_with(script);
        let rt = link.ping().unwrap();
        assert_eq!(rt.device_nanos, 1_000_000_000);
        assert!(rt.received_wall_nanos >= rt.sent_wall_nanos);
        assert_eq!(link.port.sent, vec![b'T']);
        // stream fully consumed and aligned
        assert_eq!(link.port.cursor, link.port.responses.len());
    }

    #[test]
    fn test_prepare_framing_and_zero_fault() {
        let mut script = Vec::new();
        script.extend_from_slice(&be32(5));
        script.extend_from_slice(&be32(2));
        script.extend_from_slice(&be32(23040));
        let mut link = link_with(script);
        let (ch, blocks) = link.prepare().unwrap();
        assert_eq!((ch, blocks), (2, 23040));

        let mut script = Vec::new();
        script.extend_from_slice(&be32(6));
        script.extend_from_slice(&be32(0));
        script.extend_from_slice(&be32(0));
        let mut link = link_with(script);
        assert!(matches!(link.prepare(), Err(MeasureError::LinkFault(_))));
    }

    #[test]
    fn test_sample_and_bulk_round_trip() {
        let n_blocks = 4usize;
        let n_channels = 2usize;
        let mut script = Vec::new();
        // sample reply: ts, start, end, count
        script.extend_from_slice(&be32(10_000));
        script.extend_from_slice(&be32(10_100));
        script.extend_from_slice(&be32(10_100 + n_blocks as u32 * 1000));
        script.extend_from_slice(&be32(n_blocks as u32));
        // bulk reply: ts, byte count, payload
        script.extend_from_slice(&be32(20_000));
        script.extend_from_slice(&be32((n_blocks * n_channels * 2) as u32));
        for i in 0..(n_blocks * n_channels * 2) {
            script.push(i as u8);
        }
        let mut link = link_with(script);
        let (start, end, blocks) = link.sample().unwrap();
        assert_eq!(blocks, n_blocks);
        assert_eq!(end - start, n_blocks as i64 * 1_000_000);
        let data = link.bulk(blocks, n_channels).unwrap();
        assert_eq!(data.len(), n_blocks * n_channels * 2);
        assert_eq!(link.port.cursor, link.port.responses.len());
        assert_eq!(link.port.sent, vec![b'S', b'B']);
    }

    #[test]
    fn test_bulk_count_mismatch_is_fault() {
        let mut script = Vec::new();
        script.extend_from_slice(&be32(30_000));
        script.extend_from_slice(&be32(10));
        let mut link = link_with(script);
        assert!(matches!(link.bulk(4, 2), Err(MeasureError::LinkFault(_))));
    }

    #[test]
    fn test_short_read_is_fault() {
        let mut link = link_with(vec![0x00, 0x01]);
        assert!(matches!(link.ping(), Err(MeasureError::LinkFault(_))));
    }

    #[test]
    fn test_device_counter_unwrap() {
        let mut script = Vec::new();
        script.extend_from_slice(&be32(u32::MAX - 10));
        script.extend_from_slice(&be32(5));
        let mut link = link_with(script);
        let before = link.ping().unwrap();
        let after = link.ping().unwrap();
        assert!(after.device_nanos > before.device_nanos);
        assert_eq!(
            after.device_nanos - before.device_nanos,
            (5i64 + 11) * 1000
        );
    }

    #[test]
    fn test_channel_split_and_truncate() {
        let capture = Capture {
            start_device_nanos: 0,
            end_device_nanos: 4_000_000,
            n_blocks: 4,
            n_channels: 2,
            // blocks of (maxA,minA,maxB,minB)
            data: vec![
                10, 1, 20, 2, //
                11, 3, 21, 4, //
                12, 5, 22, 6, //
                13, 7, 23, 8,
            ],
        };
        let (max_a, min_a) = capture.channel_samples(0);
        let (max_b, min_b) = capture.channel_samples(1);
        assert_eq!(max_a, vec![10, 11, 12, 13]);
        assert_eq!(min_a, vec![1, 3, 5, 7]);
        assert_eq!(max_b, vec![20, 21, 22, 23]);
        assert_eq!(min_b, vec![2, 4, 6, 8]);

        let mut capture = capture;
        capture.truncate_blocks(2);
        assert_eq!(capture.n_blocks, 2);
        assert_eq!(capture.end_device_nanos, 2_000_000);
        assert_eq!(capture.data.len(), 2 * 2 * 2);

        // truncating to more blocks than captured is a no-op
        let before = capture.clone();
        capture.truncate_blocks(100);
        assert_eq!(capture.n_blocks, before.n_blocks);
        assert_eq!(capture.end_device_nanos, before.end_device_nanos);
    }
}
