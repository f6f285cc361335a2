use std::path::PathBuf;

use clap::{Args, Parser};

use crate::clock::TickRate;
use crate::detect::PulseKind;
use crate::error::MeasureError;
use crate::metadata::SequenceMetadata;

/// One sampler input selected for measurement, with the expected timings
/// loaded from its metadata file.
#[derive(Debug, Clone)]
pub struct MeasuredChannel {
    /// Input name as wired on the sampler ("LIGHT_0", "AUDIO_0", ...).
    pub name: &'static str,
    /// Sampler channel index (0..3).
    pub channel: usize,
    pub kind: PulseKind,
    pub metadata: SequenceMetadata,
}

/// Arguments shared by both tester roles.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// The contentId the measurement system pretends to be playing
    /// (server role) or asks the device under test for (client role).
    pub content_id: String,

    /// The timelineSelector for the synchronisation timeline
    /// (e.g. "urn:dvb:css:timeline:pts").
    pub timeline_selector: String,

    /// Units per tick of the timeline tick rate (1 for most timelines).
    pub units_per_tick: u32,

    /// Units per second of the timeline tick rate (e.g. 90000 for PTS).
    pub units_per_sec: u32,

    /// Timeline tick value corresponding to the first frame of the test
    /// video sequence.
    pub video_start_ticks: i64,

    /// Measure light sensor input 0, with expected flash timings from the
    /// named JSON metadata file.
    #[arg(long = "light0", value_name = "METADATA_JSON")]
    pub light0: Option<PathBuf>,

    /// Measure light sensor input 1.
    #[arg(long = "light1", value_name = "METADATA_JSON")]
    pub light1: Option<PathBuf>,

    /// Measure audio input 0, with expected beep timings from the named
    /// JSON metadata file.
    #[arg(long = "audio0", value_name = "METADATA_JSON")]
    pub audio0: Option<PathBuf>,

    /// Measure audio input 1.
    #[arg(long = "audio1", value_name = "METADATA_JSON")]
    pub audio1: Option<PathBuf>,

    /// Pass/fail tolerance in milliseconds. No pass/fail judgement is made
    /// when absent.
    #[arg(long = "toleranceTest", value_name = "MS")]
    pub tolerance_millis: Option<f64>,

    /// Cap the analysed measurement window, in seconds. The sampler always
    /// fills its buffer; blocks beyond this window are discarded.
    #[arg(long = "measureSecs", value_name = "SECS")]
    pub measure_secs: Option<u64>,

    /// Maximum frequency error of the local wall clock, in ppm.
    #[arg(long = "mfe", alias = "maxfreqerror", default_value_t = 500)]
    pub max_freq_error_ppm: u32,

    /// Serial device of the sampling microcontroller.
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub serial: String,

    /// Timeout for each orchestrator state transition, in seconds.
    #[arg(long = "stateTimeoutSecs", default_value_t = 120)]
    pub state_timeout_secs: u64,

    /// Verbose logging (DEBUG level).
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl CommonArgs {
    pub fn tick_rate(&self) -> TickRate {
        TickRate::new(self.units_per_tick, self.units_per_sec)
    }

    pub fn tolerance_secs(&self) -> Option<f64> {
        self.tolerance_millis.map(|ms| ms / 1000.0)
    }

    /// Load the metadata for every selected input. At least one input must
    /// be selected. Channel indices follow the sampler wiring: light
    /// sensors on 0 and 2, audio inputs on 1 and 3.
    pub fn measured_channels(&self) -> Result<Vec<MeasuredChannel>, MeasureError> {
        let wiring: [(&'static str, usize, PulseKind, &Option<PathBuf>); 4] = [
            ("LIGHT_0", 0, PulseKind::Flash, &self.light0),
            ("AUDIO_0", 1, PulseKind::Beep, &self.audio0),
            ("LIGHT_1", 2, PulseKind::Flash, &self.light1),
            ("AUDIO_1", 3, PulseKind::Beep, &self.audio1),
        ];
        let mut channels = Vec::new();
        for (name, channel, kind, path) in wiring {
            if let Some(path) = path {
                channels.push(MeasuredChannel {
                    name,
                    channel,
                    kind,
                    metadata: SequenceMetadata::load(path)?,
                });
            }
        }
        if channels.is_empty() {
            return Err(MeasureError::Config(
                "no light sensor or audio inputs have been specified".into(),
            ));
        }
        Ok(channels)
    }
}

/// Measures synchronisation timing for a companion-screen application by
/// pretending to be the TV device and serving all three protocols.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CsaTesterConfig {
    #[command(flatten)]
    pub common: CommonArgs,

    /// IP address or host name to bind the servers to.
    #[arg(long, default_value = "127.0.0.1")]
    pub addr: String,

    /// Port for the wall-clock server.
    #[arg(long = "wc-port", default_value_t = 6677)]
    pub wc_port: u16,

    /// Port for the timeline server.
    #[arg(long = "ts-port", default_value_t = 7681)]
    pub ts_port: u16,

    /// Port for the content-id server.
    #[arg(long = "cii-port", default_value_t = 7682)]
    pub cii_port: u16,

    /// Seconds to wait between unpausing the timeline and starting to
    /// measure, so playback can settle.
    #[arg(long = "waitSecs", default_value_t = 5.0)]
    pub wait_secs: f64,
}

/// Measures synchronisation timing for a TV device by pretending to be a
/// companion and connecting to the TV's protocol endpoints.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct TvTesterConfig {
    #[command(flatten)]
    pub common: CommonArgs,

    /// tcp://<host>:<port> URL of the TV's timeline endpoint.
    pub ts_url: String,

    /// udp://<host>:<port> URL of the TV's wall-clock endpoint.
    pub wc_url: String,

    /// tcp://<host>:<port> URL of the TV's content-id endpoint. When
    /// given, the measurement waits for a content-id record matching the
    /// configured stem before synchronising.
    #[arg(long = "cii", value_name = "URL")]
    pub cii_url: Option<String>,

    /// Local address to bind the wall-clock client to.
    #[arg(long = "wc-bind", default_value = "0.0.0.0:0")]
    pub wc_bind: String,

    /// Ceiling on wall-clock dispersion before sampling may begin, in
    /// milliseconds.
    #[arg(long = "dispersion-ceiling", value_name = "MS", default_value_t = 50.0)]
    pub dispersion_ceiling_millis: f64,
}

/// Strip and check the scheme of a protocol endpoint URL, returning the
/// host:port part.
pub fn endpoint(url: &str, scheme: &str) -> Result<String, MeasureError> {
    let prefix = format!("{}://", scheme);
    url.strip_prefix(&prefix)
        .map(str::to_string)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| {
            MeasureError::Config(format!("expected a {}://host:port URL, got {:?}", scheme, url))
        })
}
