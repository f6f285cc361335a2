// Measurement orchestrator
//
// Drives one measurement through its state machine:
//
//   IDLE → ARMING → WAIT_PEER → SYNCING → SAMPLING → UPLOADING
//        → ANALYSING → DONE, with FAULT reachable from every state.
//
// The orchestrator owns handles to every service; services never hold
// references back. All protocol work happens in service tasks; the serial
// conversation runs on the blocking thread pool. Analysis works on
// immutable snapshots of the control-timestamp history and the dispersion
// log captured at ANALYSING entry.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{Correlation, TickRate, TimelineClock, TimestampedCt, WallClock};
use crate::config::{endpoint, CommonArgs, CsaTesterConfig, MeasuredChannel, TvTesterConfig};
use crate::correlate;
use crate::detect;
use crate::dispersion::DispersionRecorder;
use crate::error::MeasureError;
use crate::net::cii::{CiiClient, CiiServer};
use crate::net::messages::{CiiMsg, TimelineSetup};
use crate::net::timeline::{TimelineClient, TimelineServer};
use crate::net::wallclock::{WallClockClient, WallClockServer};
use crate::report;
use crate::sampler::link::blocks_for_channels;
use crate::sampler::{Capture, DeviceToWall, OffsetEstimate, SamplerLink, SerialSamplerPort};
use crate::translate::{TimeTranslator, TranslatedInstant};

/// Orchestrator states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    Idle,
    Arming,
    WaitPeer,
    Syncing,
    Sampling,
    Uploading,
    Analysing,
    Done,
    Fault,
}

/// Final result of a completed measurement.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// False when at least one pulse failed the tolerance test.
    pub passed: bool,
}

fn enter(state: MeasurementState) {
    info!("Measurement state: {:?}", state);
}

/// Run a state's work bounded by the per-transition timeout and the shared
/// cancellation token.
async fn bounded<T, F>(
    state: MeasurementState,
    timeout_secs: u64,
    cancel: &CancelToken,
    work: F,
) -> Result<T, MeasureError>
where
    F: Future<Output = Result<T, MeasureError>>,
{
    enter(state);
    let mut cancel = cancel.clone();
    tokio::select! {
        res = tokio::time::timeout(Duration::from_secs(timeout_secs), work) => match res {
            Ok(r) => r,
            Err(_) => Err(MeasureError::ProtocolFault(format!(
                "timed out in state {:?} after {} s",
                state, timeout_secs
            ))),
        },
        _ = cancel.cancelled() => Err(MeasureError::UserAbort),
    }
}

/// Print a prompt and wait for the operator to press return.
async fn operator_confirm(prompt: &str) -> Result<(), MeasureError> {
    println!();
    println!("{}", prompt);
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    stdin
        .read_line(&mut line)
        .await
        .map_err(|e| MeasureError::ProtocolFault(format!("operator input unavailable: {}", e)))?;
    Ok(())
}

/// A control-timestamp history entry for a correlation this host itself
/// authored (server role), effective from the correlation's own instant.
fn own_ct(content_id: &str, rate: TickRate, correlation: Correlation) -> TimestampedCt {
    TimestampedCt {
        received_wall_nanos: correlation.wall_nanos,
        ct: crate::clock::ControlTimestamp {
            content_id: content_id.to_string(),
            tick_rate: rate,
            correlation: Some(correlation),
        },
    }
}

// ---------------------------------------------------------------------------
// Sampler phases (blocking, run on the thread pool)

/// Everything the sampler produced, ready for analysis.
struct SampledData {
    capture: Capture,
    dev_to_wall: DeviceToWall,
}

type Link = SamplerLink<SerialSamplerPort>;

/// ARMING..SAMPLING on the link: enable the channels, take the pre
/// estimate, prepare, and run the blocking capture window.
fn sampler_capture_phase(
    mut link: Link,
    channels: Vec<usize>,
) -> Result<(Link, OffsetEstimate, i64, i64, usize, usize), MeasureError> {
    for &ch in &channels {
        link.enable_channel(ch)?;
    }
    let pre = OffsetEstimate::from_round_trip(&link.ping()?);
    let (n_active, n_blocks) = link.prepare()?;
    if n_active != channels.len() {
        return Err(MeasureError::LinkFault(format!(
            "device enabled {} channels, requested {}",
            n_active,
            channels.len()
        )));
    }
    if n_blocks != blocks_for_channels(n_active) {
        warn!(
            "device reports {} blocks for {} channels, expected {}",
            n_blocks,
            n_active,
            blocks_for_channels(n_active)
        );
    }
    let (start, end, sampled_blocks) = link.sample()?;
    Ok((link, pre, start, end, sampled_blocks.min(n_blocks), n_active))
}

/// SAMPLING → UPLOADING: post estimate, then the bulk transfer.
fn sampler_upload_phase(
    mut link: Link,
    pre: OffsetEstimate,
    start: i64,
    end: i64,
    n_blocks: usize,
    n_channels: usize,
) -> Result<SampledData, MeasureError> {
    let post = OffsetEstimate::from_round_trip(&link.ping()?);
    let data = link.bulk(n_blocks, n_channels)?;
    Ok(SampledData {
        capture: Capture {
            start_device_nanos: start,
            end_device_nanos: end,
            n_blocks,
            n_channels,
            data,
        },
        dev_to_wall: DeviceToWall::new(pre, post)?,
    })
}

async fn on_blocking<T, F>(cancel: &CancelToken, work: F) -> Result<T, MeasureError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MeasureError> + Send + 'static,
{
    let mut cancel = cancel.clone();
    let handle = tokio::task::spawn_blocking(work);
    tokio::select! {
        res = handle => res
            .map_err(|e| MeasureError::LinkFault(format!("sampler task failed: {}", e)))?,
        // dropping the handle abandons the blocking thread; its serial
        // port closes when the thread finishes unwinding
        _ = cancel.cancelled() => Err(MeasureError::UserAbort),
    }
}

// ---------------------------------------------------------------------------
// Analysis (ANALYSING state; pure computation over snapshots)

fn analyse(
    channels: &[MeasuredChannel],
    mut sampled: SampledData,
    ct_history: Vec<TimestampedCt>,
    dispersion: DispersionRecorder,
    common: &CommonArgs,
) -> Result<Outcome, MeasureError> {
    if let Some(secs) = common.measure_secs {
        sampled.capture.truncate_blocks((secs * 1000) as usize);
    }

    let rate = common.tick_rate();
    let translator =
        TimeTranslator::new(sampled.dev_to_wall, ct_history, dispersion, rate);

    let mut passed = true;
    for (position, channel) in channels.iter().enumerate() {
        let pulses = detect::detect_pulses(
            &sampled.capture,
            position,
            channel.channel,
            channel.kind,
            channel.metadata.approx_duration_secs(channel.kind),
        );
        info!("Channel {}: {} pulses detected", channel.name, pulses.len());

        let observed: Vec<TranslatedInstant> = pulses
            .iter()
            .map(|p| translator.to_timeline(p.mid_device_nanos))
            .collect::<Result<_, _>>()?;

        let expected = channel
            .metadata
            .expected_ticks(common.video_start_ticks, &rate);
        let alignment =
            correlate::align(&observed, &expected, channel.metadata.pattern_window_length)?;
        debug!(
            "Channel {}: matched at expected index {}, offset {:.1} ticks",
            channel.name, alignment.match_index, alignment.offset_ticks
        );

        let verdict = report::print_channel_report(
            channel.name,
            &alignment,
            common.video_start_ticks,
            &rate,
            common.tolerance_secs(),
        );
        passed &= verdict.passed;
    }
    Ok(Outcome { passed })
}

// ---------------------------------------------------------------------------
// CSA-measuring mode: this host is the TV device

/// Run one measurement of a companion-screen application. The host serves
/// all three protocols, the operator cues the start, and the timeline is
/// unpaused for the duration of the capture.
pub async fn run_csa_measurement(
    cfg: CsaTesterConfig,
    cancel: CancelToken,
) -> Result<Outcome, MeasureError> {
    let common = &cfg.common;
    let channels = common.measured_channels()?;
    let rate = common.tick_rate();
    let timeout = common.state_timeout_secs;

    enter(MeasurementState::Arming);
    let wall = Arc::new(WallClock::new());
    let precision_secs = wall.measure_precision();
    debug!("Wall clock precision measured as {:.1} ns", precision_secs * 1e9);

    let wc = WallClockServer::start(
        &format!("{}:{}", cfg.addr, cfg.wc_port),
        wall.clone(),
        precision_secs,
        common.max_freq_error_ppm,
    )
    .await
    .map_err(|e| MeasureError::ProtocolFault(format!("wall clock server failed: {}", e)))?;

    let timeline_clock = Arc::new(TimelineClock::new_paused(
        wall.clone(),
        rate,
        common.video_start_ticks,
    ));
    let ts = TimelineServer::start(
        &format!("{}:{}", cfg.addr, cfg.ts_port),
        common.content_id.clone(),
        common.timeline_selector.clone(),
        timeline_clock.clone(),
    )
    .await
    .map_err(|e| MeasureError::ProtocolFault(format!("timeline server failed: {}", e)))?;

    let wc_url = format!("udp://{}", wc.addr());
    let ts_url = format!("tcp://{}", ts.addr());
    let cii = CiiServer::start(
        &format!("{}:{}", cfg.addr, cfg.cii_port),
        CiiMsg::new(&common.content_id, &wc_url, &ts_url),
    )
    .await
    .map_err(|e| MeasureError::ProtocolFault(format!("content-id server failed: {}", e)))?;

    println!("Content id     : {}", common.content_id);
    println!("Wall clock at  : {}", wc_url);
    println!("Timeline at    : {}", ts_url);
    println!("Content id at  : tcp://{}", cii.addr());

    // CT history as seen from this side: we are the timeline authority, so
    // record our own correlation changes with their effective instants
    let mut ct_history: Vec<TimestampedCt> = Vec::new();
    ct_history.push(own_ct(&common.content_id, rate, timeline_clock.correlation()));

    let result = async {
        bounded(MeasurementState::WaitPeer, timeout, &cancel, async {
            operator_confirm(
                "Press RETURN once the device under test is connected and synchronising",
            )
            .await
        })
        .await?;

        bounded(MeasurementState::Syncing, timeout, &cancel, async {
            timeline_clock.unpause();
            ts.update_clients();
            info!("Timeline unpaused; waiting {:.1} s for playback to settle", cfg.wait_secs);
            tokio::time::sleep(Duration::from_secs_f64(cfg.wait_secs)).await;
            Ok(())
        })
        .await?;
        ct_history.push(own_ct(&common.content_id, rate, timeline_clock.correlation()));

        let link = Link::new(SerialSamplerPort::open(&common.serial)?, wall.clone());
        let indices: Vec<usize> = channels.iter().map(|c| c.channel).collect();
        let (link, pre, start, end, n_blocks, n_active) =
            bounded(MeasurementState::Sampling, timeout, &cancel, async {
                on_blocking(&cancel, move || sampler_capture_phase(link, indices)).await
            })
            .await?;

        let sampled = bounded(MeasurementState::Uploading, timeout, &cancel, async {
            on_blocking(&cancel, move || {
                sampler_upload_phase(link, pre, start, end, n_blocks, n_active)
            })
            .await
        })
        .await?;

        info!("Measurement complete; timeline paused again");
        timeline_clock.pause();
        ts.update_clients();
        ct_history.push(own_ct(&common.content_id, rate, timeline_clock.correlation()));

        enter(MeasurementState::Analysing);
        // the host clock is the wall-clock reference in this role, so
        // dispersion is zero across the whole window
        let dispersion = DispersionRecorder::zero(sampled.dev_to_wall.wall_at(start));
        let outcome = analyse(&channels, sampled, ct_history.clone(), dispersion, common)?;

        enter(MeasurementState::Done);
        Ok(outcome)
    }
    .await;

    if result.is_err() {
        enter(MeasurementState::Fault);
    }
    wc.shutdown().await;
    ts.shutdown().await;
    cii.shutdown().await;
    result
}

// ---------------------------------------------------------------------------
// TV-measuring mode: this host is the companion

/// Run one measurement of a TV device. The host connects to the TV's
/// protocol endpoints, synchronises its wall clock until dispersion falls
/// below the ceiling, and then captures.
pub async fn run_tv_measurement(
    cfg: TvTesterConfig,
    cancel: CancelToken,
) -> Result<Outcome, MeasureError> {
    let common = &cfg.common;
    let channels = common.measured_channels()?;
    let rate = common.tick_rate();
    let timeout = common.state_timeout_secs;
    let ceiling_secs = cfg.dispersion_ceiling_millis / 1000.0;

    enter(MeasurementState::Arming);
    let wall = Arc::new(WallClock::new());
    let precision_secs = wall.measure_precision();
    let recorder = Arc::new(Mutex::new(DispersionRecorder::new()));
    let (fault_tx, mut fault_rx) = mpsc::channel::<MeasureError>(8);

    let wc = WallClockClient::start(
        &cfg.wc_bind,
        &endpoint(&cfg.wc_url, "udp")?,
        wall.clone(),
        precision_secs,
        common.max_freq_error_ppm,
        recorder.clone(),
        cancel.clone(),
    )
    .await
    .map_err(|e| MeasureError::ProtocolFault(format!("wall clock client failed: {}", e)))?;

    let setup = TimelineSetup {
        content_id_stem: common.content_id.clone(),
        timeline_selector: common.timeline_selector.clone(),
        tick_rate: rate.into(),
    };
    let ts = TimelineClient::connect(
        &endpoint(&cfg.ts_url, "tcp")?,
        setup,
        wall.clone(),
        fault_tx.clone(),
        cancel.clone(),
    )
    .await
    .map_err(|e| MeasureError::ProtocolFault(format!("timeline connect failed: {}", e)))?;

    let cii = match &cfg.cii_url {
        Some(url) => Some(
            CiiClient::connect(
                &endpoint(url, "tcp")?,
                common.content_id.clone(),
                cancel.clone(),
            )
            .await
            .map_err(|e| MeasureError::ProtocolFault(format!("content-id connect failed: {}", e)))?,
        ),
        None => None,
    };

    let result = async {
        bounded(MeasurementState::WaitPeer, timeout, &cancel, async {
            let mut synced = wc.synced.clone();
            while !*synced.borrow() {
                synced.changed().await.map_err(|_| {
                    MeasureError::ProtocolFault("wall clock client stopped".into())
                })?;
            }
            info!("Wall clock synchronised to peer");
            if let Some(cii) = &cii {
                let mut record = cii.record.clone();
                while record.borrow().is_none() {
                    record.changed().await.map_err(|_| {
                        MeasureError::ProtocolFault("content-id client stopped".into())
                    })?;
                }
            }
            Ok(())
        })
        .await?;

        // SYNCING: a timeline must be available and dispersion must fall
        // below the ceiling; the state timeout bounds the retry interval
        enter(MeasurementState::Syncing);
        let syncing = async {
            let mut latest = ts.latest.clone();
            while latest.borrow().is_none() {
                latest.changed().await.map_err(|_| {
                    MeasureError::ProtocolFault("timeline stream stopped".into())
                })?;
            }
            loop {
                let current = recorder.lock().unwrap().latest();
                match current {
                    Some(r) if r.dispersion_secs <= ceiling_secs => {
                        info!(
                            "Dispersion {:.3} ms within ceiling {:.3} ms",
                            r.dispersion_secs * 1e3,
                            ceiling_secs * 1e3
                        );
                        return Ok(current);
                    }
                    _ => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            }
        };
        let mut cancel_wait = cancel.clone();
        let sync_result: Result<_, MeasureError> = tokio::select! {
            res = tokio::time::timeout(Duration::from_secs(timeout), syncing) => match res {
                Ok(r) => r,
                Err(_) => {
                    let got = recorder.lock().unwrap().latest();
                    Err(MeasureError::DispersionCeiling {
                        got_millis: got.map(|r| r.dispersion_secs * 1e3).unwrap_or(f64::INFINITY),
                        ceiling_millis: ceiling_secs * 1e3,
                    })
                }
            },
            _ = cancel_wait.cancelled() => Err(MeasureError::UserAbort),
        };
        sync_result?;

        let link = Link::new(SerialSamplerPort::open(&common.serial)?, wall.clone());
        let indices: Vec<usize> = channels.iter().map(|c| c.channel).collect();
        let (link, pre, start, end, n_blocks, n_active) =
            bounded(MeasurementState::Sampling, timeout, &cancel, async {
                on_blocking(&cancel, move || sampler_capture_phase(link, indices)).await
            })
            .await?;

        let sampled = bounded(MeasurementState::Uploading, timeout, &cancel, async {
            on_blocking(&cancel, move || {
                sampler_upload_phase(link, pre, start, end, n_blocks, n_active)
            })
            .await
        })
        .await?;

        // a protocol fault that arrived while we were sampling invalidates
        // the measurement
        if let Ok(fault) = fault_rx.try_recv() {
            return Err(fault);
        }

        enter(MeasurementState::Analysing);
        let ct_history = ts.history_snapshot().await;
        let dispersion = recorder.lock().unwrap().clone();
        let outcome = analyse(&channels, sampled, ct_history, dispersion, common)?;

        enter(MeasurementState::Done);
        Ok(outcome)
    }
    .await;

    if result.is_err() {
        enter(MeasurementState::Fault);
    }
    wc.shutdown().await;
    ts.shutdown().await;
    if let Some(cii) = &cii {
        cii.shutdown().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;

    #[tokio::test]
    async fn test_bounded_times_out_to_fault() {
        let (_source, token) = cancellation();
        let res: Result<(), _> = bounded(MeasurementState::Syncing, 0, &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(MeasureError::ProtocolFault(_))));
    }

    #[tokio::test]
    async fn test_bounded_cancel_is_user_abort() {
        let (source, token) = cancellation();
        source.cancel();
        let res: Result<(), _> = bounded(MeasurementState::WaitPeer, 60, &token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(MeasureError::UserAbort)));
    }

    #[tokio::test]
    async fn test_on_blocking_propagates_result() {
        let (_source, token) = cancellation();
        let ok = on_blocking(&token, || Ok(41 + 1)).await.unwrap();
        assert_eq!(ok, 42);
        let err: Result<(), _> =
            on_blocking(&token, || Err(MeasureError::LinkFault("x".into()))).await;
        assert!(matches!(err, Err(MeasureError::LinkFault(_))));
    }
}
