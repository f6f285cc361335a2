// Timeline synchronisation service
//
// Server role: publishes control timestamps derived from the orchestrator's
// timeline clock, to every connected client, on connect and whenever the
// authoritative correlation changes. Client role: one persistent
// connection; sends its selector once, then appends every received control
// timestamp to the shared history the translator later snapshots.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{TimelineClock, TimestampedCt, WallClock};
use crate::error::MeasureError;
use crate::net::connection::Connection;
use crate::net::messages::{stem_matches, ControlTimestampMsg, TimelineSetup};

/// Server role. Holds the timeline clock; `update_clients` pushes a fresh
/// control timestamp to every subscriber.
pub struct TimelineServer {
    addr: std::net::SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    update_tx: watch::Sender<u64>,
    clock: Arc<TimelineClock>,
}

impl TimelineServer {
    pub async fn start(
        bind: &str,
        content_id: String,
        timeline_selector: String,
        clock: Arc<TimelineClock>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        // the watch value is a generation counter; clients re-derive the CT
        // from the clock when it bumps
        let (update_tx, update_rx) = watch::channel(0u64);

        let accept_clock = clock.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                info!("Timeline client connected from {}", peer_addr);
                                let conn = Connection::new(stream, peer_addr);
                                let clock = accept_clock.clone();
                                let content_id = content_id.clone();
                                let selector = timeline_selector.clone();
                                let update_rx = update_rx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = serve_client(
                                        conn, clock, &content_id, &selector, update_rx,
                                    )
                                    .await
                                    {
                                        debug!("Timeline client {} closed: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => warn!("Timeline accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Timeline server shutting down");
                        break;
                    }
                }
            }
        });

        info!("Timeline server listening on {}", addr);
        Ok(TimelineServer { addr, shutdown_tx, update_tx, clock })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Push the current correlation to every connected client. Called by
    /// the orchestrator after pausing or unpausing the timeline.
    pub fn update_clients(&self) {
        self.update_tx.send_modify(|gen| *gen += 1);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    pub fn clock(&self) -> &Arc<TimelineClock> {
        &self.clock
    }
}

/// Per-connection server loop: validate the setup message, then send a CT
/// immediately and again on every correlation change.
async fn serve_client(
    mut conn: Connection,
    clock: Arc<TimelineClock>,
    content_id: &str,
    timeline_selector: &str,
    mut update_rx: watch::Receiver<u64>,
) -> io::Result<()> {
    let line = conn.read_line().await?;
    if line.is_empty() {
        return Ok(()); // EOF before setup
    }
    let setup: TimelineSetup = match serde_json::from_str(&line) {
        Ok(s) => s,
        Err(e) => {
            debug!("Bad timeline setup from {}: {}", conn.peer_addr(), e);
            return Ok(());
        }
    };

    let rate = clock.tick_rate();
    let available = stem_matches(&setup.content_id_stem, content_id)
        && setup.timeline_selector == timeline_selector;

    let current_ct = |available: bool| {
        if available {
            ControlTimestampMsg::from_correlation(
                content_id,
                timeline_selector,
                rate,
                clock.correlation(),
            )
        } else {
            ControlTimestampMsg::null(content_id, timeline_selector, rate)
        }
    };

    conn.write_json(&current_ct(available)).await?;

    loop {
        tokio::select! {
            changed = update_rx.changed() => {
                if changed.is_err() {
                    return Ok(()); // server dropped
                }
                conn.write_json(&current_ct(available)).await?;
            }
            line = conn.read_line() => {
                // clients do not speak after setup; EOF ends the session
                if line?.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}

/// Client role: receives the control-timestamp stream from the device
/// under test.
pub struct TimelineClient {
    shutdown_tx: mpsc::Sender<()>,
    /// Latest control timestamp (None until the first arrives).
    pub latest: watch::Receiver<Option<TimestampedCt>>,
    history: Arc<RwLock<Vec<TimestampedCt>>>,
}

impl TimelineClient {
    /// Connect, send the selector, and stream CTs into the shared history.
    /// A stream that ends while `cancel` has not fired reports a protocol
    /// fault through `fault_tx`.
    pub async fn connect(
        addr: &str,
        setup: TimelineSetup,
        wall: Arc<WallClock>,
        fault_tx: mpsc::Sender<MeasureError>,
        mut cancel: CancelToken,
    ) -> io::Result<Self> {
        let mut conn = Connection::connect(addr).await?;
        conn.write_json(&setup).await?;
        info!(
            "Timeline client connected to {}, requesting stem {:?} selector {:?}",
            addr, setup.content_id_stem, setup.timeline_selector
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let (latest_tx, latest_rx) = watch::channel(None);
        let history: Arc<RwLock<Vec<TimestampedCt>>> = Arc::new(RwLock::new(Vec::new()));
        let task_history = history.clone();

        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    line = conn.read_line() => line,
                    _ = cancel.cancelled() => break,
                    _ = shutdown_rx.recv() => break,
                };
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = fault_tx
                            .send(MeasureError::ProtocolFault(format!(
                                "timeline stream read failed: {}",
                                e
                            )))
                            .await;
                        break;
                    }
                };
                if line.is_empty() {
                    let _ = fault_tx
                        .send(MeasureError::ProtocolFault(
                            "timeline stream ended unexpectedly".into(),
                        ))
                        .await;
                    break;
                }
                let msg: ControlTimestampMsg = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = fault_tx
                            .send(MeasureError::ProtocolFault(format!(
                                "malformed control timestamp: {}",
                                e
                            )))
                            .await;
                        break;
                    }
                };
                let entry = TimestampedCt {
                    received_wall_nanos: wall.now_nanos(),
                    ct: msg.to_control_timestamp(),
                };
                debug!("Control timestamp received: {:?}", entry.ct.correlation);
                task_history.write().await.push(entry.clone());
                let _ = latest_tx.send(Some(entry));
            }
        });

        Ok(TimelineClient { shutdown_tx, latest: latest_rx, history })
    }

    /// Immutable copy of the CT history, taken at ANALYSING entry.
    pub async fn history_snapshot(&self) -> Vec<TimestampedCt> {
        self.history.read().await.clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}
