// Wall-clock synchronisation service
//
// Server role: the host's own clock is the reference; each request is
// answered with receive/transmit stamps and no dispersion is reported
// outward. Client role: periodic request/response exchanges maintain a
// lowest-dispersion offset candidate, slewing the local wall clock towards
// the peer's and emitting a dispersion event to the recorder every time a
// better candidate is adopted.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{WallClock, NANOS_PER_SEC};
use crate::dispersion::DispersionRecorder;
use crate::net::messages::{WcMsgType, WcPacket};

/// Interval between client requests.
const REQUEST_INTERVAL: Duration = Duration::from_millis(300);
/// How long the client waits for a response before writing the exchange off.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(300);

/// Server role: answers wall-clock requests with the host clock.
pub struct WallClockServer {
    addr: std::net::SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl WallClockServer {
    pub async fn start(
        bind: &str,
        wall: Arc<WallClock>,
        precision_secs: f64,
        max_freq_error_ppm: u32,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        let addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let precision_log2 = WcPacket::encode_precision(precision_secs);

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => {
                        let (size, peer) = match res {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("Wall clock recv error: {}", e);
                                continue;
                            }
                        };
                        let receive_nanos = wall.now_nanos();
                        let Some(request) = WcPacket::parse(&buf[..size]) else {
                            debug!("Malformed wall clock packet from {}", peer);
                            continue;
                        };
                        if request.msg_type != WcMsgType::Request {
                            continue;
                        }
                        let response = WcPacket {
                            msg_type: WcMsgType::Response,
                            precision_log2,
                            max_freq_error_ppm_256: max_freq_error_ppm * 256,
                            originate_nanos: request.originate_nanos,
                            receive_nanos,
                            transmit_nanos: wall.now_nanos(),
                        };
                        if let Err(e) = socket.send_to(&response.encode(), peer).await {
                            warn!("Wall clock send error to {}: {}", peer, e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Wall clock server shutting down");
                        break;
                    }
                }
            }
        });

        info!("Wall clock server listening on {}", addr);
        Ok(WallClockServer { addr, shutdown_tx })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// The offset candidate the client currently trusts.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dispersion_secs: f64,
}

/// Client role: keeps the shared wall clock slewed to the peer's.
pub struct WallClockClient {
    shutdown_tx: mpsc::Sender<()>,
    /// Becomes true once the first candidate has been adopted.
    pub synced: watch::Receiver<bool>,
}

impl WallClockClient {
    pub async fn start(
        bind: &str,
        server: &str,
        wall: Arc<WallClock>,
        local_precision_secs: f64,
        local_max_freq_error_ppm: u32,
        recorder: Arc<Mutex<DispersionRecorder>>,
        mut cancel: CancelToken,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let (synced_tx, synced_rx) = watch::channel(false);
        let server = server.to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REQUEST_INTERVAL);
            let mut best: Option<Candidate> = None;
            let mut buf = [0u8; 64];

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                    _ = cancel.cancelled() => break,
                }

                let t1 = wall.now_nanos();
                if let Err(e) = socket.send(&WcPacket::request(t1).encode()).await {
                    warn!("Wall clock request to {} failed: {}", server, e);
                    continue;
                }

                let response = tokio::select! {
                    res = tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf)) => res,
                    _ = cancel.cancelled() => break,
                };
                let t4 = wall.now_nanos();
                let size = match response {
                    Ok(Ok(size)) => size,
                    Ok(Err(e)) => {
                        warn!("Wall clock recv error: {}", e);
                        continue;
                    }
                    Err(_) => {
                        debug!("Wall clock response timed out");
                        continue;
                    }
                };

                let Some(pkt) = WcPacket::parse(&buf[..size]) else {
                    debug!("Malformed wall clock response");
                    continue;
                };
                // stale or reflected packet
                if pkt.msg_type != WcMsgType::Response || pkt.originate_nanos != t1 {
                    continue;
                }

                let (t2, t3) = (pkt.receive_nanos, pkt.transmit_nanos);
                let offset_nanos = ((t2 - t1) + (t3 - t4)) / 2;
                let rtt_secs = ((t4 - t1) - (t3 - t2)) as f64 / NANOS_PER_SEC;
                if rtt_secs < 0.0 {
                    continue;
                }
                let dispersion_secs =
                    pkt.precision_secs() + local_precision_secs + rtt_secs / 2.0;

                let adopt = match best {
                    None => true,
                    Some(b) => dispersion_secs < b.dispersion_secs,
                };
                if adopt {
                    wall.adjust(offset_nanos);
                    let now = wall.now_nanos();
                    recorder.lock().unwrap().record(now, dispersion_secs);
                    best = Some(Candidate { dispersion_secs });
                    let _ = synced_tx.send(true);
                    debug!(
                        "Wall clock adjusted by {:.3} ms, dispersion {:.3} ms",
                        offset_nanos as f64 / 1e6,
                        dispersion_secs * 1e3
                    );
                }
                // both clocks drift apart while we coast on the old
                // candidate; grow its dispersion so a fresh measurement can
                // eventually displace it
                if let Some(b) = &mut best {
                    let growth = (local_max_freq_error_ppm as f64 + pkt.max_freq_error_ppm())
                        * 1e-6
                        * REQUEST_INTERVAL.as_secs_f64();
                    b.dispersion_secs += growth;
                }
            }
            info!("Wall clock client stopped");
        });

        Ok(WallClockClient { shutdown_tx, synced: synced_rx })
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::net::messages::WC_PACKET_LEN;

    #[tokio::test]
    async fn test_server_answers_with_host_stamps() {
        let wall = Arc::new(WallClock::new());
        let server = WallClockServer::start("127.0.0.1:0", wall.clone(), 1e-6, 500)
            .await
            .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server.addr()).await.unwrap();
        let t1 = wall.now_nanos();
        socket.send(&WcPacket::request(t1).encode()).await.unwrap();

        let mut buf = [0u8; 64];
        let size = tokio::time::timeout(Duration::from_secs(1), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(size, WC_PACKET_LEN);
        let t4 = wall.now_nanos();
        let pkt = WcPacket::parse(&buf[..size]).unwrap();
        assert_eq!(pkt.msg_type, WcMsgType::Response);
        assert_eq!(pkt.originate_nanos, t1);
        assert!(pkt.receive_nanos >= t1 && pkt.transmit_nanos >= pkt.receive_nanos);
        assert!(pkt.transmit_nanos <= t4);
        assert_eq!(pkt.max_freq_error_ppm(), 500.0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_converges_and_records_dispersion() {
        // server's clock runs 2 s ahead of the client's
        let server_wall = Arc::new(WallClock::new());
        server_wall.adjust(2_000_000_000);
        let server = WallClockServer::start("127.0.0.1:0", server_wall.clone(), 1e-6, 500)
            .await
            .unwrap();

        let client_wall = Arc::new(WallClock::new());
        let recorder = Arc::new(Mutex::new(DispersionRecorder::new()));
        let (_source, token) = cancellation();
        let client = WallClockClient::start(
            "127.0.0.1:0",
            &server.addr().to_string(),
            client_wall.clone(),
            1e-6,
            500,
            recorder.clone(),
            token,
        )
        .await
        .unwrap();

        let mut synced = client.synced.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*synced.borrow() {
                synced.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // local loopback: the adopted offset puts the clocks within a few ms
        let skew = (client_wall.now_nanos() - server_wall.now_nanos()).abs();
        assert!(skew < 100_000_000, "skew still {} ns", skew);

        let rec = recorder.lock().unwrap();
        assert!(!rec.is_empty());
        assert!(rec.latest().unwrap().dispersion_secs >= 0.0);
        drop(rec);

        client.shutdown().await;
        server.shutdown().await;
    }
}
