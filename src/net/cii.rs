// Content-identification service
//
// The smallest of the three protocols: a static record naming the content
// and the wall-clock/timeline endpoints. Server role pushes the record to
// every client on connect; client role waits for the first record whose
// content-id matches the configured stem.

use std::io;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::net::connection::Connection;
use crate::net::messages::{stem_matches, CiiMsg};

/// Server role: advertises a static content-id record.
pub struct CiiServer {
    addr: std::net::SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl CiiServer {
    pub async fn start(bind: &str, record: CiiMsg) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                info!("Content-id client connected from {}", peer_addr);
                                let record = record.clone();
                                tokio::spawn(async move {
                                    let mut conn = Connection::new(stream, peer_addr);
                                    if let Err(e) = conn.write_json(&record).await {
                                        debug!("Content-id push to {} failed: {}", peer_addr, e);
                                        return;
                                    }
                                    // the record is static for the run; hold the
                                    // connection open until the peer goes away
                                    while let Ok(line) = conn.read_line().await {
                                        if line.is_empty() {
                                            break;
                                        }
                                    }
                                });
                            }
                            Err(e) => warn!("Content-id accept error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Content-id server shutting down");
                        break;
                    }
                }
            }
        });

        info!("Content-id server listening on {}", addr);
        Ok(CiiServer { addr, shutdown_tx })
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Client role: discovers the peer's content-id record.
pub struct CiiClient {
    shutdown_tx: mpsc::Sender<()>,
    /// First record whose content-id matched the stem.
    pub record: watch::Receiver<Option<CiiMsg>>,
}

impl CiiClient {
    pub async fn connect(addr: &str, stem: String, mut cancel: CancelToken) -> io::Result<Self> {
        let mut conn = Connection::connect(addr).await?;
        info!("Content-id client connected to {}", addr);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let (record_tx, record_rx) = watch::channel(None);

        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    line = conn.read_line() => line,
                    _ = cancel.cancelled() => break,
                    _ = shutdown_rx.recv() => break,
                };
                let line = match line {
                    Ok(l) if !l.is_empty() => l,
                    _ => break, // EOF or read error; orchestrator times out if too early
                };
                match serde_json::from_str::<CiiMsg>(&line) {
                    Ok(msg) if stem_matches(&stem, &msg.content_id) => {
                        info!("Content-id record received: {}", msg.content_id);
                        let _ = record_tx.send(Some(msg));
                    }
                    Ok(msg) => {
                        debug!(
                            "Content-id {} does not match stem {:?}; ignoring",
                            msg.content_id, stem
                        );
                    }
                    Err(e) => {
                        debug!("Malformed content-id record: {}", e);
                    }
                }
            }
        });

        Ok(CiiClient { shutdown_tx, record: record_rx })
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use std::time::Duration;

    #[tokio::test]
    async fn test_record_pushed_and_matched() {
        let record = CiiMsg::new(
            "urn:test:content",
            "udp://127.0.0.1:6677",
            "tcp://127.0.0.1:7681",
        );
        let server = CiiServer::start("127.0.0.1:0", record).await.unwrap();

        let (_source, token) = cancellation();
        let client = CiiClient::connect(&server.addr().to_string(), "urn:test".into(), token)
            .await
            .unwrap();

        let mut rx = client.record.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while rx.borrow().is_none() {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let msg = rx.borrow().clone().unwrap();
        assert_eq!(msg.content_id, "urn:test:content");
        assert_eq!(msg.wc_url, "udp://127.0.0.1:6677");
        assert_eq!(msg.protocol_version, "1.1");

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_mismatched_stem_never_unblocks() {
        let record = CiiMsg::new("urn:test:content", "udp://x", "tcp://y");
        let server = CiiServer::start("127.0.0.1:0", record).await.unwrap();

        let (_source, token) = cancellation();
        let client = CiiClient::connect(&server.addr().to_string(), "urn:other".into(), token)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.record.borrow().is_none());

        client.shutdown().await;
        server.shutdown().await;
    }
}
