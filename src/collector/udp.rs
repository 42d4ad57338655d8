//! UDP receiver for NetFlow v9 / IPFIX export packets.

use crate::config::CollectorConfig;
use crate::orchestrator::EdgeOrchestrator;
use crate::uplink::Transport;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// Exporters are identified by sender address plus the observation domain or
/// source id in each packet header.
pub struct UdpCollector<T: Transport> {
    socket: UdpSocket,
    orchestrator: Arc<EdgeOrchestrator<T>>,
    recv_buffer_size: usize,
}

impl<T: Transport> UdpCollector<T> {
    pub async fn bind(config: &CollectorConfig, orchestrator: Arc<EdgeOrchestrator<T>>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(&config.bind_addr).await?;
        info!(addr = %config.bind_addr, "flow collector bound");
        Ok(Self {
            socket,
            orchestrator,
            recv_buffer_size: config.recv_buffer_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.recv_buffer_size];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.process_datagram(Bytes::copy_from_slice(&buf[..len]), addr),
                    Err(e) => error!(error = %e, "UDP recv error"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("flow collector stopped");
    }

    fn process_datagram(&self, packet: Bytes, addr: SocketAddr) {
        match self.orchestrator.ingest_packet(&packet, addr.ip()) {
            Ok(report) => trace!(
                exporter = %addr,
                records = report.records,
                issues = report.issues.len(),
                "packet decoded"
            ),
            Err(e) => debug!(exporter = %addr, error = %e, "packet rejected"),
        }
    }
}
