//! Synthetic flow feed for running without exporters.

use crate::config::SyntheticConfig;
use crate::flow::SyntheticSource;
use crate::orchestrator::EdgeOrchestrator;
use crate::uplink::Transport;
use chrono::Utc;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const SYNTHETIC_EXPORTER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// Keeps the IPFIX message length within 16 bits.
const MAX_RECORDS_PER_PACKET: usize = 1000;

pub struct SyntheticFeed<T: Transport> {
    config: SyntheticConfig,
    orchestrator: Arc<EdgeOrchestrator<T>>,
}

impl<T: Transport> SyntheticFeed<T> {
    pub fn new(config: SyntheticConfig, orchestrator: Arc<EdgeOrchestrator<T>>) -> Self {
        Self { config, orchestrator }
    }

    /// Generate one tick's records. Returns how many were applied.
    pub fn tick(&self, source: &mut SyntheticSource) -> usize {
        let n = self.config.records_per_tick;
        if self.config.encode_packets {
            let mut applied = 0;
            let mut remaining = n;
            while remaining > 0 {
                let chunk = remaining.min(MAX_RECORDS_PER_PACKET);
                remaining -= chunk;
                let packet = source.packet(chunk);
                match self.orchestrator.ingest_packet(&packet, SYNTHETIC_EXPORTER) {
                    Ok(report) => applied += report.records,
                    Err(e) => debug!(error = %e, "synthetic packet rejected"),
                }
            }
            applied
        } else {
            self.orchestrator.ingest_batch(&source.batch(n))
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut source = SyntheticSource::new(&self.config, Utc::now().timestamp_millis());
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            endpoints = self.config.endpoints,
            records_per_tick = self.config.records_per_tick,
            "synthetic feed started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&mut source);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("synthetic feed stopped");
    }
}
