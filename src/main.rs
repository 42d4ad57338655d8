//! flowprint-edge entrypoint: collect flows, fingerprint endpoints, stream sketches upstream.
//! Runs until Ctrl+C, then makes one final best-effort flush.

use flowprint_edge::{
    collector::{SyntheticFeed, UdpCollector},
    config::{EdgeConfig, SourceKind},
    logging::StructuredLogger,
    orchestrator::EdgeOrchestrator,
    uplink::Uplink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

async fn run(config: EdgeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let uplink = Uplink::from_config(&config.uplink);
    let orchestrator = Arc::new(EdgeOrchestrator::new(&config, uplink)?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let handler_tx = Arc::clone(&stop_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = handler_tx.send(true);
    }) {
        warn!(error = %e, "could not install Ctrl+C handler");
    }

    let source = match config.collector.source {
        SourceKind::Udp => {
            let collector = UdpCollector::bind(&config.collector, Arc::clone(&orchestrator)).await?;
            let rx = stop_rx.clone();
            tokio::spawn(async move { collector.run(rx).await })
        }
        SourceKind::Synthetic => {
            let feed = SyntheticFeed::new(config.collector.synthetic.clone(), Arc::clone(&orchestrator));
            let rx = stop_rx.clone();
            tokio::spawn(async move { feed.run(rx).await })
        }
    };

    info!(interval_secs = config.flush.interval_secs, "streaming (Ctrl+C to stop)");
    let report = Arc::clone(&orchestrator).run(stop_rx).await;
    if let Err(e) = source.await {
        warn!(error = %e, "collector task failed");
    }
    info!(
        delivered = report.delivered_batches,
        pending = report.pending_batches,
        "flowprint-edge stopped"
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::var("FLOWPRINT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = EdgeConfig::load(&config_path)?;

    StructuredLogger::init(&config.log);
    info!(
        device_id = %config.device_id,
        source = ?config.collector.source,
        sketch_bytes = config.sketch.memory_bytes(),
        "flowprint-edge starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}
