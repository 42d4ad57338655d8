//! Log output: JSON lines (one object per line) or human-readable text, both on stdout.

use crate::config::LogConfig;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber. `RUST_LOG` overrides the configured level.
    /// Returns false if a subscriber was already installed.
    pub fn init(config: &LogConfig) -> bool {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
        if config.json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry().with(filter).with(fmt).try_init().is_ok()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stdout))
                .try_init()
                .is_ok()
        }
    }
}
