//! Flow record sources: a UDP listener for real exporters and a synthetic feed.

mod feed;
mod udp;

pub use feed::SyntheticFeed;
pub use udp::UdpCollector;
