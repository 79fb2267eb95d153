use lazy_static::lazy_static;
use prometheus::{register_gauge_vec, Encoder, GaugeVec, TextEncoder};
use serde::Deserialize;

lazy_static! {
    /// Per-(channel, quality) connected client count, the cheapest possible
    /// stand-in for `get_viewer_count` exposed for scraping.
    pub static ref CLIENT_COUNT: GaugeVec = register_gauge_vec!(
        "livetv_client_count",
        "Number of connected clients per live stream",
        &["live_stream_id"]
    )
    .unwrap();
    /// Bytes/sec delivered by Fan-out, updated by the Encoder Supervisor's
    /// Egress loop.
    pub static ref CLIENT_BANDWIDTH: GaugeVec = register_gauge_vec!(
        "livetv_client_bandwidth_bytes",
        "Current outbound bandwidth per live stream in bytes/sec",
        &["live_stream_id"]
    )
    .unwrap();
    /// 1.0 while ONAir, 0.0 otherwise; cheap external liveness probe.
    pub static ref STREAM_ONAIR: GaugeVec = register_gauge_vec!(
        "livetv_stream_onair",
        "1 if the live stream is ONAir, 0 otherwise",
        &["live_stream_id"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
        }
    }
}

fn default_monitoring_enabled() -> bool {
    true
}
