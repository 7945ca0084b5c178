// Metric constructors only fail on malformed names or label sets, which are static here.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Negotiation Metrics ====
    pub static ref NEGOTIATIONS_TOTAL: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "camera_negotiations_total",
                "Total number of ONVIF negotiation attempts",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref NEGOTIATION_PORT_PROBES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "camera_negotiation_port_probes_total",
                "Handshake attempts per candidate port",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Stream Engine Metrics ====
    pub static ref STREAMS_ACTIVE: IntGauge = {
        let metric = IntGauge::new("camera_streams_active", "Number of streaming engines")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAM_FRAMES_TOTAL: IntCounter = {
        let metric = IntCounter::new(
            "camera_stream_frames_total",
            "Total number of decoded frames published",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAM_RECONNECTS_TOTAL: IntCounter = {
        let metric = IntCounter::new(
            "camera_stream_reconnects_total",
            "Total number of decoder reopen attempts",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref STREAM_GIVE_UPS_TOTAL: IntCounter = {
        let metric = IntCounter::new(
            "camera_stream_give_ups_total",
            "Streams that exhausted their reconnect budget",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== PTZ Metrics ====
    pub static ref PTZ_COMMANDS_TOTAL: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("camera_ptz_commands_total", "Total number of PTZ commands"),
            &["method", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Snapshot Metrics ====
    pub static ref SNAPSHOTS_TOTAL: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("camera_snapshots_total", "Total number of snapshot captures"),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e))
    })
}
