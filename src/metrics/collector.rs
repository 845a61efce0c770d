//! Metrics Collector

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::{debug, error};

use crate::error::Direction;
use crate::relay::ConnectionStats;
use crate::Result;

/// Collects and exports relay metrics
pub struct Metrics {
    registry: Registry,
    sessions_started_total: IntCounter,
    session_start_failures_total: IntCounter,
    clients_accepted_total: IntCounter,
    active_relays: IntGauge,
    bytes_forwarded_total: IntCounterVec,
    relay_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sessions_started_total = IntCounter::new(
            "tcpbounce_sessions_started_total",
            "Total number of forwarding sessions started",
        )?;

        let session_start_failures_total = IntCounter::new(
            "tcpbounce_session_start_failures_total",
            "Total number of forwarding sessions that failed to start",
        )?;

        let clients_accepted_total = IntCounter::new(
            "tcpbounce_clients_accepted_total",
            "Total number of inbound clients paired with a target",
        )?;

        let active_relays = IntGauge::new(
            "tcpbounce_active_relays",
            "Number of sessions currently relaying",
        )?;

        let bytes_forwarded_total = IntCounterVec::new(
            Opts::new(
                "tcpbounce_bytes_forwarded_total",
                "Total bytes forwarded, by direction",
            ),
            &["direction"],
        )?;

        let relay_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tcpbounce_relay_duration_seconds",
                "Duration of relays in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 3600.0]),
        )?;

        registry.register(Box::new(sessions_started_total.clone()))?;
        registry.register(Box::new(session_start_failures_total.clone()))?;
        registry.register(Box::new(clients_accepted_total.clone()))?;
        registry.register(Box::new(active_relays.clone()))?;
        registry.register(Box::new(bytes_forwarded_total.clone()))?;
        registry.register(Box::new(relay_duration.clone()))?;

        Ok(Self {
            registry,
            sessions_started_total,
            session_start_failures_total,
            clients_accepted_total,
            active_relays,
            bytes_forwarded_total,
            relay_duration,
        })
    }

    pub fn record_session_started(&self) {
        self.sessions_started_total.inc();
    }

    pub fn record_start_failure(&self) {
        self.session_start_failures_total.inc();
    }

    /// A client was accepted and the relay is now active
    pub fn record_relay_started(&self) {
        self.clients_accepted_total.inc();
        self.active_relays.inc();
    }

    /// A relay ended; `stats` holds its final figures
    pub fn record_relay_finished(&self, stats: &ConnectionStats) {
        self.active_relays.dec();
        self.relay_duration.observe(stats.duration_ms as f64 / 1000.0);
        debug!(
            session_id = %stats.session_id,
            total_bytes = stats.total_bytes,
            "Recorded relay statistics"
        );
    }

    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        self.bytes_forwarded_total
            .with_label_values(&[direction.as_str()])
            .inc_by(bytes);
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started_total.get()
    }

    pub fn start_failures(&self) -> u64 {
        self.session_start_failures_total.get()
    }

    pub fn active_relays(&self) -> i64 {
        self.active_relays.get()
    }

    pub fn bytes_forwarded(&self, direction: Direction) -> u64 {
        self.bytes_forwarded_total
            .with_label_values(&[direction.as_str()])
            .get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode Prometheus metrics: {}", e);
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}
