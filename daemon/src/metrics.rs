//! Prometheus metrics

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Counters for one multiplexer
pub struct Metrics {
    registry: Registry,

    // Counters
    pub connections_accepted: IntCounter,
    pub connections_closed: IntCounter,
    pub frames_received: IntCounter,
    pub frames_sent: IntCounter,
    pub protocol_errors: IntCounter,
    pub auth_successes: IntCounter,
    pub auth_failures: IntCounter,

    // Gauges
    pub active_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let connections_accepted = counter(
            "totpgate_connections_accepted_total",
            "Total number of accepted connections",
        )?;
        let connections_closed = counter(
            "totpgate_connections_closed_total",
            "Total number of closed connections",
        )?;
        let frames_received = counter(
            "totpgate_frames_received_total",
            "Total number of frames decoded",
        )?;
        let frames_sent = counter("totpgate_frames_sent_total", "Total number of frames queued")?;
        let protocol_errors = counter(
            "totpgate_protocol_errors_total",
            "Connections dropped for malformed frames",
        )?;
        let auth_successes = counter(
            "totpgate_auth_successes_total",
            "Total successful handshakes",
        )?;
        let auth_failures = counter("totpgate_auth_failures_total", "Total failed handshakes")?;

        let active_connections = IntGauge::with_opts(Opts::new(
            "totpgate_active_connections",
            "Number of open connections",
        ))?;
        registry.register(Box::new(active_connections.clone()))?;

        Ok(Self {
            registry,
            connections_accepted,
            connections_closed,
            frames_received,
            frames_sent,
            protocol_errors,
            auth_successes,
            auth_failures,
            active_connections,
        })
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
