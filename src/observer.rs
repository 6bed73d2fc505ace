//! Observation sink for request timings.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// How a query is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockLevel {
    None,
    Soft,
    Hard,
}

impl BlockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockLevel::None => "none",
            BlockLevel::Soft => "soft",
            BlockLevel::Hard => "hard",
        }
    }
}

impl fmt::Display for BlockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an inbound datagram got no reply and no further handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Malformed,
    Duplicate,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Duplicate => "duplicate",
        }
    }
}

/// Receives per-request timings.
pub trait Observer: Send + Sync {
    /// Time from receiving the datagram to finishing with it.
    fn request_latency(&self, level: BlockLevel, is_error: bool, latency: Duration);

    /// Time spent inside the serving strategy alone.
    fn overhead_latency(&self, level: BlockLevel, is_error: bool, latency: Duration);

    fn dropped(&self, _reason: DropReason) {}
}

/// Records into the global `metrics` recorder, whichever one is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl MetricsObserver {
    pub const REQUEST_LATENCY: &'static str = "slowdns_request_latency";
    pub const OVERHEAD_LATENCY: &'static str = "slowdns_request_overhead_latency";
    pub const DROPPED: &'static str = "slowdns_dropped_packets";
    pub const HEALTH_REQUESTS: &'static str = "slowdns_health_requests";

    /// Installs the process-wide Prometheus recorder and serves it over HTTP
    /// on `addr`. Only one recorder can exist per process.
    pub fn install(addr: SocketAddr) -> anyhow::Result<()> {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("no pude exponer métricas en {addr}"))?;
        Self::describe();
        Ok(())
    }

    /// Outcome of one health check.
    pub fn health_check(ok: bool) {
        metrics::counter!(Self::HEALTH_REQUESTS, "ok" => if ok { "true" } else { "false" })
            .increment(1);
    }

    pub fn describe() {
        metrics::describe_histogram!(
            Self::REQUEST_LATENCY,
            metrics::Unit::Seconds,
            "Latency of DNS requests in seconds"
        );
        metrics::describe_histogram!(
            Self::OVERHEAD_LATENCY,
            metrics::Unit::Seconds,
            "Latency spent in the serving strategy"
        );
        metrics::describe_counter!(
            Self::DROPPED,
            "Inbound datagrams dropped without a reply"
        );
        metrics::describe_counter!(Self::HEALTH_REQUESTS, "Results of health checks");
    }
}

impl Observer for MetricsObserver {
    fn request_latency(&self, level: BlockLevel, is_error: bool, latency: Duration) {
        metrics::histogram!(
            Self::REQUEST_LATENCY,
            "block_level" => level.as_str(),
            "is_error" => if is_error { "true" } else { "false" }
        )
        .record(latency.as_secs_f64());
    }

    fn overhead_latency(&self, level: BlockLevel, is_error: bool, latency: Duration) {
        metrics::histogram!(
            Self::OVERHEAD_LATENCY,
            "block_level" => level.as_str(),
            "is_error" => if is_error { "true" } else { "false" }
        )
        .record(latency.as_secs_f64());
    }

    fn dropped(&self, reason: DropReason) {
        metrics::counter!(Self::DROPPED, "reason" => reason.as_str()).increment(1);
    }
}
