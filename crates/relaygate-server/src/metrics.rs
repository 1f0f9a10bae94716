//! Prometheus metrics
//!
//! The registry is created by the caller and handed to the gateway, so tests
//! and embedders decide where metrics end up. Every family is exported under
//! the `relaygate_` prefix. A strict registry checks each gather for
//! families without the prefix, without help text, registered twice or with
//! duplicate samples, and fails instead of exporting them.

use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use relaygate_connection::BufferPool;
use relaygate_proto::RejectCode;
use std::collections::HashSet;
use thiserror::Error;

/// Prefix of every exported metric family
pub const METRICS_PREFIX: &str = "relaygate";

/// Metrics errors
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("invalid metric family {family:?}: {reason}")]
    Invalid { family: String, reason: String },

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Registry the gateway exports its metrics through
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    strict: bool,
}

impl MetricsRegistry {
    /// Registry with the fixed prefix
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self::from_registry(prefixed()?, false))
    }

    /// Registry with the fixed prefix that validates every gather
    pub fn strict() -> Result<Self, MetricsError> {
        Ok(Self::from_registry(prefixed()?, true))
    }

    /// Wrap an existing prometheus registry
    pub fn from_registry(registry: Registry, strict: bool) -> Self {
        Self { registry, strict }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn register<C>(&self, collector: &C) -> Result<(), MetricsError>
    where
        C: Collector + Clone + 'static,
    {
        self.registry.register(Box::new(collector.clone()))?;
        Ok(())
    }

    pub fn gather(&self) -> Result<Vec<MetricFamily>, MetricsError> {
        let families = self.registry.gather();
        if self.strict {
            validate(&families)?;
        }
        Ok(families)
    }

    /// Gather and render in the text exposition format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let families = self.gather()?;
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

fn prefixed() -> Result<Registry, MetricsError> {
    Ok(Registry::new_custom(Some(METRICS_PREFIX.to_string()), None)?)
}

fn validate(families: &[MetricFamily]) -> Result<(), MetricsError> {
    let prefix = format!("{}_", METRICS_PREFIX);
    let mut names = HashSet::new();

    for family in families {
        let name = family.get_name();
        let invalid = |reason: &str| MetricsError::Invalid {
            family: name.to_string(),
            reason: reason.to_string(),
        };

        if !name.starts_with(&prefix) {
            return Err(invalid("missing prefix"));
        }
        if family.get_help().trim().is_empty() {
            return Err(invalid("missing help text"));
        }
        if !names.insert(name) {
            return Err(invalid("registered more than once"));
        }

        let mut samples = HashSet::new();
        for metric in family.get_metric() {
            let labels: Vec<(&str, &str)> = metric
                .get_label()
                .iter()
                .map(|label| (label.get_name(), label.get_value()))
                .collect();
            if !samples.insert(labels) {
                return Err(invalid("duplicate sample"));
            }
        }
    }
    Ok(())
}

/// Direction of relayed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToBackend,
    ToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToBackend => "to_backend",
            Direction::ToClient => "to_client",
        }
    }
}

/// How the gateway answered an HTTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Proxied,
    Tunnel,
    NotFound,
    Unauthorized,
    BadGateway,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Proxied => "proxied",
            RequestOutcome::Tunnel => "tunnel",
            RequestOutcome::NotFound => "not_found",
            RequestOutcome::Unauthorized => "unauthorized",
            RequestOutcome::BadGateway => "bad_gateway",
        }
    }
}

const REJECT_CODES: [RejectCode; 6] = [
    RejectCode::BackendUnreachable,
    RejectCode::UnknownSession,
    RejectCode::Desync,
    RejectCode::Forbidden,
    RejectCode::Malformed,
    RejectCode::SessionClosed,
];

const DIRECTIONS: [Direction; 2] = [Direction::ToBackend, Direction::ToClient];

const OUTCOMES: [RequestOutcome; 5] = [
    RequestOutcome::Proxied,
    RequestOutcome::Tunnel,
    RequestOutcome::NotFound,
    RequestOutcome::Unauthorized,
    RequestOutcome::BadGateway,
];

/// Gateway metric families
#[derive(Clone)]
pub struct GatewayMetrics {
    sessions_active: IntGauge,
    sessions_created: IntCounter,
    sessions_closed: IntCounter,
    resumes: IntCounter,
    rejects: IntCounterVec,
    relayed_bytes: IntCounterVec,
    requests: IntCounterVec,
    pool_capacity: IntGauge,
    pool_outstanding: IntGauge,
}

impl GatewayMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self, MetricsError> {
        let metrics = Self {
            sessions_active: IntGauge::with_opts(Opts::new(
                "sessions_active",
                "Tunnel sessions currently alive",
            ))?,
            sessions_created: IntCounter::with_opts(Opts::new(
                "sessions_created_total",
                "Tunnel sessions created",
            ))?,
            sessions_closed: IntCounter::with_opts(Opts::new(
                "sessions_closed_total",
                "Tunnel sessions torn down",
            ))?,
            resumes: IntCounter::with_opts(Opts::new(
                "session_resumes_total",
                "Physical connections attached to an existing session",
            ))?,
            rejects: IntCounterVec::new(
                Opts::new("session_rejects_total", "Tunnel handshakes or sessions rejected"),
                &["code"],
            )?,
            relayed_bytes: IntCounterVec::new(
                Opts::new("relayed_bytes_total", "Bytes relayed through tunnels"),
                &["direction"],
            )?,
            requests: IntCounterVec::new(
                Opts::new("http_requests_total", "HTTP requests by outcome"),
                &["outcome"],
            )?,
            pool_capacity: IntGauge::with_opts(Opts::new(
                "pool_buffers_capacity",
                "Buffers the shared pool can hand out",
            ))?,
            pool_outstanding: IntGauge::with_opts(Opts::new(
                "pool_buffers_outstanding",
                "Buffers currently checked out of the shared pool",
            ))?,
        };

        // Labelled families only export children that exist.
        for code in REJECT_CODES {
            metrics.rejects.with_label_values(&[code.as_str()]);
        }
        for direction in DIRECTIONS {
            metrics.relayed_bytes.with_label_values(&[direction.as_str()]);
        }
        for outcome in OUTCOMES {
            metrics.requests.with_label_values(&[outcome.as_str()]);
        }

        registry.register(&metrics.sessions_active)?;
        registry.register(&metrics.sessions_created)?;
        registry.register(&metrics.sessions_closed)?;
        registry.register(&metrics.resumes)?;
        registry.register(&metrics.rejects)?;
        registry.register(&metrics.relayed_bytes)?;
        registry.register(&metrics.requests)?;
        registry.register(&metrics.pool_capacity)?;
        registry.register(&metrics.pool_outstanding)?;

        Ok(metrics)
    }

    pub fn session_created(&self) {
        self.sessions_created.inc();
        self.sessions_active.inc();
    }

    pub fn session_closed(&self) {
        self.sessions_closed.inc();
        self.sessions_active.dec();
    }

    pub fn resumed(&self) {
        self.resumes.inc();
    }

    pub fn rejected(&self, code: RejectCode) {
        self.rejects.with_label_values(&[code.as_str()]).inc();
    }

    pub fn relayed(&self, direction: Direction, bytes: usize) {
        self.relayed_bytes
            .with_label_values(&[direction.as_str()])
            .inc_by(bytes as u64);
    }

    pub fn request(&self, outcome: RequestOutcome) {
        self.requests.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn observe_pool(&self, pool: &BufferPool) {
        let stats = pool.stats();
        self.pool_capacity.set(stats.capacity as i64);
        self.pool_outstanding.set(stats.outstanding as i64);
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.get()
    }

    pub fn rejects(&self, code: RejectCode) -> u64 {
        self.rejects.with_label_values(&[code.as_str()]).get()
    }

    pub fn requests(&self, outcome: RequestOutcome) -> u64 {
        self.requests.with_label_values(&[outcome.as_str()]).get()
    }
}
