//! Prometheus collectors
//!
//! One collector set per manager, named after its media type. The scrape
//! endpoint itself is owned by the embedder; the core only populates a
//! caller-supplied registry.

use crate::types::MediaType;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

#[derive(Debug, Clone)]
pub struct SfuMetrics {
    /// Current number of sessions in the manager's table.
    pub sessions: IntGauge,
    /// Total inbound requests seen by the router.
    pub reqs_total: IntCounter,
    /// Total errors surfaced to clients, labelled by method and code.
    pub errors_total: IntCounterVec,
}

impl SfuMetrics {
    pub fn new(registry: &Registry, media_type: MediaType) -> prometheus::Result<Self> {
        let kind = media_type.as_str();

        let sessions = IntGauge::with_opts(Opts::new(
            format!("sfu_{}_sessions", kind),
            format!("Number of active {} sessions", kind),
        ))?;
        let reqs_total = IntCounter::with_opts(Opts::new(
            format!("sfu_{}_reqs_total", kind),
            format!("Total {} requests received", kind),
        ))?;
        let errors_total = IntCounterVec::new(
            Opts::new(
                format!("sfu_{}_errors_total", kind),
                format!("Total {} errors surfaced to clients", kind),
            ),
            &["method", "errorCode"],
        )?;

        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(reqs_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            sessions,
            reqs_total,
            errors_total,
        })
    }

    pub fn count_error(&self, method: &str, code: u32) {
        self.errors_total
            .with_label_values(&[method, &code.to_string()])
            .inc();
    }
}
