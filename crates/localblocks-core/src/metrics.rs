use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::Result;

pub const REASON_LIVE_TRACES_EXCEEDED: &str = "live_traces_exceeded";

/// Sink for the processor's tenant-labelled counters and gauges
pub trait ProcessorMetrics: Send + Sync {
    fn inc_total_traces(&self, tenant: &str, count: u64);
    fn inc_dropped_traces(&self, tenant: &str, reason: &str);
    fn set_live_traces(&self, tenant: &str, count: u64);
    fn set_block_bytes(&self, tenant: &str, bytes: u64);
}

pub struct PrometheusMetrics {
    total_traces: IntCounterVec,
    dropped_traces: IntCounterVec,
    live_traces: IntGaugeVec,
    block_bytes: IntGaugeVec,
}

impl PrometheusMetrics {
    /// Registers the collectors on `registry`. Fails if they are already
    /// registered there.
    pub fn new(registry: &Registry) -> Result<Self> {
        let total_traces = IntCounterVec::new(
            Opts::new("localblocks_traces_total", "Total number of traces created"),
            &["tenant"],
        )?;
        let dropped_traces = IntCounterVec::new(
            Opts::new("localblocks_dropped_traces_total", "Number of traces dropped"),
            &["tenant", "reason"],
        )?;
        let live_traces = IntGaugeVec::new(
            Opts::new("localblocks_live_traces", "Number of live traces"),
            &["tenant"],
        )?;
        let block_bytes = IntGaugeVec::new(
            Opts::new("localblocks_bytes", "Total size of head, write-ahead and complete blocks"),
            &["tenant"],
        )?;

        registry.register(Box::new(total_traces.clone()))?;
        registry.register(Box::new(dropped_traces.clone()))?;
        registry.register(Box::new(live_traces.clone()))?;
        registry.register(Box::new(block_bytes.clone()))?;

        Ok(Self {
            total_traces,
            dropped_traces,
            live_traces,
            block_bytes,
        })
    }

    pub fn total_traces(&self, tenant: &str) -> u64 {
        self.total_traces.with_label_values(&[tenant]).get()
    }

    pub fn dropped_traces(&self, tenant: &str, reason: &str) -> u64 {
        self.dropped_traces.with_label_values(&[tenant, reason]).get()
    }

    pub fn live_traces(&self, tenant: &str) -> i64 {
        self.live_traces.with_label_values(&[tenant]).get()
    }

    pub fn block_bytes(&self, tenant: &str) -> i64 {
        self.block_bytes.with_label_values(&[tenant]).get()
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl ProcessorMetrics for PrometheusMetrics {
    fn inc_total_traces(&self, tenant: &str, count: u64) {
        self.total_traces.with_label_values(&[tenant]).inc_by(count);
    }

    fn inc_dropped_traces(&self, tenant: &str, reason: &str) {
        self.dropped_traces.with_label_values(&[tenant, reason]).inc();
    }

    fn set_live_traces(&self, tenant: &str, count: u64) {
        self.live_traces.with_label_values(&[tenant]).set(gauge_value(count));
    }

    fn set_block_bytes(&self, tenant: &str, bytes: u64) {
        self.block_bytes.with_label_values(&[tenant]).set(gauge_value(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_tenant_scoped() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).unwrap();

        metrics.inc_total_traces("a", 3);
        metrics.inc_total_traces("a", 2);
        metrics.inc_total_traces("b", 1);
        metrics.inc_dropped_traces("a", REASON_LIVE_TRACES_EXCEEDED);

        assert_eq!(metrics.total_traces("a"), 5);
        assert_eq!(metrics.total_traces("b"), 1);
        assert_eq!(metrics.dropped_traces("a", REASON_LIVE_TRACES_EXCEEDED), 1);
        assert_eq!(metrics.dropped_traces("b", REASON_LIVE_TRACES_EXCEEDED), 0);
    }

    #[test]
    fn test_gauges_overwrite() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).unwrap();

        metrics.set_block_bytes("a", 100);
        metrics.set_block_bytes("a", 40);
        metrics.set_live_traces("a", 7);

        assert_eq!(metrics.block_bytes("a"), 40);
        assert_eq!(metrics.live_traces("a"), 7);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = PrometheusMetrics::new(&registry).unwrap();
        assert!(PrometheusMetrics::new(&registry).is_err());
    }
}
