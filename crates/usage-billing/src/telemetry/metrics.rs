use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus counters for the engine, kept on a private registry so several
/// engines can coexist in one process (tests, replay tooling).
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    events_ingested: IntCounterVec,
    events_excluded: IntCounterVec,
    aggregation_recomputes: IntCounterVec,
    invoices_generated: IntCounterVec,
    invoice_failures: IntCounter,
    wallet_conflicts: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_ingested = IntCounterVec::new(
            Opts::new(
                "usage_billing_events_ingested_total",
                "Usage events submitted for ingestion by outcome",
            ),
            &["outcome"],
        )?;
        let events_excluded = IntCounterVec::new(
            Opts::new(
                "usage_billing_events_excluded_total",
                "Accepted events excluded from an aggregation by reason",
            ),
            &["reason"],
        )?;
        let aggregation_recomputes = IntCounterVec::new(
            Opts::new(
                "usage_billing_aggregation_runs_total",
                "Aggregation runs by mode (incremental or full recompute)",
            ),
            &["mode"],
        )?;
        let invoices_generated = IntCounterVec::new(
            Opts::new(
                "usage_billing_invoices_generated_total",
                "Invoices generated by invoicing reason",
            ),
            &["reason"],
        )?;
        let invoice_failures = IntCounter::new(
            "usage_billing_invoice_failures_total",
            "Invoice generations that failed and were captured for replay",
        )?;
        let wallet_conflicts = IntCounter::new(
            "usage_billing_wallet_version_conflicts_total",
            "Optimistic concurrency conflicts on wallet balance updates",
        )?;

        registry.register(Box::new(events_ingested.clone()))?;
        registry.register(Box::new(events_excluded.clone()))?;
        registry.register(Box::new(aggregation_recomputes.clone()))?;
        registry.register(Box::new(invoices_generated.clone()))?;
        registry.register(Box::new(invoice_failures.clone()))?;
        registry.register(Box::new(wallet_conflicts.clone()))?;

        Ok(Self {
            registry,
            events_ingested,
            events_excluded,
            aggregation_recomputes,
            invoices_generated,
            invoice_failures,
            wallet_conflicts,
        })
    }

    pub fn record_ingestion(&self, outcome: &str) {
        self.events_ingested.with_label_values(&[outcome]).inc();
    }

    pub fn record_excluded_event(&self, reason: &str) {
        self.events_excluded.with_label_values(&[reason]).inc();
    }

    pub fn record_aggregation_run(&self, full_recompute: bool) {
        let mode = if full_recompute { "recompute" } else { "incremental" };
        self.aggregation_recomputes.with_label_values(&[mode]).inc();
    }

    pub fn record_invoice(&self, reason: &str) {
        self.invoices_generated.with_label_values(&[reason]).inc();
    }

    pub fn record_invoice_failure(&self) {
        self.invoice_failures.inc();
    }

    pub fn record_wallet_conflict(&self) {
        self.wallet_conflicts.inc();
    }

    pub fn ingested_count(&self, outcome: &str) -> u64 {
        self.events_ingested.with_label_values(&[outcome]).get()
    }

    pub fn excluded_count(&self, reason: &str) -> u64 {
        self.events_excluded.with_label_values(&[reason]).get()
    }

    pub fn wallet_conflict_count(&self) -> u64 {
        self.wallet_conflicts.get()
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.record_ingestion("accepted");
        metrics.record_ingestion("accepted");
        metrics.record_ingestion("duplicate");
        metrics.record_excluded_event("missing_field");

        assert_eq!(metrics.ingested_count("accepted"), 2);
        assert_eq!(metrics.excluded_count("missing_field"), 1);

        let rendered = metrics.render();
        assert!(rendered.contains("usage_billing_events_ingested_total"));
        assert!(rendered.contains("outcome=\"duplicate\""));
    }
}
