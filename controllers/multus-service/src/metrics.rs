//! Prometheus metrics for the controller.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Outcome label values for reconcile counters
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_RETRY: &str = "retry";
pub const OUTCOME_DROPPED: &str = "dropped";

/// Controller metrics, registered on a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    requeues: IntCounter,
    drops: IntCounter,
    queue_depth: IntGauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("requeues", &self.requeues.get())
            .field("drops", &self.drops.get())
            .field("queue_depth", &self.queue_depth.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            Opts::new("multus_service_reconcile_total", "Reconciliations by event type and outcome"),
            &["event", "outcome"],
        )?;
        let requeues = IntCounter::new(
            "multus_service_requeues_total",
            "Work items put back on the queue after a retryable failure",
        )?;
        let drops = IntCounter::new(
            "multus_service_dropped_total",
            "Work items dropped after a permanent failure or too many retries",
        )?;
        let queue_depth = IntGauge::new("multus_service_queue_depth", "Work items waiting in the queue")?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(requeues.clone()))?;
        registry.register(Box::new(drops.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            requeues,
            drops,
            queue_depth,
        })
    }

    pub fn record_reconcile(&self, event: &str, outcome: &str) {
        self.reconciles.with_label_values(&[event, outcome]).inc();
    }

    pub fn record_requeue(&self) {
        self.requeues.inc();
    }

    pub fn record_drop(&self) {
        self.drops.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub fn reconciles(&self, event: &str, outcome: &str) -> u64 {
        self.reconciles.with_label_values(&[event, outcome]).get()
    }

    pub fn requeues(&self) -> u64 {
        self.requeues.get()
    }

    pub fn drops(&self) -> u64 {
        self.drops.get()
    }

    /// Renders every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
