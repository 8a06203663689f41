use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    // Task flow
    pub tasks_promoted: IntCounter,
    pub tasks_dispatched: IntCounter,

    // Failures by lock or operation
    pub lock_timeouts: IntCounterVec,
    pub errors: IntCounterVec,

    // Queue depth
    pub ready_depth: IntGauge,
    pub delayed_depth: IntGauge,
    pub log_length: IntGauge,
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_promoted = IntCounter::new(
            "tq_tasks_promoted_total",
            "Delayed tasks moved into the ready set",
        )?;
        registry.register(Box::new(tasks_promoted.clone()))?;

        let tasks_dispatched = IntCounter::new(
            "tq_tasks_dispatched_total",
            "Ready tasks appended to the distribution log",
        )?;
        registry.register(Box::new(tasks_dispatched.clone()))?;

        let lock_timeouts = IntCounterVec::new(
            Opts::new("tq_lock_timeouts_total", "Lock acquisitions that timed out"),
            &["set"],
        )?;
        registry.register(Box::new(lock_timeouts.clone()))?;

        let errors = IntCounterVec::new(
            Opts::new("tq_broker_errors_total", "Failed broker operations"),
            &["operation"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let ready_depth = IntGauge::new("tq_ready_depth", "Tasks waiting in the ready set")?;
        registry.register(Box::new(ready_depth.clone()))?;

        let delayed_depth = IntGauge::new("tq_delayed_depth", "Tasks waiting in the delayed set")?;
        registry.register(Box::new(delayed_depth.clone()))?;

        let log_length = IntGauge::new("tq_log_length", "Entries in the distribution log")?;
        registry.register(Box::new(log_length.clone()))?;

        Ok(BrokerMetrics {
            registry,
            tasks_promoted,
            tasks_dispatched,
            lock_timeouts,
            errors,
            ready_depth,
            delayed_depth,
            log_length,
        })
    }

    pub fn inc_lock_timeout(&self, set: &str) {
        self.lock_timeouts.with_label_values(&[set]).inc();
    }

    pub fn inc_error(&self, operation: &str) {
        self.errors.with_label_values(&[operation]).inc();
    }

    /// Update queue depth metrics
    pub fn update_depth(&self, ready: usize, delayed: usize, log: usize) {
        self.ready_depth.set(ready as i64);
        self.delayed_depth.set(delayed as i64);
        self.log_length.set(log as i64);
    }

    /// Renders every metric in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
