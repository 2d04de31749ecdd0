use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Prometheus metrics recorded by the gate pipeline.
pub struct GateMetrics {
    pub registry: Registry,
    pub requests_total: IntCounter,
    pub rate_limited_total: IntCounter,
    pub commands_rejected_total: IntCounter,
    pub admitted_total: IntCounter,
    pub tasks_total: IntCounterVec,
    pub slot_wait: Histogram,
    pub task_duration: HistogramVec,
    pub active_slots: IntGauge,
}

impl GateMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(Opts::new(
            "turnstile_requests_total",
            "Total number of work requests received",
        ))
        .expect("failed to create requests_total counter");

        let rate_limited_total = IntCounter::with_opts(Opts::new(
            "turnstile_rate_limited_total",
            "Total number of requests rejected by the rate limiter",
        ))
        .expect("failed to create rate_limited_total counter");

        let commands_rejected_total = IntCounter::with_opts(Opts::new(
            "turnstile_commands_rejected_total",
            "Total number of commands rejected by the spam limiter",
        ))
        .expect("failed to create commands_rejected_total counter");

        let admitted_total = IntCounter::with_opts(Opts::new(
            "turnstile_admitted_total",
            "Total number of requests granted an execution slot",
        ))
        .expect("failed to create admitted_total counter");

        let tasks_total = IntCounterVec::new(
            Opts::new("turnstile_tasks_total", "Scheduled tasks by tier and outcome"),
            &["tier", "outcome"],
        )
        .expect("failed to create tasks_total counter");

        let slot_wait = Histogram::with_opts(
            HistogramOpts::new(
                "turnstile_slot_wait_seconds",
                "Time spent waiting for an execution slot",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .expect("failed to create slot_wait histogram");

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "turnstile_task_duration_seconds",
                "Task execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["tier"],
        )
        .expect("failed to create task_duration histogram");

        let active_slots = IntGauge::with_opts(Opts::new(
            "turnstile_active_slots",
            "Execution slots currently held",
        ))
        .expect("failed to create active_slots gauge");

        registry.register(Box::new(requests_total.clone())).expect("failed to register requests_total");
        registry.register(Box::new(rate_limited_total.clone())).expect("failed to register rate_limited_total");
        registry.register(Box::new(commands_rejected_total.clone())).expect("failed to register commands_rejected_total");
        registry.register(Box::new(admitted_total.clone())).expect("failed to register admitted_total");
        registry.register(Box::new(tasks_total.clone())).expect("failed to register tasks_total");
        registry.register(Box::new(slot_wait.clone())).expect("failed to register slot_wait");
        registry.register(Box::new(task_duration.clone())).expect("failed to register task_duration");
        registry.register(Box::new(active_slots.clone())).expect("failed to register active_slots");

        Self {
            registry,
            requests_total,
            rate_limited_total,
            commands_rejected_total,
            admitted_total,
            tasks_total,
            slot_wait,
            task_duration,
            active_slots,
        }
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}
