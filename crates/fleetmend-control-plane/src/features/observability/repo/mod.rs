use prometheus::{
    opts, Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder,
};

pub struct ObservabilityRepository {
    registry: Registry,
    api_request_total: CounterVec,
    api_request_latency_seconds: HistogramVec,
    relocation_total: CounterVec,
    dangling_rule_reference_total: Counter,
    partition_failure_total: CounterVec,
}

impl ObservabilityRepository {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();

        let api_request_total = CounterVec::new(
            opts!(
                "fleetmend_api_request_total",
                "Control plane API request total"
            ),
            &["endpoint", "status"],
        )
        .map_err(|e| e.to_string())?;
        let api_request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fleetmend_api_request_latency_seconds",
                "Control plane API request latency (seconds)",
            ),
            &["endpoint"],
        )
        .map_err(|e| e.to_string())?;
        let relocation_total = CounterVec::new(
            opts!(
                "fleetmend_relocation_total",
                "Relocation requests by outcome"
            ),
            &["outcome"],
        )
        .map_err(|e| e.to_string())?;
        let dangling_rule_reference_total = Counter::with_opts(opts!(
            "fleetmend_dangling_rule_reference_total",
            "Security group rules dropped because the referenced group is gone"
        ))
        .map_err(|e| e.to_string())?;
        let partition_failure_total = CounterVec::new(
            opts!(
                "fleetmend_partition_failure_total",
                "Cell queries that failed during a fleet-wide read"
            ),
            &["cell"],
        )
        .map_err(|e| e.to_string())?;

        registry
            .register(Box::new(api_request_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(api_request_latency_seconds.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(relocation_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(dangling_rule_reference_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(partition_failure_total.clone()))
            .map_err(|e| e.to_string())?;

        Ok(Self {
            registry,
            api_request_total,
            api_request_latency_seconds,
            relocation_total,
            dangling_rule_reference_total,
            partition_failure_total,
        })
    }

    pub fn observe_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.api_request_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.api_request_latency_seconds
            .with_label_values(&[endpoint])
            .observe(seconds);
    }

    pub fn inc_relocation_total(&self, outcome: &str) {
        self.relocation_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_dangling_rule_reference_total(&self) {
        self.dangling_rule_reference_total.inc();
    }

    pub fn inc_partition_failure_total(&self, cell: &str) {
        self.partition_failure_total
            .with_label_values(&[cell])
            .inc();
    }

    pub fn relocation_count(&self, outcome: &str) -> u64 {
        self.relocation_total.with_label_values(&[outcome]).get() as u64
    }

    pub fn dangling_rule_reference_count(&self) -> u64 {
        self.dangling_rule_reference_total.get() as u64
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}
