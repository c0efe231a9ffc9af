use crate::features::observability::repo::ObservabilityRepository;
use std::sync::Arc;

pub struct ObservabilityService {
    repo: Arc<ObservabilityRepository>,
}

impl ObservabilityService {
    pub fn new(repo: Arc<ObservabilityRepository>) -> Self {
        Self { repo }
    }

    pub fn with_new_registry() -> Result<Self, String> {
        Ok(Self::new(Arc::new(ObservabilityRepository::new()?)))
    }

    pub fn record_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.repo.observe_api_request(endpoint, status, seconds);
    }

    pub fn record_relocation(&self, outcome: &str) {
        self.repo.inc_relocation_total(outcome);
    }

    pub fn record_dangling_rule_reference(&self) {
        self.repo.inc_dangling_rule_reference_total();
    }

    pub fn record_partition_failure(&self, cell: &str) {
        self.repo.inc_partition_failure_total(cell);
    }

    pub fn relocation_count(&self, outcome: &str) -> u64 {
        self.repo.relocation_count(outcome)
    }

    pub fn dangling_rule_reference_count(&self) -> u64 {
        self.repo.dangling_rule_reference_count()
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.repo.render_metrics()
    }
}
