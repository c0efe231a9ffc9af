use crate::features::observability::repo::ObservabilityRepository;
use crate::features::observability::service::ObservabilityService;
use std::sync::Arc;

pub struct ObservabilityController {
    service: Arc<ObservabilityService>,
}

impl ObservabilityController {
    pub fn new(service: Arc<ObservabilityService>) -> Self {
        Self { service }
    }

    /// Controller over a fresh registry.
    pub fn with_new_registry() -> Result<Arc<Self>, String> {
        let repo = Arc::new(ObservabilityRepository::new()?);
        Ok(Arc::new(Self::new(Arc::new(ObservabilityService::new(
            repo,
        )))))
    }

    pub fn service(&self) -> Arc<ObservabilityService> {
        Arc::clone(&self.service)
    }

    pub fn record_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.service.record_api_request(endpoint, status, seconds);
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.service.render_metrics()
    }
}
