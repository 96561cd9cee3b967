//! Shared application state

use crate::cors::OriginPolicy;
use pairgate_core::Config;
use pairgate_session::LifecycleController;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Session lifecycle controller
    pub controller: LifecycleController,
    /// Origins allowed by the CORS layer
    pub origins: OriginPolicy,
    /// Service name reported by the status endpoint
    pub service: String,
}

impl AppState {
    /// Create a new application state
    pub fn new(controller: LifecycleController) -> Self {
        let config = controller.config().clone();
        let origins = OriginPolicy::new(&config.allowed_origins);
        Self {
            config,
            controller,
            origins,
            service: "pairgate".to_string(),
        }
    }

    /// Builder pattern: set the service name
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }
}
