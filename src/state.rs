use std::sync::Arc;

use crate::service::GenerationService;

/// Shared context handed to every handler. Built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GenerationService>,
}

impl AppState {
    pub fn new(service: GenerationService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
