use std::sync::Arc;

use crate::services::{orchestrator::JobOrchestrator, queue::JobDispatcher};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<JobOrchestrator>,
    pub dispatcher: Arc<dyn JobDispatcher>,
}

impl AppState {
    pub fn new(orchestrator: JobOrchestrator, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            dispatcher,
        }
    }
}
