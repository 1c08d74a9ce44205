use std::sync::Arc;

use crate::services::{gateway::Gateway, queue::QueueClient, storage::ArtifactStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub queue: Arc<dyn QueueClient>,
    pub storage: Arc<dyn ArtifactStore>,
}

impl AppState {
    pub fn new(
        gateway: Arc<Gateway>,
        queue: Arc<dyn QueueClient>,
        storage: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            gateway,
            queue,
            storage,
        }
    }
}
