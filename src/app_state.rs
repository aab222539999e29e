use std::sync::Arc;

use crate::services::{
    coordinator::SubmissionCoordinator,
    kv::KeyValueStore,
    storage::BlobStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SubmissionCoordinator>,
    pub kv: Arc<dyn KeyValueStore>,
    pub storage: Arc<dyn BlobStore>,
}

impl AppState {
    pub fn new(
        coordinator: SubmissionCoordinator,
        kv: Arc<dyn KeyValueStore>,
        storage: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            kv,
            storage,
        }
    }
}
