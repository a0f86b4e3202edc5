use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::Pipeline;

pub struct AppState<S> {
    pub pipeline: Arc<Pipeline<S>>,
    pub max_batch_bytes: u64,
    pub shutdown: CancellationToken,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            max_batch_bytes: self.max_batch_bytes,
            shutdown: self.shutdown.clone(),
        }
    }
}
