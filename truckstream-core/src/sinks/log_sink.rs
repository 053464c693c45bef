use std::fmt::Debug;

use tracing::{debug, info};

use super::{BatchSink, SinkResponse};

/// Writes batches to the log and accepts them
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    /// Create a sink logging under the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl<R: Debug> BatchSink<R> for LogSink {
    fn submit_batch(&mut self, batch: &[R]) -> SinkResponse {
        info!(sink = %self.name, records = batch.len(), "Received batch");
        for record in batch {
            debug!(sink = %self.name, "{record:?}");
        }
        SinkResponse::Accepted
    }
}
