use std::sync::{Arc, Mutex, MutexGuard};

use super::{BatchSink, SinkResponse};

/// Collects every batch into a shared vector and always accepts.
/// Clones share the same storage, so a clone can be kept to inspect
/// what was sunk.
#[derive(Debug)]
pub struct VecSink<R> {
    inner: Arc<Mutex<Vec<Vec<R>>>>,
}

impl<R> Clone for VecSink<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Default for VecSink<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> VecSink<R> {
    /// Create a new empty sink
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<R>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of batches received so far
    pub fn batch_count(&self) -> usize {
        self.lock().len()
    }
}

impl<R: Clone> VecSink<R> {
    /// All batches received so far
    pub fn batches(&self) -> Vec<Vec<R>> {
        self.lock().clone()
    }

    /// All records received so far, in order
    pub fn records(&self) -> Vec<R> {
        self.lock().iter().flatten().cloned().collect()
    }
}

impl<R: Clone + Send + 'static> BatchSink<R> for VecSink<R> {
    fn submit_batch(&mut self, batch: &[R]) -> SinkResponse {
        self.lock().push(batch.to_vec());
        SinkResponse::Accepted
    }
}
