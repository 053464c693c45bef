use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{BatchSink, SinkResponse};

/// Shared backpressure signal of an external system.
/// Any number of [GatedSink]s may observe the same gate.
#[derive(Debug, Clone)]
pub struct BackpressureGate {
    open: Arc<AtomicBool>,
}

impl Default for BackpressureGate {
    fn default() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl BackpressureGate {
    /// Create a new gate, initially open
    pub fn new() -> Self {
        Self::default()
    }

    /// Let batches through again
    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Signal backpressure to every sink behind this gate
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// True if no backpressure is signaled
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Answers [SinkResponse::Backpressure] without touching the inner sink while its gate
/// is closed
#[derive(Debug, Clone)]
pub struct GatedSink<S> {
    gate: BackpressureGate,
    inner: S,
}

impl<S> GatedSink<S> {
    /// Put `inner` behind `gate`
    pub fn new(gate: BackpressureGate, inner: S) -> Self {
        Self { gate, inner }
    }
}

impl<R, S: BatchSink<R>> BatchSink<R> for GatedSink<S> {
    fn submit_batch(&mut self, batch: &[R]) -> SinkResponse {
        if self.gate.is_open() {
            self.inner.submit_batch(batch)
        } else {
            SinkResponse::Backpressure
        }
    }
}
