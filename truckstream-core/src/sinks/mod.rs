//! Sinks receiving the batches produced by a [BatchForwarder](crate::forwarder::BatchForwarder)
mod gated;
mod log_sink;
mod vec_sink;

pub use gated::{BackpressureGate, GatedSink};
pub use log_sink::LogSink;
pub use vec_sink::VecSink;

/// Answer of a sink to a submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkResponse {
    /// The batch was taken, it can be cleared
    Accepted,
    /// The sink can not take data right now, the same batch must be retried later
    Backpressure,
    /// The sink refuses this batch for good, it will not be retried
    Rejected(String),
}

/// An external system accepting batches of records
pub trait BatchSink<R>: Send + 'static {
    /// Push a batch to the sink
    fn submit_batch(&mut self, batch: &[R]) -> SinkResponse;
}

impl<R, F> BatchSink<R> for F
where
    F: FnMut(&[R]) -> SinkResponse + Send + 'static,
{
    fn submit_batch(&mut self, batch: &[R]) -> SinkResponse {
        self(batch)
    }
}
