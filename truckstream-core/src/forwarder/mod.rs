//! Batching of records towards a [BatchSink] with respect for its backpressure signal.
//!
//! ```text
//! Idle --submit--> Accumulating --size or tick--> Flushing --Accepted--> Idle
//!                                                   |    ^
//!                                       Backpressure|    |retry
//!                                                   v    |
//!                                                 Suspended
//! ```
//!
//! A batch which got backpressure is retried unmodified. While suspended, newly
//! submitted records wait in a bounded pending buffer; once that is full the record is
//! handed back to the caller.
use std::collections::VecDeque;

use bon::bon;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::sinks::{BatchSink, SinkResponse};

/// Lifecycle state of a [BatchForwarder]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    /// Nothing buffered
    Idle,
    /// Collecting records into the batch
    Accumulating,
    /// A batch is being handed to the sink
    Flushing,
    /// The sink signaled backpressure, the batch is held for retry
    Suspended,
}

/// Summary of one flush attempt
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flushed {
    /// Records the sink accepted
    pub accepted: usize,
    /// Records the sink rejected, these are gone
    pub rejected: usize,
    /// True if the flush ended in backpressure
    pub backpressure: bool,
}

impl Flushed {
    fn add(&mut self, other: Flushed) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.backpressure |= other.backpressure;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwarderError<R> {
    /// The record could not be taken and is returned to the caller
    #[error("Forwarder is suspended and its pending buffer is full")]
    Suspended(R),
}

/// Counters kept by a [BatchForwarder]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderMetrics {
    /// Records taken into the batch or the pending buffer
    pub submitted: u64,
    pub batches_accepted: u64,
    pub records_accepted: u64,
    /// Batches the sink refused for good, their records are not retried
    pub batches_rejected: u64,
    pub records_rejected: u64,
    /// How often the sink answered with backpressure
    pub backpressure_signals: u64,
    /// Records given up on during shutdown while the sink kept applying backpressure
    pub discarded: u64,
}

/// Accumulates records into batches of up to `batch_size` and submits them to a sink.
pub struct BatchForwarder<R, S> {
    name: String,
    sink: S,
    batch_size: usize,
    max_pending: usize,
    batch: Vec<R>,
    pending: VecDeque<R>,
    state: ForwarderState,
    metrics: ForwarderMetrics,
}

#[bon]
impl<R, S> BatchForwarder<R, S>
where
    S: BatchSink<R>,
{
    /// Create a new forwarder. A `batch_size` of zero is treated as one.
    #[builder(on(String, into))]
    pub fn new(
        name: String,
        sink: S,
        batch_size: usize,
        /// Records buffered while suspended before submit hands them back
        #[builder(default = 1024)]
        max_pending: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            name,
            sink,
            batch_size,
            max_pending,
            batch: Vec::with_capacity(batch_size),
            pending: VecDeque::new(),
            state: ForwarderState::Idle,
            metrics: ForwarderMetrics::default(),
        }
    }
}

impl<R, S> BatchForwarder<R, S>
where
    S: BatchSink<R>,
{
    /// Add a record to the batch, flushing immediately once the batch is full.
    pub fn submit(&mut self, record: R) -> Result<Flushed, ForwarderError<R>> {
        if self.state == ForwarderState::Suspended {
            if self.pending.len() >= self.max_pending {
                return Err(ForwarderError::Suspended(record));
            }
            self.pending.push_back(record);
            self.metrics.submitted += 1;
            return Ok(Flushed::default());
        }
        self.batch.push(record);
        self.metrics.submitted += 1;
        self.state = ForwarderState::Accumulating;
        if self.batch.len() >= self.batch_size {
            Ok(self.flush(false))
        } else {
            Ok(Flushed::default())
        }
    }

    /// Periodic flush. Submits whatever is buffered regardless of batch size,
    /// or retries the held batch when suspended.
    pub fn on_tick(&mut self) -> Flushed {
        if self.batch.is_empty() && self.pending.is_empty() {
            return Flushed::default();
        }
        self.flush(true)
    }

    /// Retry the held batch. Does nothing unless suspended.
    pub fn retry(&mut self) -> Flushed {
        if self.state != ForwarderState::Suspended {
            return Flushed::default();
        }
        self.flush(false)
    }

    /// Submit batches until only a partial batch is left, or until nothing is left if
    /// `until_empty` is set. Stops at the first backpressure signal.
    fn flush(&mut self, until_empty: bool) -> Flushed {
        let mut flushed = Flushed::default();
        loop {
            // a held batch is retried exactly as it was
            if self.state != ForwarderState::Suspended {
                self.refill();
            }
            let done = if until_empty {
                self.batch.is_empty()
            } else {
                self.batch.len() < self.batch_size && self.state != ForwarderState::Suspended
            };
            if done {
                break;
            }
            let attempt = self.flush_once();
            flushed.add(attempt);
            if attempt.backpressure {
                return flushed;
            }
            if !until_empty && self.batch.len() < self.batch_size {
                break;
            }
        }
        self.state = if self.batch.is_empty() {
            ForwarderState::Idle
        } else {
            ForwarderState::Accumulating
        };
        flushed
    }

    fn flush_once(&mut self) -> Flushed {
        let was_suspended = self.state == ForwarderState::Suspended;
        self.state = ForwarderState::Flushing;
        let len = self.batch.len();
        match self.sink.submit_batch(&self.batch) {
            SinkResponse::Accepted => {
                self.batch.clear();
                self.metrics.batches_accepted += 1;
                self.metrics.records_accepted += len as u64;
                self.refill();
                Flushed {
                    accepted: len,
                    ..Default::default()
                }
            }
            SinkResponse::Backpressure => {
                if !was_suspended {
                    debug!(forwarder = %self.name, records = len, "Sink signaled backpressure, suspending");
                }
                self.state = ForwarderState::Suspended;
                self.metrics.backpressure_signals += 1;
                Flushed {
                    backpressure: true,
                    ..Default::default()
                }
            }
            SinkResponse::Rejected(reason) => {
                error!(forwarder = %self.name, records = len, %reason, "Sink rejected batch, dropping it");
                self.batch.clear();
                self.metrics.batches_rejected += 1;
                self.metrics.records_rejected += len as u64;
                self.refill();
                Flushed {
                    rejected: len,
                    ..Default::default()
                }
            }
        }
    }

    /// move pending records into the batch, up to the batch size
    fn refill(&mut self) {
        let room = self.batch_size.saturating_sub(self.batch.len());
        let take = room.min(self.pending.len());
        self.batch.extend(self.pending.drain(..take));
    }

    /// Flush everything once more and give up on what the sink does not take.
    pub fn shutdown(mut self) -> ForwarderMetrics {
        let flushed = self.flush(true);
        if flushed.backpressure {
            let discarded = self.batch.len() + self.pending.len();
            warn!(forwarder = %self.name, discarded, "Sink still under backpressure on shutdown, discarding records");
            self.metrics.discarded += discarded as u64;
        }
        self.metrics
    }

    /// Current lifecycle state
    pub fn state(&self) -> ForwarderState {
        self.state
    }

    /// Records in the current batch
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Records waiting behind a suspended batch
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Counters accumulated so far
    pub fn metrics(&self) -> ForwarderMetrics {
        self.metrics
    }

    /// Name given to this forwarder
    pub fn name(&self) -> &str {
        &self.name
    }
}
