//! The worker loops of the individual pipeline stages
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    clock::{Clock, IntervalTrigger},
    codec::RecordDecoder,
    forwarder::{BatchForwarder, ForwarderError, ForwarderMetrics, ForwarderState},
    join::{JoinMetrics, TumblingJoinWindow},
    partitioners::rendezvous_select,
    sinks::BatchSink,
    stats::{SlidingStatsAggregator, StatsMetrics},
    types::{JoinedRecord, StatsRecord, TypedRecord},
};

use super::RawEvent;

/// upper bound for the pause between two retries of a suspended forwarder
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);
/// retries of a suspended forwarder during shutdown, before it gives up on its records
const SHUTDOWN_RETRIES: usize = 8;

/// Raised once when the pipeline starts shutting down
#[derive(Debug, Clone, Default)]
pub(super) struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub(super) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(super) fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a stage worker hands back when it finishes
#[derive(Debug)]
pub(super) enum StageReport {
    Decode { decoded: u64, failed: u64 },
    Join(JoinMetrics),
    Stats(StatsMetrics),
    JoinedForwarder(ForwarderMetrics),
    StatsForwarder(ForwarderMetrics),
}

/// Decode raw events and route them to the join partition owning their key
pub(super) fn decode(
    decoder: RecordDecoder,
    input: Receiver<RawEvent>,
    partitions: Vec<Sender<TypedRecord>>,
) -> StageReport {
    let mut decoded = 0;
    let mut failed = 0;
    for event in input.iter() {
        match decoder.decode(event.tag, &event.payload) {
            Ok(record) => {
                decoded += 1;
                let idx = rendezvous_select(record.correlation_key(), partitions.len());
                if partitions[idx].send(record).is_err() {
                    error!(partition = idx, "Join partition is gone, stopping decode");
                    break;
                }
            }
            Err(e) => {
                failed += 1;
                warn!(tag = %event.tag, arrival = event.arrival, error = %e, "Dropping undecodable payload");
            }
        }
    }
    debug!(decoded, failed, "Decode input closed");
    StageReport::Decode { decoded, failed }
}

/// Where joined records go
pub(super) struct JoinOutputs {
    pub(super) forward: Sender<JoinedRecord>,
    pub(super) stats: Vec<Sender<JoinedRecord>>,
}

impl JoinOutputs {
    fn emit(&self, records: &mut Vec<JoinedRecord>) {
        for record in records.drain(..) {
            // records without a truck side carry no driver and get no statistics
            if let Some(driver) = record.driver() {
                let idx = rendezvous_select(driver, self.stats.len());
                if self.stats[idx].send(record.clone()).is_err() {
                    error!(partition = idx, "Stats partition is gone");
                }
            }
            if self.forward.send(record).is_err() {
                error!("Joined record forwarder is gone");
            }
        }
    }
}

/// Buffer records into tumbling windows and close them as the clock advances
pub(super) fn join(
    mut window: TumblingJoinWindow,
    input: Receiver<TypedRecord>,
    outputs: JoinOutputs,
    clock: Arc<dyn Clock>,
    poll: Duration,
) -> StageReport {
    let mut joined = Vec::new();
    window.advance_to(clock.now(), &mut joined);
    outputs.emit(&mut joined);
    loop {
        match input.recv_timeout(poll) {
            Ok(record) => {
                if let Err(late) = window.ingest(record) {
                    debug!(error = %late, "Dropping late record");
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        window.advance_to(clock.now(), &mut joined);
        outputs.emit(&mut joined);
    }
    let closed = window.drain(clock.now(), &mut joined);
    outputs.emit(&mut joined);
    let metrics = window.metrics();
    info!(closed, joined = metrics.joined, late = metrics.late, "Join partition drained");
    StageReport::Join(metrics)
}

/// Feed joined records into the sliding aggregator and tick it every slide interval
pub(super) fn stats(
    mut aggregator: SlidingStatsAggregator,
    input: Receiver<JoinedRecord>,
    output: Sender<StatsRecord>,
    clock: Arc<dyn Clock>,
    poll: Duration,
) -> StageReport {
    let mut trigger = IntervalTrigger::new(aggregator.slide());
    trigger.poll(clock.now());
    let emit = |stats: Vec<StatsRecord>| {
        for s in stats {
            if output.send(s).is_err() {
                error!("Stats forwarder is gone");
            }
        }
    };
    loop {
        match input.recv_timeout(poll) {
            Ok(record) => aggregator.ingest(record, clock.now()),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // every partition ticks at the same slide boundary
        if let Some(at) = trigger.poll(clock.now()) {
            emit(aggregator.tick(at));
        }
    }
    emit(aggregator.tick(clock.now()));
    let metrics = aggregator.metrics();
    info!(ticks = metrics.ticks, emitted = metrics.emitted, "Stats partition finished");
    StageReport::Stats(metrics)
}

/// Paces retries of a suspended forwarder with an exponential backoff
struct RetryPacer {
    min_delay: Duration,
    backoff: Option<ExponentialBackoff>,
    due: Option<Instant>,
}

impl RetryPacer {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            backoff: None,
            due: None,
        }
    }

    /// Keep the schedule in line with the forwarder state
    fn track(&mut self, state: ForwarderState) {
        if state != ForwarderState::Suspended {
            self.backoff = None;
            self.due = None;
            return;
        }
        if self.due.map_or(true, |due| Instant::now() >= due) {
            let min_delay = self.min_delay;
            let delay = self
                .backoff
                .get_or_insert_with(|| {
                    ExponentialBuilder::default()
                        .with_min_delay(min_delay)
                        .with_max_delay(MAX_RETRY_DELAY)
                        .with_max_times(usize::MAX)
                        .build()
                })
                .next()
                .unwrap_or(MAX_RETRY_DELAY);
            self.due = Some(Instant::now() + delay);
        }
    }

    fn is_due(&self) -> bool {
        self.due.is_some_and(|due| Instant::now() >= due)
    }

    /// Block until the next retry is due
    fn wait(&self) {
        if let Some(due) = self.due {
            thread::sleep(due.saturating_duration_since(Instant::now()));
        }
    }
}

/// Run a forwarder until its input closes, then flush it.
///
/// While the sink applies backpressure the worker holds on to the record it could not
/// submit, which blocks the stages before it. Once shutdown is signalled or the input
/// is closed, a suspended forwarder gets [SHUTDOWN_RETRIES] more attempts. After that
/// it discards every record it still receives so the stages before it can drain.
pub(super) fn forward<R, S>(
    mut forwarder: BatchForwarder<R, S>,
    input: Receiver<R>,
    shutdown: ShutdownSignal,
    clock: Arc<dyn Clock>,
    tick: Duration,
    poll: Duration,
) -> ForwarderMetrics
where
    S: BatchSink<R>,
{
    let mut trigger = IntervalTrigger::new(tick);
    trigger.poll(clock.now());
    let mut pacer = RetryPacer::new(poll);
    let closing = |input: &Receiver<R>| shutdown.is_raised() || input.is_disconnected();
    let mut retries = 0;
    let mut gave_up = false;
    let mut dropped = 0;
    loop {
        match input.recv_timeout(poll) {
            Ok(_) if gave_up => dropped += 1,
            Ok(mut record) => {
                // hold the record, and with it the upstream, until the forwarder takes it
                while let Err(ForwarderError::Suspended(back)) = forwarder.submit(record) {
                    if closing(&input) {
                        if retries >= SHUTDOWN_RETRIES {
                            warn!(
                                forwarder = forwarder.name(),
                                retries, "Sink still applies backpressure, discarding input"
                            );
                            dropped += 1;
                            gave_up = true;
                            break;
                        }
                        retries += 1;
                    }
                    record = back;
                    pacer.track(forwarder.state());
                    pacer.wait();
                    forwarder.retry();
                    pacer.track(forwarder.state());
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if pacer.is_due() {
            forwarder.retry();
        }
        if trigger.poll(clock.now()).is_some() {
            forwarder.on_tick();
        }
        pacer.track(forwarder.state());
    }

    while forwarder.state() == ForwarderState::Suspended && retries < SHUTDOWN_RETRIES {
        pacer.track(forwarder.state());
        pacer.wait();
        forwarder.retry();
        retries += 1;
    }
    let name = forwarder.name().to_owned();
    let mut metrics = forwarder.shutdown();
    metrics.discarded += dropped;
    info!(
        forwarder = %name,
        accepted = metrics.records_accepted,
        rejected = metrics.records_rejected,
        discarded = metrics.discarded,
        "Forwarder shut down"
    );
    metrics
}
