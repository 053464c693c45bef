//! Static wiring of the pipeline stages onto worker threads.
//!
//! ```text
//!                      +--> join 0 --+--> joined forwarder --> joined sink
//! raw --> decode(N) ---+             |
//!                      +--> join N --+--> stats 0..N --> stats forwarder --> stats sink
//! ```
//!
//! Stages are connected by bounded channels, a slow stage therefore blocks the stages
//! before it. Join partitions own a subset of correlation keys, stats partitions a
//! subset of drivers. Dropping the input drains the pipeline stage by stage.
mod stages;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use bon::Builder;
use flume::Sender;
use thiserror::Error;
use tracing::{info, info_span};

use crate::{
    clock::Clock,
    codec::{RecordDecoder, SchemaRegistry},
    config::{ConfigError, PipelineConfig},
    forwarder::{BatchForwarder, ForwarderMetrics},
    join::{JoinConfigError, JoinMetrics, TumblingJoinWindow},
    sinks::BatchSink,
    stats::{SlidingStatsAggregator, StatsConfigError, StatsMetrics},
    types::{EventTime, JoinedRecord, StatsRecord, StreamTag},
};
use stages::{JoinOutputs, ShutdownSignal, StageReport};

/// An encoded payload as received from one of the upstream streams
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Stream the payload was received on
    pub tag: StreamTag,
    /// Wire format bytes: magic byte, schema id and record body
    pub payload: Vec<u8>,
    /// When the payload was received
    pub arrival: EventTime,
}

/// Counters of all stages, collected on shutdown
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PipelineReport {
    /// Payloads decoded into records
    pub decoded: u64,
    /// Payloads dropped because they could not be decoded
    pub decode_errors: u64,
    /// Summed over all join partitions
    pub join: JoinMetrics,
    /// Summed over all stats partitions
    pub stats: StatsMetrics,
    pub joined_forwarder: ForwarderMetrics,
    pub stats_forwarder: ForwarderMetrics,
}

/// Errors starting, feeding or shutting down a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Join(#[from] JoinConfigError),
    #[error(transparent)]
    Stats(#[from] StatsConfigError),
    #[error("Failed to spawn worker thread {name}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    /// Reported for the first panicked worker, all others are still joined
    #[error("Worker thread {0} panicked")]
    WorkerPanicked(String),
    /// The input has no receiver left
    #[error("Pipeline input is closed")]
    Closed,
}

/// A pipeline ready to be started
///
/// # Example
/// ```rust
/// use std::{collections::HashMap, sync::Arc};
/// use truckstream::clock::SystemClock;
/// use truckstream::codec::StaticSchemaRegistry;
/// use truckstream::config::PipelineConfig;
/// use truckstream::pipeline::Pipeline;
/// use truckstream::sinks::VecSink;
/// use truckstream::types::{JoinedRecord, StatsRecord, StreamTag};
///
/// let registry = StaticSchemaRegistry::new()
///     .register(1, StreamTag::Truck)
///     .register(2, StreamTag::Traffic);
/// let handle = Pipeline::builder()
///     .config(PipelineConfig::from_map(&HashMap::new()).unwrap())
///     .clock(Arc::new(SystemClock))
///     .registry(Arc::new(registry))
///     .joined_sink(VecSink::<JoinedRecord>::new())
///     .stats_sink(VecSink::<StatsRecord>::new())
///     .build()
///     .start()
///     .unwrap();
/// let report = handle.shutdown().unwrap();
/// assert_eq!(report.decoded, 0);
/// ```
#[derive(Builder)]
pub struct Pipeline<J, S> {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<dyn SchemaRegistry>,
    joined_sink: J,
    stats_sink: S,
}

impl<J, S> Pipeline<J, S>
where
    J: BatchSink<JoinedRecord>,
    S: BatchSink<StatsRecord>,
{
    /// Validate the configuration and spawn all stage workers
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let config = self.config;
        config.validate()?;
        let capacity = config.runtime.channel_capacity;
        let poll = config.runtime.poll_interval();
        let mut workers = Vec::new();
        let closing = ShutdownSignal::default();

        // built back to front so every stage has its outputs at hand
        let (stats_fwd_tx, stats_fwd_rx) = flume::bounded(capacity);
        let forwarder = BatchForwarder::builder()
            .name("stats")
            .sink(self.stats_sink)
            .batch_size(config.forwarders.stats_batch_size)
            .max_pending(config.forwarders.max_pending)
            .build();
        let clock = Arc::clone(&self.clock);
        let signal = closing.clone();
        let tick = config.forwarders.stats_tick();
        workers.push(spawn("forward-stats".to_owned(), move || {
            StageReport::StatsForwarder(stages::forward(
                forwarder,
                stats_fwd_rx,
                signal,
                clock,
                tick,
                poll,
            ))
        })?);

        let (joined_fwd_tx, joined_fwd_rx) = flume::bounded(capacity);
        let forwarder = BatchForwarder::builder()
            .name("joined")
            .sink(self.joined_sink)
            .batch_size(config.forwarders.joined_batch_size)
            .max_pending(config.forwarders.max_pending)
            .build();
        let clock = Arc::clone(&self.clock);
        let signal = closing.clone();
        let tick = config.forwarders.joined_tick();
        workers.push(spawn("forward-joined".to_owned(), move || {
            StageReport::JoinedForwarder(stages::forward(
                forwarder,
                joined_fwd_rx,
                signal,
                clock,
                tick,
                poll,
            ))
        })?);

        let mut stats_inputs = Vec::with_capacity(config.runtime.stats_parallelism);
        for i in 0..config.runtime.stats_parallelism {
            let (tx, rx) = flume::bounded(capacity);
            stats_inputs.push(tx);
            let aggregator = SlidingStatsAggregator::builder()
                .length(config.stats.slide_length())
                .slide(config.stats.slide_interval())
                .build()?;
            let output = stats_fwd_tx.clone();
            let clock = Arc::clone(&self.clock);
            workers.push(spawn(format!("stats-{i}"), move || {
                let _span = info_span!("stats", partition = i).entered();
                stages::stats(aggregator, rx, output, clock, poll)
            })?);
        }

        let mut join_inputs = Vec::with_capacity(config.runtime.join_parallelism);
        for i in 0..config.runtime.join_parallelism {
            let (tx, rx) = flume::bounded(capacity);
            join_inputs.push(tx);
            let window = TumblingJoinWindow::builder()
                .window_duration(config.join.window_duration())
                .lateness(config.join.lateness())
                .unmatched(config.join.unmatched_policy)
                .build()?;
            let outputs = JoinOutputs {
                forward: joined_fwd_tx.clone(),
                stats: stats_inputs.clone(),
            };
            let clock = Arc::clone(&self.clock);
            workers.push(spawn(format!("join-{i}"), move || {
                let _span = info_span!("join", partition = i).entered();
                stages::join(window, rx, outputs, clock, poll)
            })?);
        }

        let (input, input_rx) = flume::bounded(capacity);
        let decoder = RecordDecoder::new(self.registry);
        for i in 0..config.runtime.decode_parallelism {
            let decoder = decoder.clone();
            let input_rx = input_rx.clone();
            let partitions = join_inputs.clone();
            workers.push(spawn(format!("decode-{i}"), move || {
                let _span = info_span!("decode", worker = i).entered();
                stages::decode(decoder, input_rx, partitions)
            })?);
        }

        info!(workers = workers.len(), "Pipeline started");
        Ok(PipelineHandle {
            input,
            closing,
            workers,
        })
    }
}

fn spawn<F>(name: String, work: F) -> Result<(String, JoinHandle<StageReport>), PipelineError>
where
    F: FnOnce() -> StageReport + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(work)
        .map(|handle| (name.clone(), handle))
        .map_err(|source| PipelineError::Spawn { name, source })
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    input: Sender<RawEvent>,
    closing: ShutdownSignal,
    workers: Vec<(String, JoinHandle<StageReport>)>,
}

impl PipelineHandle {
    /// Send an event into the pipeline, blocking while the input channel is full
    pub fn send(&self, event: RawEvent) -> Result<(), PipelineError> {
        self.input.send(event).map_err(|_| PipelineError::Closed)
    }

    /// Another sender into the pipeline input. The pipeline only drains once all of
    /// these are dropped.
    pub fn sender(&self) -> Sender<RawEvent> {
        self.input.clone()
    }

    /// Close the input, wait for every stage to drain and collect their counters.
    ///
    /// A forwarder whose sink keeps applying backpressure retries a bounded number of
    /// times and then discards what it holds, see [ForwarderMetrics::discarded].
    pub fn shutdown(self) -> Result<PipelineReport, PipelineError> {
        self.closing.raise();
        drop(self.input);
        let mut report = PipelineReport::default();
        let mut panicked = None;
        for (name, worker) in self.workers {
            match worker.join() {
                Ok(StageReport::Decode { decoded, failed }) => {
                    report.decoded += decoded;
                    report.decode_errors += failed;
                }
                Ok(StageReport::Join(metrics)) => report.join.merge(&metrics),
                Ok(StageReport::Stats(metrics)) => report.stats.merge(&metrics),
                Ok(StageReport::JoinedForwarder(metrics)) => report.joined_forwarder = metrics,
                Ok(StageReport::StatsForwarder(metrics)) => report.stats_forwarder = metrics,
                Err(_) => {
                    panicked.get_or_insert(PipelineError::WorkerPanicked(name));
                }
            }
        }
        match panicked {
            Some(e) => Err(e),
            None => {
                info!(?report, "Pipeline shut down");
                Ok(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        clock::ManualClock,
        codec::RecordEncoder,
        sinks::{SinkResponse, VecSink},
        testing::{init_logger, registry, traffic, truck, ScriptedSink},
        types::{DriverKey, TypedRecord},
    };

    fn config(vars: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        PipelineConfig::from_map(&vars).unwrap()
    }

    fn start<J: BatchSink<JoinedRecord>>(
        config: PipelineConfig,
        clock: &ManualClock,
        joined: J,
        stats: VecSink<StatsRecord>,
    ) -> PipelineHandle {
        init_logger();
        Pipeline::builder()
            .config(config)
            .clock(Arc::new(clock.clone()))
            .registry(registry())
            .joined_sink(joined)
            .stats_sink(stats)
            .build()
            .start()
            .unwrap()
    }

    fn raw(record: TypedRecord) -> RawEvent {
        let payload = RecordEncoder::new(registry()).encode(&record).unwrap();
        RawEvent {
            tag: record.tag(),
            payload,
            arrival: record.event_time(),
        }
    }

    #[test]
    fn joins_and_aggregates_end_to_end() {
        let clock = ManualClock::new(0);
        let joined = VecSink::new();
        let stats = VecSink::new();
        let handle = start(config(&[]), &clock, joined.clone(), stats.clone());
        handle.send(raw(TypedRecord::Truck(truck("D1", 10_000)))).unwrap();
        handle
            .send(raw(TypedRecord::Traffic(traffic("D1", 50_000, 40))))
            .unwrap();
        let report = handle.shutdown().unwrap();

        let joined = joined.records();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].truck.as_ref().unwrap().event_time, 10_000);
        assert_eq!(joined[0].traffic.as_ref().unwrap().event_time, 50_000);

        let stats = stats.records();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].driver, DriverKey::from("D1"));
        assert_eq!(stats[0].sample_count, 1);
        assert_eq!(stats[0].mean_speed, 80.0);
        assert_eq!(stats[0].mean_congestion, Some(40.0));

        assert_eq!(report.decoded, 2);
        assert_eq!(report.join.joined, 1);
        assert_eq!(report.joined_forwarder.records_accepted, 1);
        assert_eq!(report.stats_forwarder.records_accepted, 1);
    }

    #[test]
    fn different_windows_do_not_join() {
        let clock = ManualClock::new(0);
        let joined = VecSink::new();
        let handle = start(config(&[]), &clock, joined.clone(), VecSink::new());
        handle.send(raw(TypedRecord::Truck(truck("D1", 10_000)))).unwrap();
        handle
            .send(raw(TypedRecord::Traffic(traffic("D1", 65_000, 40))))
            .unwrap();
        let report = handle.shutdown().unwrap();
        assert!(joined.records().is_empty());
        assert_eq!(report.join.unmatched, 2);
    }

    #[test]
    fn counts_undecodable_payloads() {
        let clock = ManualClock::new(0);
        let handle = start(config(&[]), &clock, VecSink::new(), VecSink::new());
        handle
            .send(RawEvent {
                tag: StreamTag::Truck,
                payload: vec![1, 2, 3, 4, 5, 6],
                arrival: 0,
            })
            .unwrap();
        handle.send(raw(TypedRecord::Truck(truck("D1", 0)))).unwrap();
        let report = handle.shutdown().unwrap();
        assert_eq!(report.decoded, 1);
        assert_eq!(report.decode_errors, 1);
    }

    /// the clock is far past the records' window before they arrive
    #[test]
    fn drops_late_records() {
        let clock = ManualClock::new(1_000_000);
        let joined = VecSink::new();
        let handle = start(config(&[]), &clock, joined.clone(), VecSink::new());
        handle.send(raw(TypedRecord::Truck(truck("D1", 10_000)))).unwrap();
        handle
            .send(raw(TypedRecord::Traffic(traffic("D1", 50_000, 40))))
            .unwrap();
        let report = handle.shutdown().unwrap();
        assert!(joined.records().is_empty());
        assert_eq!(report.join.late, 2);
    }

    #[test]
    fn partitions_keys_across_workers() {
        let clock = ManualClock::new(0);
        let joined = VecSink::new();
        let stats = VecSink::new();
        let config = config(&[
            ("TRUCKSTREAM_JOIN_PARALLELISM", "3"),
            ("TRUCKSTREAM_STATS_PARALLELISM", "2"),
            ("TRUCKSTREAM_DECODE_PARALLELISM", "4"),
            ("TRUCKSTREAM_JOINED_BATCH_SIZE", "7"),
        ]);
        let handle = start(config, &clock, joined.clone(), stats.clone());
        for i in 0..20 {
            let key = format!("D{i}");
            handle.send(raw(TypedRecord::Truck(truck(&key, 1_000)))).unwrap();
            handle
                .send(raw(TypedRecord::Traffic(traffic(&key, 2_000, 10))))
                .unwrap();
        }
        let report = handle.shutdown().unwrap();

        assert_eq!(joined.records().len(), 20);
        assert!(joined.batches().iter().all(|b| b.len() <= 7));
        let mut drivers: Vec<_> = stats.records().into_iter().map(|s| s.driver).collect();
        drivers.sort();
        drivers.dedup();
        assert_eq!(drivers.len(), 20);
        assert_eq!(report.join.joined, 20);
        assert_eq!(report.stats.ingested, 20);
    }

    #[test]
    fn backpressure_loses_nothing() {
        let clock = ManualClock::new(0);
        let joined = ScriptedSink::new([SinkResponse::Backpressure, SinkResponse::Backpressure]);
        let config = config(&[
            ("TRUCKSTREAM_JOINED_BATCH_SIZE", "2"),
            ("TRUCKSTREAM_POLL_INTERVAL_MS", "1"),
        ]);
        let handle = start(config, &clock, joined.clone(), VecSink::new());
        for i in 0..5 {
            let key = format!("D{i}");
            handle.send(raw(TypedRecord::Truck(truck(&key, 1_000)))).unwrap();
            handle
                .send(raw(TypedRecord::Traffic(traffic(&key, 2_000, 10))))
                .unwrap();
        }
        let report = handle.shutdown().unwrap();

        let mut keys: Vec<_> = joined
            .accepted()
            .into_iter()
            .map(|r| r.correlation_key)
            .collect();
        keys.sort();
        assert_eq!(keys.len(), 5);
        keys.dedup();
        assert_eq!(keys.len(), 5);
        assert_eq!(report.joined_forwarder.backpressure_signals, 2);
        assert_eq!(report.joined_forwarder.discarded, 0);
    }

    /// Poll `done` while moving the clock forward by `step`, up to a wall clock deadline
    fn wait_for(clock: &ManualClock, step: Duration, done: impl Fn() -> bool) -> bool {
        let started = Instant::now();
        while !done() {
            if started.elapsed() > Duration::from_secs(10) {
                return false;
            }
            clock.advance(step);
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// windows close and statistics are emitted as the clock moves, not only on shutdown
    #[test]
    fn emits_while_running() {
        let clock = ManualClock::new(0);
        let joined = VecSink::new();
        let stats = VecSink::new();
        let config = config(&[
            ("TRUCKSTREAM_WINDOW_DURATION_MS", "1000"),
            ("TRUCKSTREAM_LATENESS_MS", "1000"),
            ("TRUCKSTREAM_SLIDE_LENGTH_MS", "10000"),
            ("TRUCKSTREAM_SLIDE_INTERVAL_MS", "1000"),
            ("TRUCKSTREAM_JOINED_BATCH_SIZE", "1"),
            ("TRUCKSTREAM_STATS_BATCH_SIZE", "1"),
            ("TRUCKSTREAM_DECODE_PARALLELISM", "1"),
            ("TRUCKSTREAM_JOIN_PARALLELISM", "1"),
            ("TRUCKSTREAM_CHANNEL_CAPACITY", "1"),
            ("TRUCKSTREAM_POLL_INTERVAL_MS", "1"),
        ]);
        let handle = start(config, &clock, joined.clone(), stats.clone());
        handle.send(raw(TypedRecord::Truck(truck("D1", 100)))).unwrap();
        handle
            .send(raw(TypedRecord::Traffic(traffic("D1", 200, 40))))
            .unwrap();
        // with single slot channels, once the third of these is accepted the join
        // partition has taken both D1 records, so moving the clock cannot make them late
        for _ in 0..3 {
            handle
                .send(raw(TypedRecord::Traffic(traffic("F", 50_000, 0))))
                .unwrap();
        }

        // window [0, 1000) closes once the clock passes its end plus lateness
        clock.set(2_000);
        assert!(wait_for(&clock, Duration::ZERO, || joined.records().len() == 1));

        // uneven steps, so a tick taken at the clock reading would not be aligned
        assert!(wait_for(&clock, Duration::from_millis(1_250), || !stats
            .records()
            .is_empty()));
        let emitted = stats.records();
        assert_eq!(emitted[0].driver, DriverKey::from("D1"));
        assert_eq!(emitted[0].sample_count, 1);
        assert_eq!(emitted[0].mean_congestion, Some(40.0));
        assert_eq!(emitted[0].window_end % 1_000, 0);
        assert_eq!(emitted[0].window_end - emitted[0].window_start, 10_000);

        let report = handle.shutdown().unwrap();
        assert_eq!(report.join.joined, 1);
        assert!(report.join.windows_closed >= 1);
        assert_eq!(report.join.late, 0);
        assert!(report.stats.ticks >= 1);
    }

    /// a joined sink that never recovers still lets the pipeline shut down
    #[test]
    fn shutdown_discards_under_endless_backpressure() {
        let clock = ManualClock::new(0);
        let stats = VecSink::new();
        let config = config(&[
            ("TRUCKSTREAM_JOINED_BATCH_SIZE", "1"),
            ("TRUCKSTREAM_MAX_PENDING", "1"),
            ("TRUCKSTREAM_CHANNEL_CAPACITY", "1"),
            ("TRUCKSTREAM_POLL_INTERVAL_MS", "1"),
        ]);
        let handle = start(
            config,
            &clock,
            |_: &[JoinedRecord]| SinkResponse::Backpressure,
            stats.clone(),
        );
        for i in 0..10 {
            let key = format!("D{i}");
            handle.send(raw(TypedRecord::Truck(truck(&key, 1_000)))).unwrap();
            handle
                .send(raw(TypedRecord::Traffic(traffic(&key, 2_000, 10))))
                .unwrap();
        }
        let (done_tx, done_rx) = flume::bounded(1);
        thread::spawn(move || done_tx.send(handle.shutdown()).unwrap());
        let report = done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("pipeline did not shut down")
            .unwrap();

        assert_eq!(report.join.joined, 10);
        assert_eq!(report.joined_forwarder.records_accepted, 0);
        assert_eq!(report.joined_forwarder.discarded, 10);
        // the statistics path is unaffected
        assert_eq!(stats.records().len(), 10);
        assert_eq!(report.stats_forwarder.discarded, 0);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = config(&[]);
        config.runtime.join_parallelism = 0;
        let res = Pipeline::builder()
            .config(config)
            .clock(Arc::new(ManualClock::new(0)))
            .registry(registry())
            .joined_sink(VecSink::<JoinedRecord>::new())
            .stats_sink(VecSink::<StatsRecord>::new())
            .build()
            .start();
        assert!(matches!(res, Err(PipelineError::Config(ConfigError::Zero(_)))));
    }
}
