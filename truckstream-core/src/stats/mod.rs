//! Sliding window statistics per driver over the joined stream.
use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use bon::bon;
use thiserror::Error;
use tracing::trace;

use crate::types::{duration_millis, DriverKey, EventTime, JoinedRecord, StatsRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsConfigError {
    #[error("Slide interval must be at least one millisecond")]
    ZeroSlide,
    #[error("Window length {length:?} must be longer than the slide interval {slide:?}")]
    LengthNotLonger { length: Duration, slide: Duration },
}

/// Counters kept by a [SlidingStatsAggregator]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsMetrics {
    pub ingested: u64,
    /// Records dropped from the state after leaving the window
    pub evicted: u64,
    pub ticks: u64,
    /// Stats records produced over all ticks
    pub emitted: u64,
}

impl StatsMetrics {
    /// Add the counters of another aggregator partition
    pub fn merge(&mut self, other: &StatsMetrics) {
        self.ingested += other.ingested;
        self.evicted += other.evicted;
        self.ticks += other.ticks;
        self.emitted += other.emitted;
    }
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    speed_sum: f64,
    violations: u64,
    congestion_sum: f64,
    congestion_count: u64,
}

impl Accumulator {
    fn add(&mut self, record: &JoinedRecord) {
        let Some(truck) = record.truck.as_ref() else {
            return;
        };
        self.count += 1;
        self.speed_sum += truck.speed;
        if truck.event_type.is_violation() {
            self.violations += 1;
        }
        if let Some(traffic) = record.traffic.as_ref() {
            self.congestion_sum += f64::from(traffic.congestion_level);
            self.congestion_count += 1;
        }
    }

    fn finish(self, driver: DriverKey, window_start: EventTime, window_end: EventTime) -> StatsRecord {
        StatsRecord {
            driver,
            window_start,
            window_end,
            sample_count: self.count,
            mean_speed: self.speed_sum / self.count as f64,
            violation_count: self.violations,
            mean_congestion: (self.congestion_count > 0)
                .then(|| self.congestion_sum / self.congestion_count as f64),
        }
    }
}

/// Keeps the joined records of the last `length` milliseconds and computes per driver
/// statistics over them on every tick.
///
/// Records are tagged with their arrival time. A tick at time `now` covers the half open
/// interval `(now - length, now]`, anything at or before the lower bound is evicted.
#[derive(Debug)]
pub struct SlidingStatsAggregator {
    length: EventTime,
    slide: Duration,
    // ordered by arrival
    state: VecDeque<(EventTime, JoinedRecord)>,
    newest: Option<EventTime>,
    metrics: StatsMetrics,
}

#[bon]
impl SlidingStatsAggregator {
    /// Create an aggregator for windows of `length`, advancing every `slide`
    #[builder]
    pub fn new(length: Duration, slide: Duration) -> Result<Self, StatsConfigError> {
        if duration_millis(&slide) <= 0 {
            return Err(StatsConfigError::ZeroSlide);
        }
        if length <= slide {
            return Err(StatsConfigError::LengthNotLonger { length, slide });
        }
        Ok(Self {
            length: duration_millis(&length),
            slide,
            state: VecDeque::new(),
            newest: None,
            metrics: StatsMetrics::default(),
        })
    }
}

impl SlidingStatsAggregator {
    /// Interval at which [SlidingStatsAggregator::tick] should be called
    pub fn slide(&self) -> Duration {
        self.slide
    }

    /// Add a joined record which arrived at `arrival`
    pub fn ingest(&mut self, record: JoinedRecord, arrival: EventTime) {
        let newest = self.newest.map_or(arrival, |n| n.max(arrival));
        self.newest = Some(newest);
        // keep the deque ordered even if arrivals are not monotonic
        let idx = self.state.partition_point(|(t, _)| *t <= arrival);
        self.state.insert(idx, (arrival, record));
        self.metrics.ingested += 1;
        self.evict(newest.saturating_sub(self.length));
    }

    /// Evict aged records and compute one [StatsRecord] per driver with at least one
    /// record in `(now - length, now]`. Output is ordered by driver.
    pub fn tick(&mut self, now: EventTime) -> Vec<StatsRecord> {
        let window_start = now.saturating_sub(self.length);
        self.evict(window_start);
        self.metrics.ticks += 1;

        let mut groups: BTreeMap<&DriverKey, Accumulator> = BTreeMap::new();
        for (_, record) in self.state.iter().take_while(|(t, _)| *t <= now) {
            if let Some(driver) = record.driver() {
                groups.entry(driver).or_default().add(record);
            }
        }
        let out: Vec<StatsRecord> = groups
            .into_iter()
            .map(|(driver, acc)| acc.finish(driver.clone(), window_start, now))
            .collect();
        trace!(now, retained = self.state.len(), emitted = out.len(), "Sliding window tick");
        self.metrics.emitted += out.len() as u64;
        out
    }

    fn evict(&mut self, lower: EventTime) {
        let aged = self.state.partition_point(|(t, _)| *t <= lower);
        self.state.drain(..aged);
        self.metrics.evicted += aged as u64;
    }

    /// Number of records currently retained
    pub fn retained(&self) -> usize {
        self.state.len()
    }

    /// Counters accumulated so far
    pub fn metrics(&self) -> StatsMetrics {
        self.metrics
    }
}
