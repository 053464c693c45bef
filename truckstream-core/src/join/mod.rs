//! Tumbling window join of the truck and traffic streams.
//!
//! Records are buffered per window and correlation key. When the clock passes a
//! window's end plus the lateness tolerance, every truck record is paired with every
//! traffic record of the same key in that window. Closed windows are never reopened,
//! records arriving for them are late and get dropped.
use std::{collections::BTreeMap, str::FromStr, time::Duration};

use bon::bon;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{
    duration_millis, CorrelationKey, EventTime, JoinedRecord, TrafficRecord, TruckRecord,
    TypedRecord, WindowId,
};

/// What to do with records whose key has no partner in the other stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmatchedPolicy {
    /// Drop them, only count them
    #[default]
    Drop,
    /// Emit one [JoinedRecord] per unmatched record with the missing side left empty
    EmitPartial,
}

impl FromStr for UnmatchedPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "emit-partial" | "emit_partial" => Ok(Self::EmitPartial),
            _ => Err(UnknownPolicy(s.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown unmatched record policy '{0}', expected 'drop' or 'emit-partial'")]
pub struct UnknownPolicy(String);

/// A record whose window had already been closed when it arrived
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Record at {event_time} belongs to closed window {window}, windows before {closed_below} are closed")]
pub struct LateRecordError {
    /// Window the record belongs to
    pub window: WindowId,
    pub event_time: EventTime,
    /// Every window below this one was closed when the record arrived
    pub closed_below: WindowId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinConfigError {
    #[error("Window duration must be at least one millisecond")]
    ZeroWindow,
}

/// Counters kept by a [TumblingJoinWindow]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JoinMetrics {
    /// Records accepted into an open window
    pub ingested: u64,
    /// Records rejected because their window was already closed
    pub late: u64,
    /// Joined records emitted, one per truck and traffic pair
    pub joined: u64,
    /// Records without a counterpart in their window, dropped or emitted as partial joins
    pub unmatched: u64,
    pub windows_closed: u64,
}

impl JoinMetrics {
    /// Add the counters of another join partition
    pub fn merge(&mut self, other: &JoinMetrics) {
        self.ingested += other.ingested;
        self.late += other.late;
        self.joined += other.joined;
        self.unmatched += other.unmatched;
        self.windows_closed += other.windows_closed;
    }
}

/// Records of both streams sharing one key within one window
#[derive(Debug, Default)]
struct KeyedRecords {
    trucks: Vec<TruckRecord>,
    traffic: Vec<TrafficRecord>,
}

/// Everything buffered for a single window, keys in order of first appearance
#[derive(Debug, Default)]
struct WindowBuffer {
    keys: IndexMap<CorrelationKey, KeyedRecords>,
}

impl WindowBuffer {
    fn push(&mut self, record: TypedRecord) {
        match record {
            TypedRecord::Truck(t) => self
                .keys
                .entry(t.correlation_key.clone())
                .or_default()
                .trucks
                .push(t),
            TypedRecord::Traffic(t) => self
                .keys
                .entry(t.correlation_key.clone())
                .or_default()
                .traffic
                .push(t),
        }
    }

    fn len(&self) -> usize {
        self.keys
            .values()
            .map(|r| r.trucks.len() + r.traffic.len())
            .sum()
    }
}

/// The join engine. Owns the buffers of all currently open windows.
#[derive(Debug)]
pub struct TumblingJoinWindow {
    window_duration: EventTime,
    lateness: EventTime,
    unmatched: UnmatchedPolicy,
    open: BTreeMap<WindowId, WindowBuffer>,
    // every window with a smaller id has been closed
    closed_below: Option<WindowId>,
    metrics: JoinMetrics,
}

#[bon]
impl TumblingJoinWindow {
    /// Create a new join.
    /// `lateness` is how long past its end a window stays open for stragglers.
    #[builder]
    pub fn new(
        window_duration: Duration,
        #[builder(default)] lateness: Duration,
        #[builder(default)] unmatched: UnmatchedPolicy,
    ) -> Result<Self, JoinConfigError> {
        let window_duration = duration_millis(&window_duration);
        if window_duration <= 0 {
            return Err(JoinConfigError::ZeroWindow);
        }
        Ok(Self {
            window_duration,
            lateness: duration_millis(&lateness),
            unmatched,
            open: BTreeMap::new(),
            closed_below: None,
            metrics: JoinMetrics::default(),
        })
    }
}

impl TumblingJoinWindow {
    /// Buffer a record in the window its event time falls into.
    /// Returns the window id or an error if that window is already closed.
    pub fn ingest(&mut self, record: TypedRecord) -> Result<WindowId, LateRecordError> {
        let event_time = record.event_time();
        let window = WindowId::of(event_time, self.window_duration);
        if let Some(closed_below) = self.closed_below.filter(|c| window < *c) {
            self.metrics.late += 1;
            return Err(LateRecordError {
                window,
                event_time,
                closed_below,
            });
        }
        self.open.entry(window).or_default().push(record);
        self.metrics.ingested += 1;
        Ok(window)
    }

    /// Close all windows whose end plus lateness tolerance is at or before `now`,
    /// appending their join results to `output` in window order.
    /// Returns the number of windows closed.
    pub fn advance_to(&mut self, now: EventTime, output: &mut Vec<JoinedRecord>) -> usize {
        let boundary = WindowId::of(now.saturating_sub(self.lateness), self.window_duration);
        if self.closed_below.is_some_and(|c| c >= boundary) {
            return 0;
        }
        self.closed_below = Some(boundary);
        let still_open = self.open.split_off(&boundary);
        let closing = std::mem::replace(&mut self.open, still_open);
        let count = closing.len();
        for (window, buffer) in closing {
            self.close_window(window, buffer, now, output);
        }
        count
    }

    /// Close every open window regardless of the clock. Used on shutdown.
    pub fn drain(&mut self, now: EventTime, output: &mut Vec<JoinedRecord>) -> usize {
        let closing = std::mem::take(&mut self.open);
        if let Some((last, _)) = closing.last_key_value() {
            let after_last = WindowId(last.0.saturating_add(1));
            self.closed_below = self.closed_below.max(Some(after_last));
        }
        let count = closing.len();
        for (window, buffer) in closing {
            self.close_window(window, buffer, now, output);
        }
        count
    }

    fn close_window(
        &mut self,
        window: WindowId,
        buffer: WindowBuffer,
        now: EventTime,
        output: &mut Vec<JoinedRecord>,
    ) {
        let buffered = buffer.len();
        let mut joined = 0;
        let mut unmatched = 0;
        for (key, records) in buffer.keys {
            if !records.trucks.is_empty() && !records.traffic.is_empty() {
                for (truck, traffic) in records.trucks.iter().cartesian_product(&records.traffic) {
                    output.push(JoinedRecord {
                        correlation_key: key.clone(),
                        window,
                        truck: Some(truck.clone()),
                        traffic: Some(traffic.clone()),
                        join_time: now,
                    });
                    joined += 1;
                }
                continue;
            }
            unmatched += records.trucks.len() + records.traffic.len();
            if self.unmatched == UnmatchedPolicy::EmitPartial {
                output.extend(records.trucks.into_iter().map(|t| JoinedRecord {
                    correlation_key: key.clone(),
                    window,
                    truck: Some(t),
                    traffic: None,
                    join_time: now,
                }));
                output.extend(records.traffic.into_iter().map(|t| JoinedRecord {
                    correlation_key: key.clone(),
                    window,
                    truck: None,
                    traffic: Some(t),
                    join_time: now,
                }));
            }
        }
        debug!(%window, buffered, joined, unmatched, "Closed join window");
        self.metrics.joined += joined;
        self.metrics.unmatched += unmatched as u64;
        self.metrics.windows_closed += 1;
    }

    /// Number of windows currently buffering records
    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    /// Counters accumulated so far
    pub fn metrics(&self) -> JoinMetrics {
        self.metrics
    }
}
