//! Domain records flowing through the pipeline

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use super::{EventTime, WindowId};

/// Tags which of the two input streams a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamTag {
    /// Vehicle telemetry
    Truck,
    /// Road conditions
    Traffic,
}

impl Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamTag::Truck => write!(f, "truck"),
            StreamTag::Traffic => write!(f, "traffic"),
        }
    }
}

/// Key on which truck and traffic records are matched
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Create a new key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the driver statistics are grouped by
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverKey(String);

impl DriverKey {
    /// Create a new key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DriverKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Display for DriverKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of event a truck reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TruckEventType {
    /// Regular driving
    Normal,
    #[allow(missing_docs)]
    Overspeed,
    #[allow(missing_docs)]
    LaneDeparture,
    #[allow(missing_docs)]
    UnsafeFollowDistance,
    #[allow(missing_docs)]
    UnsafeTailDistance,
}

impl TruckEventType {
    /// Every event other than [TruckEventType::Normal] counts as a violation
    pub fn is_violation(&self) -> bool {
        !matches!(self, TruckEventType::Normal)
    }
}

/// A decoded vehicle telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruckRecord {
    /// Joins the record with traffic events of the same key
    pub correlation_key: CorrelationKey,
    /// Groups the record for sliding statistics
    pub driver: DriverKey,
    pub truck_id: u32,
    pub driver_name: String,
    pub route_id: u32,
    /// Milliseconds since the epoch
    pub event_time: EventTime,
    pub event_type: TruckEventType,
    /// km/h
    pub speed: f64,
    /// Degrees
    pub latitude: f64,
    /// Degrees
    pub longitude: f64,
}

/// A decoded road condition event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub correlation_key: CorrelationKey,
    pub route_id: u32,
    pub event_time: EventTime,
    /// 0 (free flowing) to 100 (standstill)
    pub congestion_level: u8,
}

/// Output of the decoder, one of the two input record types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedRecord {
    #[allow(missing_docs)]
    Truck(TruckRecord),
    #[allow(missing_docs)]
    Traffic(TrafficRecord),
}

impl TypedRecord {
    /// Key this record is joined on
    pub fn correlation_key(&self) -> &CorrelationKey {
        match self {
            TypedRecord::Truck(t) => &t.correlation_key,
            TypedRecord::Traffic(t) => &t.correlation_key,
        }
    }

    /// Time at which the event happened
    pub fn event_time(&self) -> EventTime {
        match self {
            TypedRecord::Truck(t) => t.event_time,
            TypedRecord::Traffic(t) => t.event_time,
        }
    }

    /// Stream this record originates from
    pub fn tag(&self) -> StreamTag {
        match self {
            TypedRecord::Truck(_) => StreamTag::Truck,
            TypedRecord::Traffic(_) => StreamTag::Traffic,
        }
    }
}

/// A truck record correlated with a traffic record of the same key and window.
///
/// Both sides are always present for inner join output. When unmatched records are
/// emitted as partial joins, exactly one side is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRecord {
    pub correlation_key: CorrelationKey,
    pub window: WindowId,
    pub truck: Option<TruckRecord>,
    pub traffic: Option<TrafficRecord>,
    /// Clock time at which the window was closed
    pub join_time: EventTime,
}

impl JoinedRecord {
    /// Driver of the truck side, if there is one
    pub fn driver(&self) -> Option<&DriverKey> {
        self.truck.as_ref().map(|t| &t.driver)
    }

    /// True if both sides are present
    pub fn is_complete(&self) -> bool {
        self.truck.is_some() && self.traffic.is_some()
    }
}

/// Aggregate statistics of one driver over one sliding window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub driver: DriverKey,
    /// Exclusive lower bound
    pub window_start: EventTime,
    /// Inclusive upper bound
    pub window_end: EventTime,
    pub sample_count: u64,
    pub mean_speed: f64,
    pub violation_count: u64,
    /// `None` if no sample had a traffic side
    pub mean_congestion: Option<f64>,
}
