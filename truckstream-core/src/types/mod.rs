//! Types shared by all stages of the pipeline
mod record;
mod time;

pub use record::{
    CorrelationKey, DriverKey, JoinedRecord, StatsRecord, StreamTag, TrafficRecord,
    TruckEventType, TruckRecord, TypedRecord,
};
pub use time::{duration_millis, EventTime, WindowId};
