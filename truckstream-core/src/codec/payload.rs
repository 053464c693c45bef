//! Wire representation of the record bodies.
//! Key and time are optional here so that their absence can be reported precisely.
use serde::{Deserialize, Serialize};

use crate::types::{
    CorrelationKey, DriverKey, EventTime, TrafficRecord, TruckEventType, TruckRecord,
};

use super::DecodeError;

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct TruckPayload {
    pub(super) correlation_key: Option<String>,
    pub(super) event_time: Option<EventTime>,
    pub(super) driver_id: String,
    pub(super) truck_id: u32,
    pub(super) driver_name: String,
    pub(super) route_id: u32,
    pub(super) event_type: TruckEventType,
    pub(super) speed: f64,
    pub(super) latitude: f64,
    pub(super) longitude: f64,
}

impl TryFrom<TruckPayload> for TruckRecord {
    type Error = DecodeError;

    fn try_from(value: TruckPayload) -> Result<Self, Self::Error> {
        Ok(TruckRecord {
            correlation_key: required_key(value.correlation_key)?,
            event_time: value
                .event_time
                .ok_or(DecodeError::MissingField("event_time"))?,
            driver: DriverKey::new(value.driver_id),
            truck_id: value.truck_id,
            driver_name: value.driver_name,
            route_id: value.route_id,
            event_type: value.event_type,
            speed: value.speed,
            latitude: value.latitude,
            longitude: value.longitude,
        })
    }
}

impl From<&TruckRecord> for TruckPayload {
    fn from(value: &TruckRecord) -> Self {
        Self {
            correlation_key: Some(value.correlation_key.to_string()),
            event_time: Some(value.event_time),
            driver_id: value.driver.to_string(),
            truck_id: value.truck_id,
            driver_name: value.driver_name.clone(),
            route_id: value.route_id,
            event_type: value.event_type,
            speed: value.speed,
            latitude: value.latitude,
            longitude: value.longitude,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct TrafficPayload {
    pub(super) correlation_key: Option<String>,
    pub(super) event_time: Option<EventTime>,
    pub(super) route_id: u32,
    pub(super) congestion_level: u8,
}

impl TryFrom<TrafficPayload> for TrafficRecord {
    type Error = DecodeError;

    fn try_from(value: TrafficPayload) -> Result<Self, Self::Error> {
        Ok(TrafficRecord {
            correlation_key: required_key(value.correlation_key)?,
            event_time: value
                .event_time
                .ok_or(DecodeError::MissingField("event_time"))?,
            route_id: value.route_id,
            congestion_level: value.congestion_level,
        })
    }
}

impl From<&TrafficRecord> for TrafficPayload {
    fn from(value: &TrafficRecord) -> Self {
        Self {
            correlation_key: Some(value.correlation_key.to_string()),
            event_time: Some(value.event_time),
            route_id: value.route_id,
            congestion_level: value.congestion_level,
        }
    }
}

/// an empty key is as good as no key
fn required_key(key: Option<String>) -> Result<CorrelationKey, DecodeError> {
    key.filter(|k| !k.is_empty())
        .map(CorrelationKey::new)
        .ok_or(DecodeError::MissingField("correlation_key"))
}
