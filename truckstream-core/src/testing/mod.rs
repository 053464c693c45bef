//! Helpers shared by unit tests
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{
    codec::{SchemaRegistry, StaticSchemaRegistry},
    sinks::{BatchSink, SinkResponse},
    types::{
        CorrelationKey, DriverKey, EventTime, JoinedRecord, StreamTag, TrafficRecord,
        TruckEventType, TruckRecord, WindowId,
    },
};

/// Route `tracing` output of the code under test to the test harness' captured output
pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Registry with schema 1 for trucks and 2 for traffic
pub fn registry() -> Arc<dyn SchemaRegistry> {
    Arc::new(
        StaticSchemaRegistry::new()
            .register(1, StreamTag::Truck)
            .register(2, StreamTag::Traffic),
    )
}

/// A normal driving event, the driver is named like the key
pub fn truck(key: &str, event_time: EventTime) -> TruckRecord {
    TruckRecord {
        correlation_key: CorrelationKey::from(key),
        driver: DriverKey::from(key),
        truck_id: 11,
        driver_name: "Jamie Rivera".to_owned(),
        route_id: 7,
        event_time,
        event_type: TruckEventType::Normal,
        speed: 80.0,
        latitude: 38.44,
        longitude: -90.35,
    }
}

pub fn traffic(key: &str, event_time: EventTime, congestion_level: u8) -> TrafficRecord {
    TrafficRecord {
        correlation_key: CorrelationKey::from(key),
        route_id: 7,
        event_time,
        congestion_level,
    }
}

/// A complete joined record for the given driver
pub fn joined(
    driver: &str,
    speed: f64,
    event_type: TruckEventType,
    congestion_level: u8,
) -> JoinedRecord {
    let mut truck = truck(driver, 0);
    truck.speed = speed;
    truck.event_type = event_type;
    JoinedRecord {
        correlation_key: CorrelationKey::from(driver),
        window: WindowId(0),
        truck: Some(truck),
        traffic: Some(traffic(driver, 0, congestion_level)),
        join_time: 0,
    }
}

/// A sink answering with a scripted sequence of responses, then accepting everything.
/// Clones share the script and the call log.
#[derive(Clone)]
pub struct ScriptedSink<R> {
    responses: Arc<Mutex<VecDeque<SinkResponse>>>,
    calls: Arc<Mutex<Vec<(Vec<R>, SinkResponse)>>>,
}

impl<R: Clone> ScriptedSink<R> {
    pub fn new(responses: impl IntoIterator<Item = SinkResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every batch offered to the sink, in order
    pub fn calls(&self) -> Vec<Vec<R>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(batch, _)| batch.clone())
            .collect()
    }

    /// All records of accepted batches, in order
    pub fn accepted(&self) -> Vec<R> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, resp)| *resp == SinkResponse::Accepted)
            .flat_map(|(batch, _)| batch.iter().cloned())
            .collect()
    }
}

impl<R: Clone + Send + 'static> BatchSink<R> for ScriptedSink<R> {
    fn submit_batch(&mut self, batch: &[R]) -> SinkResponse {
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SinkResponse::Accepted);
        self.calls
            .lock()
            .unwrap()
            .push((batch.to_vec(), response.clone()));
        response
    }
}
