//! Synthetic truck telemetry and traffic events
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use truckstream::types::{
    CorrelationKey, DriverKey, EventTime, TrafficRecord, TruckEventType, TruckRecord,
    TypedRecord,
};

const NAMES: [&str; 8] = [
    "Jamie Rivera",
    "Sam Okafor",
    "Alex Novak",
    "Robin Tanaka",
    "Kim Adeyemi",
    "Charlie Moreau",
    "Dana Kowalski",
    "Morgan Lindqvist",
];

const VIOLATIONS: [TruckEventType; 4] = [
    TruckEventType::Overspeed,
    TruckEventType::LaneDeparture,
    TruckEventType::UnsafeFollowDistance,
    TruckEventType::UnsafeTailDistance,
];

#[derive(Debug, Clone)]
struct Driver {
    key: DriverKey,
    name: &'static str,
    truck_id: u32,
    route_id: u32,
}

/// Produces trucks driving on routes and the traffic on those routes.
/// Truck and traffic events are correlated by route.
pub(crate) struct Generator {
    rng: StdRng,
    drivers: Vec<Driver>,
    /// max age of a generated event relative to now
    max_delay: EventTime,
}

impl Generator {
    pub fn new(drivers: u32, routes: u32, rng: StdRng) -> Self {
        let routes = routes.max(1);
        let drivers = (0..drivers.max(1))
            .map(|i| Driver {
                key: DriverKey::new(format!("driver-{i}")),
                name: NAMES[i as usize % NAMES.len()],
                truck_id: 100 + i,
                route_id: i % routes,
            })
            .collect();
        Self {
            rng,
            drivers,
            max_delay: 2_000,
        }
    }

    pub fn from_entropy(drivers: u32, routes: u32) -> Self {
        Self::new(drivers, routes, StdRng::from_entropy())
    }

    /// One truck event of a random driver and, most of the time, a traffic reading for
    /// its route. Event times lag slightly behind `now` like on a real network.
    pub fn next_events(&mut self, now: EventTime) -> Vec<TypedRecord> {
        let Some(driver) = self.drivers.choose(&mut self.rng).cloned() else {
            return Vec::new();
        };
        let key = CorrelationKey::new(format!("route-{}", driver.route_id));
        let event_type = if self.rng.gen_bool(0.1) {
            VIOLATIONS[self.rng.gen_range(0..VIOLATIONS.len())]
        } else {
            TruckEventType::Normal
        };
        let speed = match event_type {
            TruckEventType::Overspeed => self.rng.gen_range(100.0..140.0),
            _ => self.rng.gen_range(40.0..95.0),
        };
        let mut events = vec![TypedRecord::Truck(TruckRecord {
            correlation_key: key.clone(),
            driver: driver.key,
            truck_id: driver.truck_id,
            driver_name: driver.name.to_owned(),
            route_id: driver.route_id,
            event_time: now - self.rng.gen_range(0..self.max_delay),
            event_type,
            speed,
            latitude: 38.0 + self.rng.gen_range(0.0..2.0),
            longitude: -91.0 + self.rng.gen_range(0.0..2.0),
        })];
        if self.rng.gen_bool(0.8) {
            events.push(TypedRecord::Traffic(TrafficRecord {
                correlation_key: key,
                route_id: driver.route_id,
                event_time: now - self.rng.gen_range(0..self.max_delay),
                congestion_level: self.rng.gen_range(0..=100),
            }));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(seed: u64) -> Generator {
        Generator::new(5, 2, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn same_seed_same_events() {
        let (mut first, mut second) = (generator(7), generator(7));
        let a: Vec<_> = (0..20).flat_map(|i| first.next_events(i)).collect();
        let b: Vec<_> = (0..20).flat_map(|i| second.next_events(i)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn traffic_shares_the_route_key() {
        let mut gen = generator(1);
        for i in 0..200 {
            let events = gen.next_events(10_000 + i);
            let TypedRecord::Truck(truck) = &events[0] else {
                panic!("first event must be a truck")
            };
            assert_eq!(truck.correlation_key.as_str(), format!("route-{}", truck.route_id));
            if let Some(TypedRecord::Traffic(traffic)) = events.get(1) {
                assert_eq!(traffic.correlation_key, truck.correlation_key);
            }
        }
    }

    #[test]
    fn events_lag_behind_now() {
        let mut gen = generator(3);
        for event in gen.next_events(50_000) {
            let t = event.event_time();
            assert!(t <= 50_000 && t > 48_000);
        }
    }
}
