use std::time::Duration;

use envconfig::Envconfig;

/// Settings of the demo job itself, the pipeline reads its own `TRUCKSTREAM_*` variables
#[derive(Envconfig, Debug, Clone)]
pub(crate) struct AppConfig {
    /// Number of simulated drivers
    #[envconfig(from = "TRUCKSTREAM_APP_DRIVERS", default = "10")]
    pub drivers: u32,
    /// Number of simulated routes, drivers are spread across them
    #[envconfig(from = "TRUCKSTREAM_APP_ROUTES", default = "4")]
    pub routes: u32,
    /// Truck events generated per second
    #[envconfig(from = "TRUCKSTREAM_APP_EVENTS_PER_SEC", default = "20")]
    pub events_per_sec: u32,
    /// Stop after this many seconds, run until Ctrl-C if unset
    #[envconfig(from = "TRUCKSTREAM_APP_RUN_SECS")]
    pub run_secs: Option<u64>,
    /// Make the sinks signal backpressure every this many seconds
    #[envconfig(from = "TRUCKSTREAM_APP_STALL_EVERY_SECS")]
    pub stall_every_secs: Option<u64>,
    /// How long a simulated stall lasts
    #[envconfig(from = "TRUCKSTREAM_APP_STALL_MS", default = "500")]
    pub stall_ms: u64,
}

impl AppConfig {
    pub fn run_for(&self) -> Option<Duration> {
        self.run_secs.map(Duration::from_secs)
    }

    /// Interval between two generated batches of events
    pub fn emit_interval(&self) -> Duration {
        Duration::from_secs(1) / self.events_per_sec.max(1)
    }

    pub fn stall_every(&self) -> Option<Duration> {
        self.stall_every_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }
}
