//! Truckstream joins truck telemetry with road traffic events in tumbling windows and
//! computes sliding per-driver statistics over the joined stream.
pub mod clock;
pub mod codec;
pub mod config;
pub mod errorhandling;
pub mod forwarder;
pub mod join;
pub mod partitioners;
pub mod pipeline;
pub mod sinks;
pub mod stats;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
