//! Demo job pushing synthetic truck and traffic events through a truckstream pipeline
//! and logging the joined records and driver statistics.
use std::{sync::Arc, time::Duration};

use envconfig::Envconfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use truckstream::{
    clock::{Clock, SystemClock},
    codec::{RecordEncoder, SchemaRegistry, StaticSchemaRegistry},
    config::PipelineConfig,
    errorhandling::TruckstreamFatal,
    pipeline::{Pipeline, RawEvent},
    sinks::{BackpressureGate, GatedSink, LogSink},
    types::StreamTag,
};

mod config;
mod generator;

use config::AppConfig;
use generator::Generator;

const TRUCK_SCHEMA: u32 = 1;
const TRAFFIC_SCHEMA: u32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let app = AppConfig::init_from_env().truckstream_fatal();
    let pipeline_config = PipelineConfig::from_env().truckstream_fatal();
    info!(?app, ?pipeline_config, "Starting truckstream demo");

    let registry: Arc<dyn SchemaRegistry> = Arc::new(
        StaticSchemaRegistry::new()
            .register(TRUCK_SCHEMA, StreamTag::Truck)
            .register(TRAFFIC_SCHEMA, StreamTag::Traffic),
    );
    let gate = BackpressureGate::new();
    let handle = Pipeline::builder()
        .config(pipeline_config)
        .clock(Arc::new(SystemClock))
        .registry(Arc::clone(&registry))
        .joined_sink(GatedSink::new(gate.clone(), LogSink::new("joined")))
        .stats_sink(GatedSink::new(gate.clone(), LogSink::new("stats")))
        .build()
        .start()
        .truckstream_fatal();

    let generator = tokio::spawn(generate(
        Generator::from_entropy(app.drivers, app.routes),
        RecordEncoder::new(registry),
        handle.sender(),
        app.emit_interval(),
    ));
    let stalls = app
        .stall_every()
        .map(|every| tokio::spawn(stall_sinks(gate.clone(), every, app.stall())));

    match app.run_for() {
        Some(run_for) => tokio::select! {
            _ = tokio::time::sleep(run_for) => info!(?run_for, "Run duration elapsed"),
            res = tokio::signal::ctrl_c() => res.truckstream_fatal(),
        },
        None => tokio::signal::ctrl_c().await.truckstream_fatal(),
    }
    info!("Shutting down");

    generator.abort();
    // the generator holds a pipeline sender, it must be gone before the pipeline drains
    let _ = generator.await;
    if let Some(stalls) = stalls {
        stalls.abort();
        let _ = stalls.await;
    }
    gate.open();

    let report = tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .truckstream_fatal()
        .truckstream_fatal();
    info!(?report, "Pipeline drained");
}

/// Encode generated events and push them into the pipeline at a fixed rate
async fn generate(
    mut generator: Generator,
    encoder: RecordEncoder,
    sender: flume::Sender<RawEvent>,
    interval: Duration,
) {
    let clock = SystemClock;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = clock.now();
        for record in generator.next_events(now) {
            let payload = match encoder.encode(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to encode generated record");
                    continue;
                }
            };
            let event = RawEvent {
                tag: record.tag(),
                payload,
                arrival: now,
            };
            if sender.send_async(event).await.is_err() {
                return;
            }
        }
    }
}

/// Periodically close the gate in front of both sinks to exercise backpressure handling
async fn stall_sinks(gate: BackpressureGate, every: Duration, stall: Duration) {
    let mut ticker = tokio::time::interval(every);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!(?stall, "Simulating sink backpressure");
        gate.close();
        tokio::time::sleep(stall).await;
        gate.open();
    }
}
