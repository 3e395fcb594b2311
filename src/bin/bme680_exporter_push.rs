// bme680_exporter - Environmental sensor metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use bme680_exporter::metrics::{MetricsExposition, MotionMetrics, ReadMetrics, SensorMetrics};
use bme680_exporter::options::SensorOptions;
use bme680_exporter::push::{run_until_shutdown, PushClient, PushSink, DEFAULT_PUSH_TIMEOUT_SECS};
use bme680_exporter::sampling::{MotionLoop, SamplingLoop};
use bme680_exporter::sensor::{open_motion_pin, Bme680Sensor, SensorSettings};
use clap::{crate_version, Parser};
use hyper::Uri;
use prometheus::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// Push temperature, humidity, pressure, and gas resistance from a BME680 sensor to a
/// Prometheus Pushgateway
///
/// Read a BME680 sensor connected over I2C to a local machine, usually a Raspberry PI,
/// and push all metrics to a Pushgateway after every successful reading. On shutdown
/// the metrics are deleted from the Pushgateway.
#[derive(Debug, Parser)]
#[clap(name = "bme680_exporter_push", version = crate_version!())]
struct PushApplication {
    #[clap(flatten)]
    sensor: SensorOptions,

    /// Pushgateway URL to push metrics to, including the grouping key. For example
    /// 'http://example:9091/metrics/job/bme680'
    #[clap(short = 's', long)]
    service: Uri,

    /// Give up on a single push or delete request after this many seconds
    #[clap(long, default_value_t = DEFAULT_PUSH_TIMEOUT_SECS)]
    push_timeout_secs: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = PushApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let startup = Instant::now();
    let client = PushClient::new(opts.service.clone(), Duration::from_secs(opts.push_timeout_secs))
        .map(Arc::new)
        .unwrap_or_else(|e| {
            tracing::error!(message = "invalid push service URL", url = %opts.service, error = %e);
            process::exit(1)
        });

    let registry = Registry::new();

    #[cfg(target_os = "linux")]
    registry
        .register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))
        .unwrap_or_else(|e| {
            tracing::error!(message = "failed to register process metrics", error = %e);
            process::exit(1)
        });

    let name = &opts.sensor.sensor_name;
    let labels = &opts.sensor.label;
    let (metrics, read_metrics) = SensorMetrics::new(name, labels, &registry)
        .and_then(|m| ReadMetrics::new(name, labels, &registry).map(|r| (m, r)))
        .unwrap_or_else(|e| {
            tracing::error!(message = "failed to create sensor metrics", sensor_name = %name, labels = %labels, error = %e);
            process::exit(1)
        });

    let sensor = Bme680Sensor::open(opts.sensor.i2c_address).unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize sensor", error = %e);
        process::exit(1)
    });
    tracing::info!(message = "opened sensor", address = sensor.address());

    if let Some(bcm_pin) = opts.sensor.motion_pin {
        let pin = open_motion_pin(bcm_pin).unwrap_or_else(|e| {
            tracing::error!(message = "failed to initialize motion sensor pin", bcm_pin = bcm_pin, error = %e);
            process::exit(1)
        });

        let counter = MotionMetrics::new(name, labels, &registry).unwrap_or_else(|e| {
            tracing::error!(message = "failed to create motion metrics", sensor_name = %name, error = %e);
            process::exit(1)
        });

        tokio::spawn(MotionLoop::new(pin, counter, opts.sensor.sensor_period()).run());
    }

    let sink = PushSink::new(metrics, MetricsExposition::new(registry), client.clone());
    let sampling = SamplingLoop::new(
        sensor,
        &SensorSettings::default(),
        sink,
        opts.sensor.update_period(),
        read_metrics,
    )
    .unwrap_or_else(|e| {
        tracing::error!(message = "failed to configure sensor", error = %e);
        process::exit(1)
    });

    tracing::info!(
        message = "pushing metrics",
        url = %opts.service,
        sensor_name = %name,
        labels = %labels,
    );

    let shutdown = async {
        // Wait for either SIGTERM or SIGINT to shutdown
        tokio::select! {
            _ = sigterm() => {}
            _ = sigint() => {}
        }
    };

    if let Err(e) = run_until_shutdown(sampling, client, shutdown).await {
        tracing::error!(message = "failed to remove metrics from push service", url = %opts.service, error = %e);
        process::exit(1)
    }

    tracing::info!(
        message = "push shutdown",
        runtime_secs = %startup.elapsed().as_secs(),
    );

    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
