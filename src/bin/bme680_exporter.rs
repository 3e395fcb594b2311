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

use bme680_exporter::http::{http_route, RequestContext};
use bme680_exporter::metrics::{MetricsExposition, MotionMetrics, ReadMetrics, SensorMetrics};
use bme680_exporter::options::SensorOptions;
use bme680_exporter::sampling::{MotionLoop, RecordSink, SamplingLoop};
use bme680_exporter::sensor::{open_motion_pin, Bme680Sensor, SensorSettings};
use clap::{crate_version, Parser};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tracing::{Instrument, Level};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);

/// Expose temperature, humidity, pressure, and gas resistance from a BME680 sensor as
/// Prometheus metrics
///
/// Read a BME680 sensor connected over I2C to a local machine, usually a Raspberry PI,
/// in the background and expose the most recent readings as Prometheus metrics at
/// `/metrics`. Several other metrics are emitted as well to help diagnose failures
/// reading the sensor.
///
/// A motion sensor connected to one of the General Purpose IO pins (GPIO) can be
/// polled as well. The numbering of these pins is based on the Broadcom SOC channel.
#[derive(Debug, Parser)]
#[clap(name = "bme680_exporter", version = crate_version!())]
struct ExporterApplication {
    #[clap(flatten)]
    sensor: SensorOptions,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, bme680_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = ExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let startup = Instant::now();
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

    let sampling = SamplingLoop::new(
        sensor,
        &SensorSettings::default(),
        RecordSink::new(metrics),
        opts.sensor.update_period(),
        read_metrics,
    )
    .unwrap_or_else(|e| {
        tracing::error!(message = "failed to configure sensor", error = %e);
        process::exit(1)
    });

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

    let stop = sampling.stop_handle();
    let sampling_task = tokio::spawn(sampling.run());

    let context = Arc::new(RequestContext::new(MetricsExposition::new(registry)));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(tracing::span!(Level::DEBUG, "bme680_request"))
            }))
        }
    });

    let server = Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "server failed to start", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(
        message = "server started",
        address = %opts.bind,
        sensor_name = %name,
        labels = %labels,
    );

    server
        .serve(service)
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    stop.stop();
    sampling_task.await?;

    tracing::info!(
        message = "server shutdown",
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
