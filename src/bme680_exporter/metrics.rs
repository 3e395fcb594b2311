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

use crate::sensor::Reading;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task;
use tracing::Instrument;

const ERROR_KIND_LABEL: &str = "kind";

/// Error parsing `key=value` label pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelsError {
    EmptyName(String),
}

impl fmt::Display for LabelsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelsError::EmptyName(pair) => write!(f, "label name missing in pair '{}'", pair),
        }
    }
}

impl Error for LabelsError {}

/// Ordered label names and values applied to every metric emitted for a sensor.
///
/// Labels are fixed once at startup. Every metric created from the same `Labels` shares
/// the same label schema and emits a single series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    pairs: Vec<(String, String)>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, replacing the value of an existing label with the same name.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        match self.pairs.iter_mut().find(|(n, _)| n == name) {
            Some(pair) => pair.1 = value.to_owned(),
            None => self.pairs.push((name.to_owned(), value.to_owned())),
        }

        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.pairs.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn values(&self) -> Vec<&str> {
        self.pairs.iter().map(|(_, v)| v.as_str()).collect()
    }
}

impl FromStr for Labels {
    type Err = LabelsError;

    /// Parse labels from pairs in the form `key1=value1,key2=value2`. Entries without
    /// an `=` are ignored, later entries replace earlier entries with the same name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = Labels::new();

        for pair in s.split(',') {
            if let Some((name, value)) = pair.split_once('=') {
                if name.is_empty() {
                    return Err(LabelsError::EmptyName(pair.to_owned()));
                }

                labels = labels.with(name, value);
            }
        }

        Ok(labels)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }

            write!(f, "{}={}", name, value)?;
        }

        Ok(())
    }
}

/// Name of the label holding the error kind, prefixed with `error_` as many times as
/// needed to avoid colliding with a user supplied label.
fn error_kind_label(names: &[&str]) -> String {
    let mut label = ERROR_KIND_LABEL.to_owned();
    while names.contains(&label.as_str()) {
        label = format!("error_{}", label);
    }

    label
}

/// Create a gauge with the given label names, register it, and return the single
/// series for the given label values.
fn labeled_gauge(registry: &Registry, opts: Opts, labels: &Labels) -> Result<Gauge, prometheus::Error> {
    let vec = GaugeVec::new(opts, &labels.names())?;
    registry.register(Box::new(vec.clone()))?;
    vec.get_metric_with_label_values(&labels.values())
}

/// Create a counter with the given label names, register it, and return the single
/// series for the given label values.
fn labeled_counter(registry: &Registry, opts: Opts, labels: &Labels) -> Result<IntCounter, prometheus::Error> {
    let vec = IntCounterVec::new(opts, &labels.names())?;
    registry.register(Box::new(vec.clone()))?;
    vec.get_metric_with_label_values(&labels.values())
}

/// Collection of Prometheus gauges updated based on sensor readings. All gauges
/// are named `sensor_$NAME_*` and share the same labels.
///
/// Label names and values are bound once here, an invalid sensor name or label
/// schema is an error creating the metrics, never an error recording a reading.
#[derive(Clone)]
pub struct SensorMetrics {
    temperature: Gauge,
    humidity: Gauge,
    pressure: Gauge,
    gas_resistance: Gauge,
}

impl SensorMetrics {
    pub fn new(name: &str, labels: &Labels, registry: &Registry) -> Result<Self, prometheus::Error> {
        let temperature = labeled_gauge(
            registry,
            Opts::new(
                format!("sensor_{}_temperature", name),
                format!("Temperature in celsius of {}", name),
            ),
            labels,
        )?;

        let humidity = labeled_gauge(
            registry,
            Opts::new(
                format!("sensor_{}_humidity", name),
                format!("Relative humidity (0-100) of {}", name),
            ),
            labels,
        )?;

        let pressure = labeled_gauge(
            registry,
            Opts::new(
                format!("sensor_{}_pressure", name),
                format!("Pressure in hectopascals of {}", name),
            ),
            labels,
        )?;

        let gas_resistance = labeled_gauge(
            registry,
            Opts::new(
                format!("sensor_{}_gas_resistance", name),
                format!("Gas sensor resistance in ohms of {}", name),
            ),
            labels,
        )?;

        Ok(Self {
            temperature,
            humidity,
            pressure,
            gas_resistance,
        })
    }

    /// Record a reading. Gas resistance is only updated if the gas heater was stable
    /// when the reading was taken, otherwise the previous value is left in place.
    pub fn observe(&self, reading: &Reading) {
        self.temperature.set(reading.temperature.into());
        self.humidity.set(reading.humidity.into());
        self.pressure.set(reading.pressure.into());

        if reading.heat_stable {
            self.gas_resistance.set(reading.gas_resistance.into());
        } else {
            tracing::warn!(
                message = "gas sensor heater not stable yet, skipping gas resistance",
                gas_resistance = %reading.gas_resistance,
            );
        }
    }
}

/// Collection of Prometheus metrics describing attempts to read a sensor: total
/// number of attempts, failures by type, and the time of the last successful read.
#[derive(Clone)]
pub struct ReadMetrics {
    collections: IntCounter,
    errors: IntCounterVec,
    last_reading: Gauge,
    labels: Labels,
}

impl ReadMetrics {
    pub fn new(name: &str, labels: &Labels, registry: &Registry) -> Result<Self, prometheus::Error> {
        let collections = labeled_counter(
            registry,
            Opts::new(
                format!("sensor_{}_reads_total", name),
                format!("Number of attempted reads of {}", name),
            ),
            labels,
        )?;

        let last_reading = labeled_gauge(
            registry,
            Opts::new(
                format!("sensor_{}_last_read_timestamp", name),
                format!("Timestamp of last successful read of {}", name),
            ),
            labels,
        )?;

        let mut error_names = labels.names();
        let kind_label = error_kind_label(&error_names);
        error_names.push(&kind_label);
        let errors = IntCounterVec::new(
            Opts::new(
                format!("sensor_{}_read_errors_total", name),
                format!("Number of failed reads by type of {}", name),
            ),
            &error_names,
        )?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            collections,
            errors,
            last_reading,
            labels: labels.clone(),
        })
    }

    /// Record an attempt to read the sensor
    pub fn attempt(&self) {
        self.collections.inc();
    }

    /// Record a successful read at the current time
    pub fn success(&self) {
        // If we can't get the number of seconds since the epoch, skip the update
        let _ = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| self.last_reading.set(d.as_secs_f64()));
    }

    /// Record a failed read of the given kind
    pub fn failure(&self, kind: &str) {
        let mut values = self.labels.values();
        values.push(kind);
        self.errors.with_label_values(&values).inc();
    }
}

/// Counter of pulses observed on the motion sensor line, named `sensor_$NAME_motion_total`.
#[derive(Clone)]
pub struct MotionMetrics {
    pulses: IntCounter,
}

impl MotionMetrics {
    pub fn new(name: &str, labels: &Labels, registry: &Registry) -> Result<Self, prometheus::Error> {
        let pulses = labeled_counter(
            registry,
            Opts::new(
                format!("sensor_{}_motion_total", name),
                format!("Number of motion pulses observed by {}", name),
            ),
            labels,
        )?;

        Ok(Self { pulses })
    }

    pub fn observe(&self, pulses: u64) {
        self.pulses.inc_by(pulses);
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub enum ExpositionError {
    Runtime(&'static str, Box<dyn Error + Send + Sync + 'static>),
    Encoding(&'static str, Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Runtime(msg, ref e) => write!(f, "{}: {}", msg, e),
            ExpositionError::Encoding(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Runtime(_, ref e) => Some(e.as_ref()),
            ExpositionError::Encoding(_, ref e) => Some(e.as_ref()),
        }
    }
}

/// Wrapper that exposes metrics from a Prometheus registry in the text exposition format.
///
/// Metrics are gathered in a separate thread managed by the tokio runtime since gathering
/// process metrics reads from `/proc` and would otherwise block the calling future.
#[derive(Debug, Clone)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Collect all metrics from the registry and encode them in the Prometheus text exposition
    /// format, returning an error if metrics couldn't be collected or encoded for some reason.
    pub async fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let registry = self.registry.clone();

        task::spawn_blocking(move || {
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            let encoder = TextEncoder::new();

            tracing::debug!(
                message = "encoding metric families to text exposition format",
                num_metrics = metric_families.len(),
            );

            encoder
                .encode(&metric_families, &mut buffer)
                .map_err(|e| ExpositionError::Encoding("unable to encode Prometheus metrics", Box::new(e)))
                .map(|_| buffer)
        })
        .instrument(tracing::debug_span!("gather_metrics"))
        .await
        .map_err(|e| ExpositionError::Runtime("unable to gather Prometheus metrics", Box::new(e)))?
    }
}
