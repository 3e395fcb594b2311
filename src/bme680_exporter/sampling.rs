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

use crate::metrics::{MotionMetrics, ReadMetrics, SensorMetrics};
use crate::sensor::{MotionLine, Reading, Sensor, SensorError, SensorSettings};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{self, JoinError};
use tracing::{Instrument, Level};

pub const DEFAULT_SAMPLING_SECS: f64 = 5.0;
pub const DEFAULT_MOTION_SECS: f64 = 0.05;

/// Error returned by a `ReadingSink` that was unable to handle a reading.
pub type SinkError = Box<dyn Error + Send + Sync + 'static>;

/// Destination for successful sensor readings.
///
/// The sampling loop calls `accept` once per successful read and doesn't know what
/// happens to the reading after that: it may only be recorded as metrics or it may
/// also be delivered somewhere else.
pub trait ReadingSink {
    fn accept(&self, reading: Reading) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Sink that only records readings as metrics, to be exposed when scraped.
#[derive(Clone)]
pub struct RecordSink {
    metrics: SensorMetrics,
}

impl RecordSink {
    pub fn new(metrics: SensorMetrics) -> Self {
        Self { metrics }
    }
}

impl ReadingSink for RecordSink {
    async fn accept(&self, reading: Reading) -> Result<(), SinkError> {
        self.metrics.observe(&reading);
        Ok(())
    }
}

/// Cancellation flag for a loop. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the loop stop. The loop finishes its current cycle before exiting.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Failure of a single sampling cycle. None of these stop the sampling loop.
#[derive(Debug)]
pub enum CycleError {
    Read(SensorError),
    Runtime(JoinError),
    Sink(SinkError),
}

impl CycleError {
    /// Value used for the `kind` label of the read errors metric
    pub fn as_label(&self) -> &'static str {
        match self {
            CycleError::Read(e) => e.kind().as_label(),
            CycleError::Runtime(_) => "runtime",
            CycleError::Sink(_) => "delivery",
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Read(e) => write!(f, "unable to read sensor: {}", e),
            CycleError::Runtime(e) => write!(f, "sensor read task failed: {}", e),
            CycleError::Sink(e) => write!(f, "unable to handle reading: {}", e),
        }
    }
}

impl Error for CycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CycleError::Read(e) => Some(e),
            CycleError::Runtime(e) => Some(e),
            CycleError::Sink(e) => Some(e.as_ref()),
        }
    }
}

/// Periodically read a sensor and hand each successful reading to a sink.
///
/// Failures reading the sensor or handling a reading are logged and counted but
/// never end the loop. The only way out of the loop is an explicit stop request
/// via a `StopHandle`, checked once per cycle before reading the sensor.
pub struct SamplingLoop<S, K> {
    sensor: Arc<Mutex<S>>,
    sink: K,
    cadence: Duration,
    metrics: ReadMetrics,
    stop: StopHandle,
}

impl<S, K> SamplingLoop<S, K>
where
    S: Sensor + Send + 'static,
    K: ReadingSink,
{
    /// Configure the sensor with the given settings and create a loop ready to run.
    ///
    /// Configuration is attempted exactly once, an error here means the sensor
    /// cannot be used and the loop is never created.
    pub fn new(
        mut sensor: S,
        settings: &SensorSettings,
        sink: K,
        cadence: Duration,
        metrics: ReadMetrics,
    ) -> Result<Self, SensorError> {
        sensor.configure(settings)?;

        Ok(Self {
            sensor: Arc::new(Mutex::new(sensor)),
            sink,
            cadence,
            metrics,
            stop: StopHandle::new(),
        })
    }

    /// Handle that can be used to stop this loop once it is running
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Read the sensor and sink the reading until stopped, sleeping for the cadence
    /// after every cycle whether it succeeded or not.
    pub async fn run(self) {
        tracing::info!(
            message = "starting sampling loop",
            cadence_secs = self.cadence.as_secs_f64(),
        );

        while !self.stop.is_stopped() {
            if let Err(e) = self.cycle().await {
                self.metrics.failure(e.as_label());
                tracing::error!(
                    message = "sampling cycle failed",
                    kind = e.as_label(),
                    error = %e,
                    details = ?e,
                );
            }

            tokio::time::sleep(self.cadence).await;
        }

        tracing::info!(message = "sampling loop stopped");
    }

    async fn cycle(&self) -> Result<(), CycleError> {
        self.metrics.attempt();
        let sensor = self.sensor.clone();

        // Reading the sensor blocks for the duration of the measurement (hundreds of
        // milliseconds with the gas heater enabled) so run it on the blocking pool.
        let reading = task::spawn_blocking(move || {
            let mut s = sensor.lock().unwrap_or_else(PoisonError::into_inner);
            s.read()
        })
        .instrument(tracing::span!(Level::DEBUG, "sensor_read"))
        .await
        .map_err(CycleError::Runtime)?
        .map_err(CycleError::Read)?;

        self.metrics.success();
        self.sink.accept(reading).await.map_err(CycleError::Sink)
    }
}

/// Periodically read a motion sensor line and add the pulses seen to a counter.
///
/// There is no way to stop this loop, it runs until the process exits.
pub struct MotionLoop<M> {
    line: M,
    counter: MotionMetrics,
    cadence: Duration,
}

impl<M> MotionLoop<M>
where
    M: MotionLine,
{
    pub fn new(line: M, counter: MotionMetrics, cadence: Duration) -> Self {
        Self { line, counter, cadence }
    }

    pub async fn run(mut self) {
        tracing::info!(
            message = "starting motion loop",
            pin = self.line.pin(),
            cadence_secs = self.cadence.as_secs_f64(),
        );

        loop {
            tokio::time::sleep(self.cadence).await;
            self.poll();
        }
    }

    /// Read the line once and record any pulses, logging errors.
    fn poll(&mut self) {
        match self.line.read() {
            Ok(pulses) => self.counter.observe(pulses),
            Err(e) => {
                tracing::error!(
                    message = "unable to read motion sensor",
                    pin = self.line.pin(),
                    error = %e,
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CycleError, MotionLoop, ReadingSink, RecordSink, SamplingLoop, SinkError, StopHandle};
    use crate::metrics::{Labels, MotionMetrics, ReadMetrics, SensorMetrics};
    use crate::sensor::test::{eventually, reading, ScriptedMotionLine, ScriptedSensor};
    use crate::sensor::{Reading, SensorError, SensorErrorKind, SensorSettings};
    use prometheus::Registry;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const CADENCE: Duration = Duration::from_millis(1);

    /// Sink that records every reading and fails the first `failures` of them.
    #[derive(Clone, Default)]
    struct CollectingSink {
        readings: Arc<Mutex<Vec<Reading>>>,
        failures: Arc<Mutex<usize>>,
    }

    impl ReadingSink for CollectingSink {
        async fn accept(&self, reading: Reading) -> Result<(), SinkError> {
            self.readings.lock().unwrap().push(reading);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err("simulated sink failure".into());
            }

            Ok(())
        }
    }

    fn gauge_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .map(|mf| mf.get_metric()[0].get_gauge().get_value())
    }

    fn counter_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .map(|mf| mf.get_metric().iter().map(|m| m.get_counter().get_value()).sum())
    }

    fn read_error(kind: SensorErrorKind) -> Result<Reading, SensorError> {
        Err(SensorError::KindMsg(kind, "simulated read failure"))
    }

    #[test]
    fn test_stop_handle_shared() {
        let handle = StopHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_stopped());

        handle.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_cycle_error_labels() {
        let read = CycleError::Read(SensorError::KindMsg(SensorErrorKind::NoData, "nothing"));
        let sink = CycleError::Sink("failed".into());

        assert_eq!("no_data", read.as_label());
        assert_eq!("delivery", sink.as_label());
    }

    #[test]
    fn test_configure_failure_is_fatal() {
        let registry = Registry::new();
        let read_metrics = ReadMetrics::new("test", &Labels::new(), &registry).unwrap();

        let res = SamplingLoop::new(
            ScriptedSensor::failing_configure(),
            &SensorSettings::default(),
            CollectingSink::default(),
            CADENCE,
            read_metrics,
        );

        match res {
            Ok(_) => panic!("expected configuration to fail"),
            Err(e) => assert_eq!(SensorErrorKind::Configuration, e.kind()),
        }
    }

    #[tokio::test]
    async fn test_read_failure_does_not_stop_loop() {
        let registry = Registry::new();
        let labels = Labels::new();
        let metrics = SensorMetrics::new("test", &labels, &registry).unwrap();
        let read_metrics = ReadMetrics::new("test", &labels, &registry).unwrap();
        let sensor = ScriptedSensor::new(vec![read_error(SensorErrorKind::Io), Ok(reading(21.5, true))]);

        let sampling = SamplingLoop::new(
            sensor,
            &SensorSettings::default(),
            RecordSink::new(metrics),
            CADENCE,
            read_metrics,
        )
        .unwrap();
        let stop = sampling.stop_handle();
        let handle = tokio::spawn(sampling.run());

        eventually(|| gauge_value(&registry, "sensor_test_temperature") == Some(21.5)).await;
        stop.stop();
        handle.await.unwrap();

        assert_eq!(Some(21.5), gauge_value(&registry, "sensor_test_temperature"));
        assert_eq!(Some(5000.0), gauge_value(&registry, "sensor_test_gas_resistance"));
        assert!(counter_value(&registry, "sensor_test_read_errors_total").unwrap() >= 1.0);
        assert!(counter_value(&registry, "sensor_test_reads_total").unwrap() >= 2.0);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_loop() {
        let registry = Registry::new();
        let read_metrics = ReadMetrics::new("test", &Labels::new(), &registry).unwrap();
        let sensor = ScriptedSensor::new(vec![Ok(reading(20.0, true)), Ok(reading(21.0, true))]);
        let sink = CollectingSink {
            failures: Arc::new(Mutex::new(1)),
            ..Default::default()
        };
        let readings = sink.readings.clone();

        let sampling =
            SamplingLoop::new(sensor, &SensorSettings::default(), sink, CADENCE, read_metrics).unwrap();
        let stop = sampling.stop_handle();
        let handle = tokio::spawn(sampling.run());

        eventually(|| readings.lock().unwrap().len() == 2).await;
        stop.stop();
        handle.await.unwrap();

        let readings = readings.lock().unwrap();
        assert_eq!(vec![reading(20.0, true), reading(21.0, true)], *readings);
        assert!(counter_value(&registry, "sensor_test_read_errors_total").unwrap() >= 1.0);
    }

    #[tokio::test]
    async fn test_stopped_loop_does_not_read() {
        let registry = Registry::new();
        let read_metrics = ReadMetrics::new("test", &Labels::new(), &registry).unwrap();
        let sensor = ScriptedSensor::new(vec![Ok(reading(20.0, true))]);
        let reads = sensor.reads();

        let sampling = SamplingLoop::new(
            sensor,
            &SensorSettings::default(),
            CollectingSink::default(),
            CADENCE,
            read_metrics,
        )
        .unwrap();
        sampling.stop_handle().stop();
        sampling.run().await;

        assert_eq!(0, *reads.lock().unwrap());
    }

    #[test]
    fn test_motion_loop_sums_pulses() {
        let registry = Registry::new();
        let counter = MotionMetrics::new("test", &Labels::new(), &registry).unwrap();
        let line = ScriptedMotionLine::new(vec![
            Ok(1),
            Ok(0),
            Err(SensorError::KindMsg(SensorErrorKind::Io, "simulated read failure")),
            Ok(1),
            Ok(2),
        ]);

        let mut motion = MotionLoop::new(line, counter, CADENCE);
        let mut previous = 0.0;
        for _ in 0..5 {
            motion.poll();
            let current = counter_value(&registry, "sensor_test_motion_total").unwrap();
            assert!(current >= previous);
            previous = current;
        }

        assert_eq!(4.0, previous);
    }

    #[tokio::test]
    async fn test_motion_loop_runs_in_background() {
        let registry = Registry::new();
        let counter = MotionMetrics::new("test", &Labels::new(), &registry).unwrap();
        let line = ScriptedMotionLine::new(vec![Ok(1), Ok(1), Ok(1)]);

        let handle = tokio::spawn(MotionLoop::new(line, counter, CADENCE).run());
        eventually(|| counter_value(&registry, "sensor_test_motion_total") == Some(3.0)).await;
        handle.abort();
    }
}
