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

//! Export BME680 environmental sensor readings as Prometheus metrics.
//!
//! ## Features
//!
//! `bme680_exporter` reads temperature, humidity, pressure, and gas resistance from a
//! [BME680 sensor](https://www.bosch-sensortec.com/products/environmental-sensors/gas-sensors/bme680/)
//! connected over I2C and exports the values as Prometheus metrics. Optionally, a motion
//! sensor connected to a GPIO pin can be polled as well. It is best run on a Raspberry PI.
//!
//! Metrics can be delivered in two ways:
//!
//! * `bme680_exporter` - Serves metrics over HTTP at `/metrics` to be scraped by Prometheus.
//! * `bme680_exporter_push` - Pushes metrics to a Prometheus Pushgateway after every reading
//!   and removes them from the Pushgateway on shutdown.
//!
//! The following metrics are exported, where `$NAME` is the value of the `--sensor-name`
//! flag. All metrics include the labels given by the `--label` flag.
//!
//! * `sensor_$NAME_temperature` - Degrees celsius measured by the sensor.
//! * `sensor_$NAME_humidity` - Relative humidity (from 0 to 100) measured by the sensor.
//! * `sensor_$NAME_pressure` - Pressure in hectopascals measured by the sensor.
//! * `sensor_$NAME_gas_resistance` - Gas resistance in ohms, only updated once the
//!   sensor heater is stable.
//! * `sensor_$NAME_reads_total` - Total number of attempts to read the sensor.
//! * `sensor_$NAME_read_errors_total` - Total errors by type while reading the sensor.
//! * `sensor_$NAME_last_read_timestamp` - UNIX timestamp of the last successful read.
//! * `sensor_$NAME_motion_total` - Total pulses seen from the motion sensor, only when
//!   the `--motion-pin` flag is used.
//!
//! ## Build
//!
//! `bme680_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/). Since it's meant to be run on a Raspberry PI,
//! you will also likely need to cross-compile it. If you are on Ubuntu GNU/Linux, you'll
//! need the following packages installed for this.
//!
//! ```text
//! apt-get install gcc-arm-linux-gnueabihf musl-tools
//! ```
//!
//! Next, make sure you have a Rust toolchain for ARMv7, assuming you are using `rustup`.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! ```
//!
//! Then build both binaries for ARMv7.
//!
//! ```text
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Install
//!
//! ### I2C
//!
//! The sensor must be connected to the I2C bus of your Raspberry PI and I2C must be
//! enabled (`raspi-config` under "Interface Options"). The sensor is expected at address
//! `0x76` or `0x77`. If the address isn't given with `--i2c-address`, both are tried.
//!
//! ### Run
//!
//! In order to access `/dev/i2c-1` and `/dev/gpiomem`, `bme680_exporter` must run as a
//! user that can read and write those devices (or `root`).
//!
//! ```text
//! bme680_exporter --sensor-name kitchen --label room=kitchen,floor=1
//! ```
//!
//! Or, to push metrics to a Pushgateway instead:
//!
//! ```text
//! bme680_exporter_push --sensor-name kitchen --service http://example:9091/metrics/job/bme680
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `8080` at `/metrics`. Once `bme680_exporter`
//! is running, configure scrapes of it by your Prometheus server. Add the host running
//! `bme680_exporter` as a target under the Prometheus `scrape_configs` section as
//! described by the example below.
//!
//! **NOTE**: The sensor is read every `5s` by default, in the background (*not* in
//! response to Prometheus scrapes).
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! global:
//!   scrape_interval:     1m
//!   evaluation_interval: 1m
//!   external_labels:
//!       monitor: 'my_prom'
//!
//! scrape_configs:
//!   - job_name: bme680
//!     static_configs:
//!       - targets: ['example:8080']
//! ```
//!

pub mod http;
pub mod metrics;
pub mod options;
pub mod push;
pub mod sampling;
pub mod sensor;
