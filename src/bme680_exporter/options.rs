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

use crate::metrics::Labels;
use crate::sampling::{DEFAULT_MOTION_SECS, DEFAULT_SAMPLING_SECS};
use clap::Args;
use std::time::Duration;

/// Sensor and sampling flags shared by the pull and push binaries.
#[derive(Debug, Args)]
pub struct SensorOptions {
    /// Read the sensor and update metrics at this interval, in seconds
    #[clap(short = 'u', long, default_value_t = DEFAULT_SAMPLING_SECS, parse(try_from_str = parse_secs))]
    pub update_period: f64,

    /// I2C address of the BME680 sensor, usually '0x76' or '0x77'. If not set, both
    /// addresses are tried in that order
    #[clap(short = 'i', long, parse(try_from_str = parse_i2c_address))]
    pub i2c_address: Option<u16>,

    /// Name of the sensor used in all metric names, like 'home' or 'kitchen'
    #[clap(short = 'n', long)]
    pub sensor_name: String,

    /// Labels added to every metric as key-value pairs, like 'key1=value1,key2=value2'
    #[clap(short = 'l', long, default_value_t)]
    pub label: Labels,

    /// Read the motion sensor at this interval, in seconds
    #[clap(short = 'r', long, default_value_t = DEFAULT_MOTION_SECS, parse(try_from_str = parse_secs))]
    pub sensor_period: f64,

    /// BCM GPIO pin number the motion sensor output is connected to. If not set, motion
    /// is not tracked
    #[clap(long, alias = "port-id")]
    pub motion_pin: Option<u8>,
}

impl SensorOptions {
    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(self.update_period)
    }

    pub fn sensor_period(&self) -> Duration {
        Duration::from_secs_f64(self.sensor_period)
    }
}

/// Parse a positive number of seconds that fits in a `Duration`.
pub fn parse_secs(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|e| format!("invalid number of seconds '{}': {}", s, e))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("period must be a positive number of seconds, got '{}'", s));
    }

    Duration::try_from_secs_f64(secs).map_err(|e| format!("period '{}' is out of range: {}", s, e))?;
    Ok(secs)
}

/// Parse an I2C address written in hex, with or without a leading `0x`.
pub fn parse_i2c_address(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    let address = u16::from_str_radix(digits, 16).map_err(|e| format!("invalid I2C address '{}': {}", s, e))?;
    if address > 0x7F {
        return Err(format!("I2C address '{}' is out of the 7-bit range", s));
    }

    Ok(address)
}
