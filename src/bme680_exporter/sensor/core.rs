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

use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;

use rppal::gpio::{Gpio, InputPin};
use rppal::i2c::I2c;

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Relative humidity (from 0 to 100)
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct Humidity(f64);

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0
    }
}

impl From<f64> for Humidity {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Barometric pressure, in hectopascals
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct PressureHectopascals(f64);

impl From<PressureHectopascals> for f64 {
    fn from(v: PressureHectopascals) -> Self {
        v.0
    }
}

impl From<f64> for PressureHectopascals {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for PressureHectopascals {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}hPa", self.0)
    }
}

/// Resistance of the gas sensing element, in ohms
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct GasResistanceOhms(f64);

impl From<GasResistanceOhms> for f64 {
    fn from(v: GasResistanceOhms) -> Self {
        v.0
    }
}

impl From<f64> for GasResistanceOhms {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for GasResistanceOhms {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}ohm", self.0)
    }
}

/// A single measurement taken from the sensor.
///
/// The gas resistance is only meaningful when `heat_stable` is true. Until the heater
/// plate reaches its target temperature, the resistance reported is garbage.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Reading {
    pub temperature: TemperatureCelsius,
    pub humidity: Humidity,
    pub pressure: PressureHectopascals,
    pub gas_resistance: GasResistanceOhms,
    pub heat_stable: bool,
}

/// Oversampling applied to temperature, pressure, or humidity measurements.
///
/// The discriminant of each variant is the value the sensor expects in its
/// control registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Oversampling {
    Skipped = 0,
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    /// Number of measurement cycles performed for this oversampling setting.
    pub fn cycles(&self) -> u32 {
        match self {
            Oversampling::Skipped => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// Coefficient of the IIR filter applied to temperature and pressure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterSize {
    Size0 = 0,
    Size1 = 1,
    Size3 = 2,
    Size7 = 3,
    Size15 = 4,
    Size31 = 5,
    Size63 = 6,
    Size127 = 7,
}

/// Target temperature and duration of the gas sensor heater for a profile slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeaterProfile {
    pub temperature_celsius: u16,
    pub duration: Duration,
    pub slot: u8,
}

/// Measurement settings applied to the sensor once, before sampling begins.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SensorSettings {
    pub humidity_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub temperature_oversampling: Oversampling,
    pub filter: FilterSize,
    pub heater: Option<HeaterProfile>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        SensorSettings {
            humidity_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X4,
            temperature_oversampling: Oversampling::X8,
            filter: FilterSize::Size3,
            heater: Some(HeaterProfile {
                temperature_celsius: 320,
                duration: Duration::from_millis(150),
                slot: 0,
            }),
        }
    }
}

/// Potential kinds of errors that can be encountered using the sensors
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    Configuration,
    Io,
    NoData,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::Configuration => "configuration",
            SensorErrorKind::Io => "io",
            SensorErrorKind::NoData => "no_data",
        }
    }
}

/// Error initializing, configuring, or reading a sensor
#[derive(Debug)]
pub enum SensorError {
    ChipId(u8, u8),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::ChipId(_, _) => SensorErrorKind::Initialization,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::ChipId(expected, got) => {
                write!(f, "unexpected chip ID: expected {:#04x}, got {:#04x}", expected, got)
            }
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Environmental sensor that can be configured once and then read repeatedly.
pub trait Sensor {
    /// Apply oversampling, filtering, and heater settings. Called once before any reads.
    fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError>;

    /// Perform a measurement, blocking until it completes or fails.
    fn read(&mut self) -> Result<Reading, SensorError>;
}

/// Digital line connected to a motion sensor, read as the number of pulses seen.
pub trait MotionLine {
    fn pin(&self) -> u8;
    fn read(&mut self) -> Result<u64, SensorError>;
}

impl MotionLine for InputPin {
    fn pin(&self) -> u8 {
        InputPin::pin(self)
    }

    fn read(&mut self) -> Result<u64, SensorError> {
        Ok(InputPin::is_high(self) as u64)
    }
}

/// Abstraction around register access over an `rppal::i2c::I2c` bus to allow for
/// easier testing.
pub trait RegisterBus {
    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), SensorError>;
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError>;
}

impl RegisterBus for I2c {
    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        I2c::write_read(self, &[start], buf)
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "unable to read registers", Box::new(e)))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        I2c::write(self, &[register, value])
            .map(|_| ())
            .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Io, "unable to write register", Box::new(e)))
    }
}

/// Create a new `I2c` bus handle that talks to the device at the given address.
pub fn open_i2c(address: u16) -> Result<I2c, SensorError> {
    let mut bus = I2c::new().map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to open I2C bus",
            Box::new(e),
        )
    })?;

    bus.set_slave_address(address).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to set I2C device address",
            Box::new(e),
        )
    })?;

    Ok(bus)
}

/// Create a new `InputPin` based on the BCM GPIO pin number of the motion sensor
/// output wire.
///
/// Note that the BCM GPIO pin number is NOT the same as the physical pin number.
/// See [pinout] for more information.
///
/// [pinout]: https://www.raspberrypi.com/documentation/computers/os.html#gpio-and-the-40-pin-header
pub fn open_motion_pin(bcm_gpio_pin: u8) -> Result<InputPin, SensorError> {
    let controller = Gpio::new().map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to create GPIO controller",
            Box::new(e),
        )
    })?;

    let pin = controller.get(bcm_gpio_pin).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to acquire pin from controller",
            Box::new(e),
        )
    })?;

    Ok(pin.into_input())
}
