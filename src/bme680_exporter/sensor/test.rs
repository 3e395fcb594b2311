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

#![cfg(test)]

use crate::sensor::bme680::{CHIP_ID, FIELD_LEN, GAS_VALID_MSK, HEAT_STAB_MSK, NEW_DATA_MSK, REG_CHIP_ID};
use crate::sensor::core::{
    GasResistanceOhms, Humidity, MotionLine, PressureHectopascals, Reading, RegisterBus, Sensor, SensorError,
    SensorErrorKind, SensorSettings, TemperatureCelsius,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// RegisterBus implementation backed by an in-memory register map. Clones share the
/// same registers so tests can inspect writes made through a sensor that owns the bus.
#[derive(Clone)]
pub(crate) struct FakeBus {
    registers: Arc<Mutex<[u8; 256]>>,
    fail_reads: Arc<Mutex<bool>>,
}

impl FakeBus {
    pub(crate) fn new() -> Self {
        FakeBus {
            registers: Arc::new(Mutex::new([0; 256])),
            fail_reads: Default::default(),
        }
    }

    /// Bus with the BME680 chip ID set and all calibration data zeroed.
    pub(crate) fn bme680() -> Self {
        let bus = Self::new();
        bus.set(REG_CHIP_ID, CHIP_ID);
        bus
    }

    pub(crate) fn set(&self, register: u8, value: u8) {
        self.registers.lock().unwrap()[register as usize] = value;
    }

    pub(crate) fn set_block(&self, start: u8, values: &[u8]) {
        let mut registers = self.registers.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            registers[start as usize + i] = *v;
        }
    }

    pub(crate) fn get(&self, register: u8) -> u8 {
        self.registers.lock().unwrap()[register as usize]
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().unwrap() = fail;
    }
}

impl RegisterBus for FakeBus {
    fn read_registers(&mut self, start: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        if *self.fail_reads.lock().unwrap() {
            return Err(SensorError::KindMsg(SensorErrorKind::Io, "simulated read failure"));
        }

        let registers = self.registers.lock().unwrap();
        for (i, v) in buf.iter_mut().enumerate() {
            *v = registers[start as usize + i];
        }

        Ok(())
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.set(register, value);
        Ok(())
    }
}

/// Build the contents of the data registers for a completed measurement.
pub(crate) fn field_registers(
    temperature: u32,
    pressure: u32,
    humidity: u16,
    gas: u16,
    gas_range: u8,
    heat_stable: bool,
) -> [u8; FIELD_LEN] {
    let mut regs = [0; FIELD_LEN];
    regs[0] = NEW_DATA_MSK;
    regs[2] = (pressure >> 12) as u8;
    regs[3] = (pressure >> 4) as u8;
    regs[4] = ((pressure & 0x0F) << 4) as u8;
    regs[5] = (temperature >> 12) as u8;
    regs[6] = (temperature >> 4) as u8;
    regs[7] = ((temperature & 0x0F) << 4) as u8;
    regs[8] = (humidity >> 8) as u8;
    regs[9] = humidity as u8;
    regs[13] = (gas >> 2) as u8;
    regs[14] = ((gas & 0x03) << 6) as u8 | GAS_VALID_MSK | (gas_range & 0x0F);
    if heat_stable {
        regs[14] |= HEAT_STAB_MSK;
    }

    regs
}

/// Reading with fixed, easy to recognize values.
pub(crate) fn reading(temperature: f64, heat_stable: bool) -> Reading {
    Reading {
        temperature: TemperatureCelsius::from(temperature),
        humidity: Humidity::from(40.2),
        pressure: PressureHectopascals::from(1012.3),
        gas_resistance: GasResistanceOhms::from(5000.0),
        heat_stable,
    }
}

/// Sensor implementation that returns a scripted sequence of results and then
/// fails every subsequent read with `NoData`.
pub(crate) struct ScriptedSensor {
    results: VecDeque<Result<Reading, SensorError>>,
    fail_configure: bool,
    reads: Arc<Mutex<usize>>,
}

impl ScriptedSensor {
    pub(crate) fn new(results: Vec<Result<Reading, SensorError>>) -> Self {
        ScriptedSensor {
            results: results.into(),
            fail_configure: false,
            reads: Default::default(),
        }
    }

    pub(crate) fn failing_configure() -> Self {
        ScriptedSensor {
            results: VecDeque::new(),
            fail_configure: true,
            reads: Default::default(),
        }
    }

    /// Shared count of reads performed by this sensor.
    pub(crate) fn reads(&self) -> Arc<Mutex<usize>> {
        self.reads.clone()
    }
}

impl Sensor for ScriptedSensor {
    fn configure(&mut self, _settings: &SensorSettings) -> Result<(), SensorError> {
        if self.fail_configure {
            Err(SensorError::KindMsg(
                SensorErrorKind::Configuration,
                "simulated configuration failure",
            ))
        } else {
            Ok(())
        }
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        *self.reads.lock().unwrap() += 1;
        self.results.pop_front().unwrap_or(Err(SensorError::KindMsg(
            SensorErrorKind::NoData,
            "no scripted readings left",
        )))
    }
}

/// MotionLine implementation that returns a scripted sequence of pulse counts and
/// then zero forever.
pub(crate) struct ScriptedMotionLine {
    values: VecDeque<Result<u64, SensorError>>,
}

impl ScriptedMotionLine {
    pub(crate) fn new(values: Vec<Result<u64, SensorError>>) -> Self {
        ScriptedMotionLine { values: values.into() }
    }
}

impl MotionLine for ScriptedMotionLine {
    fn pin(&self) -> u8 {
        0
    }

    fn read(&mut self) -> Result<u64, SensorError> {
        self.values.pop_front().unwrap_or(Ok(0))
    }
}

/// Wait until the condition is true, panicking if it doesn't become true within
/// a few seconds.
pub(crate) async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    panic!("condition not met before timeout");
}
