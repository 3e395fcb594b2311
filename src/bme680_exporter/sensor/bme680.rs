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

use crate::sensor::core::{
    open_i2c, GasResistanceOhms, HeaterProfile, Humidity, PressureHectopascals, Reading, RegisterBus, Sensor,
    SensorError, SensorErrorKind, SensorSettings, TemperatureCelsius,
};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;

pub const I2C_ADDR_PRIMARY: u16 = 0x76;
pub const I2C_ADDR_SECONDARY: u16 = 0x77;

pub(crate) const CHIP_ID: u8 = 0x61;

pub(crate) const REG_RES_HEAT_VAL: u8 = 0x00;
pub(crate) const REG_RES_HEAT_RANGE: u8 = 0x02;
pub(crate) const REG_RANGE_SW_ERR: u8 = 0x04;
pub(crate) const REG_FIELD_0: u8 = 0x1D;
pub(crate) const REG_RES_HEAT_0: u8 = 0x5A;
pub(crate) const REG_GAS_WAIT_0: u8 = 0x64;
pub(crate) const REG_CTRL_GAS_0: u8 = 0x70;
pub(crate) const REG_CTRL_GAS_1: u8 = 0x71;
pub(crate) const REG_CTRL_HUM: u8 = 0x72;
pub(crate) const REG_CTRL_MEAS: u8 = 0x74;
pub(crate) const REG_CONFIG: u8 = 0x75;
pub(crate) const REG_COEFF_1: u8 = 0x89;
pub(crate) const REG_CHIP_ID: u8 = 0xD0;
pub(crate) const REG_SOFT_RESET: u8 = 0xE0;
pub(crate) const REG_COEFF_2: u8 = 0xE1;

pub(crate) const COEFF_1_LEN: usize = 25;
pub(crate) const COEFF_2_LEN: usize = 16;
pub(crate) const FIELD_LEN: usize = 15;

const SOFT_RESET_CMD: u8 = 0xB6;
const MODE_FORCED: u8 = 0x01;
const RUN_GAS: u8 = 0x10;
const MAX_HEATER_SLOT: u8 = 9;
const MAX_HEATER_TEMPERATURE: u16 = 400;
const AMBIENT_TEMPERATURE: f64 = 25.0;

pub(crate) const NEW_DATA_MSK: u8 = 0x80;
pub(crate) const GAS_VALID_MSK: u8 = 0x20;
pub(crate) const HEAT_STAB_MSK: u8 = 0x10;
const GAS_RANGE_MSK: u8 = 0x0F;

const POLL_ATTEMPTS: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RESET_DELAY: Duration = Duration::from_millis(10);

/// Per-range corrections applied while computing gas resistance, from the Bosch reference driver.
const GAS_RANGE_K1: [f64; 16] = [
    0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, -0.8, 0.0, 0.0, -0.2, -0.5, 0.0, -1.0, 0.0, 0.0,
];
const GAS_RANGE_K2: [f64; 16] = [
    0.0, 0.0, 0.0, 0.0, 0.1, 0.7, 0.0, -0.8, -0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
];

/// Factory calibration parameters stored in the sensor NVM.
///
/// These are read once when the sensor is opened and used to turn raw ADC values
/// into temperature, pressure, humidity, and gas resistance.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Calibration {
    t1: u16,
    t2: i16,
    t3: i8,
    p1: u16,
    p2: i16,
    p3: i8,
    p4: i16,
    p5: i16,
    p6: i8,
    p7: i8,
    p8: i16,
    p9: i16,
    p10: u8,
    h1: u16,
    h2: u16,
    h3: i8,
    h4: i8,
    h5: i8,
    h6: u8,
    h7: i8,
    gh1: i8,
    gh2: i16,
    gh3: i8,
    res_heat_range: u8,
    res_heat_val: i8,
    range_sw_err: i8,
}

impl Calibration {
    /// Parse calibration from the two coefficient blocks (concatenated) and the three
    /// heater related registers.
    fn from_registers(
        coeff: &[u8; COEFF_1_LEN + COEFF_2_LEN],
        res_heat_range: u8,
        res_heat_val: u8,
        range_sw_err: u8,
    ) -> Self {
        let u16_at = |lsb: usize, msb: usize| (coeff[msb] as u16) << 8 | coeff[lsb] as u16;
        let i16_at = |lsb: usize, msb: usize| u16_at(lsb, msb) as i16;

        Calibration {
            t1: u16_at(33, 34),
            t2: i16_at(1, 2),
            t3: coeff[3] as i8,
            p1: u16_at(5, 6),
            p2: i16_at(7, 8),
            p3: coeff[9] as i8,
            p4: i16_at(11, 12),
            p5: i16_at(13, 14),
            p6: coeff[16] as i8,
            p7: coeff[15] as i8,
            p8: i16_at(19, 20),
            p9: i16_at(21, 22),
            p10: coeff[23],
            // Humidity parameters one and two share a byte, each using one nibble
            h1: (coeff[27] as u16) << 4 | (coeff[26] & 0x0F) as u16,
            h2: (coeff[25] as u16) << 4 | (coeff[26] >> 4) as u16,
            h3: coeff[28] as i8,
            h4: coeff[29] as i8,
            h5: coeff[30] as i8,
            h6: coeff[31],
            h7: coeff[32] as i8,
            gh1: coeff[37] as i8,
            gh2: i16_at(35, 36),
            gh3: coeff[38] as i8,
            res_heat_range: (res_heat_range & 0x30) >> 4,
            res_heat_val: res_heat_val as i8,
            range_sw_err: ((range_sw_err & 0xF0) as i8) / 16,
        }
    }

    /// Compute temperature in celsius and the "fine" temperature used by the pressure
    /// and humidity compensation.
    fn temperature(&self, adc: u32) -> (f64, f64) {
        let adc = adc as f64;
        let t1 = self.t1 as f64;

        let var1 = (adc / 16384.0 - t1 / 1024.0) * self.t2 as f64;
        let var2 = (adc / 131072.0 - t1 / 8192.0) * (adc / 131072.0 - t1 / 8192.0) * (self.t3 as f64 * 16.0);
        let t_fine = var1 + var2;

        (t_fine / 5120.0, t_fine)
    }

    /// Compute pressure in pascals
    fn pressure(&self, adc: u32, t_fine: f64) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * (self.p6 as f64 / 131072.0);
        var2 += var1 * self.p5 as f64 * 2.0;
        var2 = var2 / 4.0 + self.p4 as f64 * 65536.0;
        var1 = (self.p3 as f64 * var1 * var1 / 16384.0 + self.p2 as f64 * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * self.p1 as f64;

        // Avoid a division by zero when the calibration data is garbage
        if var1 == 0.0 {
            return 0.0;
        }

        let mut pressure = 1048576.0 - adc as f64;
        pressure = (pressure - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.p9 as f64 * pressure * pressure / 2147483648.0;
        let var2 = pressure * (self.p8 as f64 / 32768.0);
        let var3 = (pressure / 256.0).powi(3) * (self.p10 as f64 / 131072.0);

        pressure + (var1 + var2 + var3 + self.p7 as f64 * 128.0) / 16.0
    }

    /// Compute relative humidity, clamped to 0 - 100
    fn humidity(&self, adc: u16, t_fine: f64) -> f64 {
        let temp = t_fine / 5120.0;

        let var1 = adc as f64 - (self.h1 as f64 * 16.0 + self.h3 as f64 / 2.0 * temp);
        let var2 = var1
            * (self.h2 as f64 / 262144.0
                * (1.0 + self.h4 as f64 / 16384.0 * temp + self.h5 as f64 / 1048576.0 * temp * temp));
        let var3 = self.h6 as f64 / 16384.0;
        let var4 = self.h7 as f64 / 2097152.0;

        (var2 + (var3 + var4 * temp) * var2 * var2).clamp(0.0, 100.0)
    }

    /// Compute gas resistance in ohms
    fn gas_resistance(&self, adc: u16, range: u8) -> f64 {
        let range = (range & GAS_RANGE_MSK) as usize;
        let var1 = 1340.0 + 5.0 * self.range_sw_err as f64;
        let var2 = var1 * (1.0 + GAS_RANGE_K1[range] / 100.0);
        let var3 = 1.0 + GAS_RANGE_K2[range] / 100.0;

        1.0 / (var3 * 0.000000125 * (1u32 << range) as f64 * ((adc as f64 - 512.0) / var2 + 1.0))
    }

    /// Compute the register value for the heater resistance needed to reach the target
    /// temperature, assuming a room temperature ambient.
    fn heater_resistance(&self, target_celsius: u16) -> u8 {
        let target = target_celsius.min(MAX_HEATER_TEMPERATURE) as f64;

        let var1 = self.gh1 as f64 / 16.0 + 49.0;
        let var2 = self.gh2 as f64 / 32768.0 * 0.0005 + 0.00235;
        let var3 = self.gh3 as f64 / 1024.0;
        let var4 = var1 * (1.0 + var2 * target);
        let var5 = var4 + var3 * AMBIENT_TEMPERATURE;

        let res = 3.4
            * (var5 * (4.0 / (4.0 + self.res_heat_range as f64)) * (1.0 / (1.0 + self.res_heat_val as f64 * 0.002))
                - 25.0);

        res.clamp(0.0, u8::MAX as f64) as u8
    }
}

/// Encode a heater duration into the register format: six bits of value and a
/// two bit multiplication factor (1, 4, 16, or 64 milliseconds).
pub(crate) fn heater_duration_code(duration: Duration) -> u8 {
    let mut millis = duration.as_millis();
    if millis >= 0xFC0 {
        return 0xFF;
    }

    let mut factor = 0;
    while millis > 0x3F {
        millis /= 4;
        factor += 1;
    }

    (millis as u8) + factor * 64
}

/// Raw values read from the sensor data registers after a measurement.
#[derive(Debug, PartialEq, Eq)]
struct Fields {
    status: u8,
    temperature: u32,
    pressure: u32,
    humidity: u16,
    gas: u16,
    gas_status: u8,
}

impl Fields {
    fn from_registers(buf: &[u8; FIELD_LEN]) -> Self {
        Fields {
            status: buf[0],
            pressure: (buf[2] as u32) << 12 | (buf[3] as u32) << 4 | (buf[4] as u32) >> 4,
            temperature: (buf[5] as u32) << 12 | (buf[6] as u32) << 4 | (buf[7] as u32) >> 4,
            humidity: (buf[8] as u16) << 8 | buf[9] as u16,
            gas: (buf[13] as u16) << 2 | (buf[14] as u16) >> 6,
            gas_status: buf[14],
        }
    }

    fn has_new_data(&self) -> bool {
        self.status & NEW_DATA_MSK != 0
    }

    fn heat_stable(&self) -> bool {
        self.gas_status & HEAT_STAB_MSK != 0
    }
}

/// True if the error means there is no usable device at an address, as opposed to a
/// different chip answering there.
fn is_missing_device(e: &SensorError) -> bool {
    match e {
        SensorError::ChipId(_, _) => false,
        _ => matches!(e.kind(), SensorErrorKind::Io | SensorErrorKind::Initialization),
    }
}

/// Read temperature, humidity, pressure, and gas resistance from a BME680 sensor
/// using forced mode measurements.
pub struct Bme680Sensor {
    bus: Box<dyn RegisterBus + Send + 'static>,
    address: u16,
    calibration: Calibration,
    settings: Option<SensorSettings>,
}

impl Bme680Sensor {
    /// Open the sensor over I2C. If an address is given, only that address is tried,
    /// otherwise the primary address is tried followed by the secondary address.
    pub fn open(address: Option<u16>) -> Result<Self, SensorError> {
        Self::open_with(address, open_i2c)
    }

    /// Open the sensor using a bus created by `open_bus` for each address tried. The
    /// secondary address is only tried when the primary address fails because the bus
    /// couldn't be opened or read, not when some other device answers there.
    pub(crate) fn open_with<T, F>(address: Option<u16>, mut open_bus: F) -> Result<Self, SensorError>
    where
        T: RegisterBus + Send + 'static,
        F: FnMut(u16) -> Result<T, SensorError>,
    {
        let mut open = |address: u16| open_bus(address).and_then(|bus| Self::from_bus(bus, address));

        if let Some(address) = address {
            return open(address);
        }

        match open(I2C_ADDR_PRIMARY) {
            Err(e) if is_missing_device(&e) => {
                tracing::warn!(
                    message = "unable to open sensor at primary address, trying secondary",
                    primary = I2C_ADDR_PRIMARY,
                    secondary = I2C_ADDR_SECONDARY,
                    error = %e,
                );

                open(I2C_ADDR_SECONDARY)
            }
            res => res,
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Verify the device on the bus is a BME680, reset it, and load its calibration data.
    pub fn from_bus<T>(mut bus: T, address: u16) -> Result<Self, SensorError>
    where
        T: RegisterBus + Send + 'static,
    {
        let mut id = [0; 1];
        bus.read_registers(REG_CHIP_ID, &mut id)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::ChipId(CHIP_ID, id[0]));
        }

        bus.write_register(REG_SOFT_RESET, SOFT_RESET_CMD)?;
        thread::sleep(RESET_DELAY);

        let calibration = Self::read_calibration(&mut bus)?;
        tracing::debug!(message = "loaded sensor calibration", address = address, calibration = ?calibration);

        Ok(Self {
            bus: Box::new(bus),
            address,
            calibration,
            settings: None,
        })
    }

    fn read_calibration<T: RegisterBus>(bus: &mut T) -> Result<Calibration, SensorError> {
        let mut coeff = [0; COEFF_1_LEN + COEFF_2_LEN];
        let (first, second) = coeff.split_at_mut(COEFF_1_LEN);
        bus.read_registers(REG_COEFF_1, first)?;
        bus.read_registers(REG_COEFF_2, second)?;

        let mut heat_range = [0; 1];
        let mut heat_val = [0; 1];
        let mut sw_err = [0; 1];
        bus.read_registers(REG_RES_HEAT_RANGE, &mut heat_range)?;
        bus.read_registers(REG_RES_HEAT_VAL, &mut heat_val)?;
        bus.read_registers(REG_RANGE_SW_ERR, &mut sw_err)?;

        Ok(Calibration::from_registers(&coeff, heat_range[0], heat_val[0], sw_err[0]))
    }

    /// Update some bits of a register while leaving the others untouched.
    fn update_register(&mut self, register: u8, mask: u8, value: u8) -> Result<(), SensorError> {
        let mut current = [0; 1];
        self.bus.read_registers(register, &mut current)?;
        self.bus.write_register(register, (current[0] & !mask) | (value & mask))
    }

    fn ctrl_meas(settings: &SensorSettings) -> u8 {
        (settings.temperature_oversampling as u8) << 5 | (settings.pressure_oversampling as u8) << 2
    }

    fn configure_heater(&mut self, heater: &HeaterProfile) -> Result<(), SensorError> {
        if heater.slot > MAX_HEATER_SLOT {
            return Err(SensorError::KindMsg(
                SensorErrorKind::Configuration,
                "heater profile slot must be between 0 and 9",
            ));
        }

        let resistance = self.calibration.heater_resistance(heater.temperature_celsius);
        let wait = heater_duration_code(heater.duration);

        self.bus.write_register(REG_RES_HEAT_0 + heater.slot, resistance)?;
        self.bus.write_register(REG_GAS_WAIT_0 + heater.slot, wait)?;
        self.bus.write_register(REG_CTRL_GAS_0, 0)?;
        self.bus.write_register(REG_CTRL_GAS_1, RUN_GAS | heater.slot)?;

        tracing::debug!(
            message = "configured gas heater",
            temperature = heater.temperature_celsius,
            duration_ms = heater.duration.as_millis() as u64,
            slot = heater.slot,
            resistance = resistance,
            wait = wait,
        );

        Ok(())
    }

    /// Expected time for a forced mode measurement to complete, including heating
    /// the gas sensor if enabled.
    fn measurement_duration(settings: &SensorSettings) -> Duration {
        let cycles = settings.temperature_oversampling.cycles()
            + settings.pressure_oversampling.cycles()
            + settings.humidity_oversampling.cycles();

        // Durations in microseconds from the Bosch reference driver: per measurement cycle,
        // temperature/pressure/humidity switching, gas measurement, and wake up.
        let micros = cycles * 1963 + 477 * 4 + 477 * 5 + 500;
        let measurement = Duration::from_millis(u64::from(micros / 1000 + 1));

        match settings.heater {
            Some(heater) => measurement + heater.duration,
            None => measurement,
        }
    }

    fn wait_for_fields(&mut self) -> Result<Fields, SensorError> {
        for _ in 0..POLL_ATTEMPTS {
            let mut buf = [0; FIELD_LEN];
            self.bus.read_registers(REG_FIELD_0, &mut buf)?;
            let fields = Fields::from_registers(&buf);
            tracing::trace!(message = "read sensor data registers", fields = ?fields);

            if fields.has_new_data() {
                return Ok(fields);
            }

            thread::sleep(POLL_INTERVAL);
        }

        Err(SensorError::KindMsg(
            SensorErrorKind::NoData,
            "no new data available from sensor",
        ))
    }
}

impl Sensor for Bme680Sensor {
    fn configure(&mut self, settings: &SensorSettings) -> Result<(), SensorError> {
        // Settings may only be changed while the sensor is in sleep mode
        let ctrl_meas = Self::ctrl_meas(settings);
        self.bus.write_register(REG_CTRL_MEAS, ctrl_meas)?;
        self.update_register(REG_CTRL_HUM, 0x07, settings.humidity_oversampling as u8)?;
        self.update_register(REG_CONFIG, 0x1C, (settings.filter as u8) << 2)?;

        match settings.heater {
            Some(ref heater) => self.configure_heater(heater)?,
            None => self.bus.write_register(REG_CTRL_GAS_1, 0)?,
        }

        tracing::info!(
            message = "configured sensor",
            address = self.address,
            humidity_oversampling = ?settings.humidity_oversampling,
            pressure_oversampling = ?settings.pressure_oversampling,
            temperature_oversampling = ?settings.temperature_oversampling,
            filter = ?settings.filter,
            heater = ?settings.heater,
        );

        self.settings = Some(*settings);
        Ok(())
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        let settings = self.settings.ok_or(SensorError::KindMsg(
            SensorErrorKind::Configuration,
            "sensor must be configured before reading",
        ))?;

        self.bus
            .write_register(REG_CTRL_MEAS, Self::ctrl_meas(&settings) | MODE_FORCED)?;
        thread::sleep(Self::measurement_duration(&settings));

        let fields = self.wait_for_fields()?;
        let (temperature, t_fine) = self.calibration.temperature(fields.temperature);
        let pressure = self.calibration.pressure(fields.pressure, t_fine) / 100.0;
        let humidity = self.calibration.humidity(fields.humidity, t_fine);
        let gas_resistance = self
            .calibration
            .gas_resistance(fields.gas, fields.gas_status & GAS_RANGE_MSK);

        let reading = Reading {
            temperature: TemperatureCelsius::from(temperature),
            humidity: Humidity::from(humidity),
            pressure: PressureHectopascals::from(pressure),
            gas_resistance: GasResistanceOhms::from(gas_resistance),
            heat_stable: settings.heater.is_some() && fields.heat_stable(),
        };

        tracing::debug!(
            message = "parsed sensor data",
            raw_temperature = fields.temperature,
            raw_pressure = fields.pressure,
            raw_humidity = fields.humidity,
            raw_gas = fields.gas,
            gas_valid = fields.gas_status & GAS_VALID_MSK != 0,
            temperature = %reading.temperature,
            pressure = %reading.pressure,
            humidity = %reading.humidity,
            gas_resistance = %reading.gas_resistance,
            heat_stable = reading.heat_stable,
        );

        Ok(reading)
    }
}

impl Debug for Bme680Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bme680Sensor").field("address", &self.address).finish()
    }
}
