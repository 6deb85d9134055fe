use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Write as _},
    os::fd::AsRawFd as _,
    path::Path,
};

use tokio::time::{Duration, sleep};

use crate::{measurement::Reading, sensor::SensorError};

// Ref: linux/i2c-dev.h
const I2C_SLAVE: u64 = 0x0703;

// HTU21D and SI7021 share the address and the command set.
const SENSOR_ADDRESS: u16 = 0x40;

const MEASURE_TEMPERATURE_NO_HOLD: u8 = 0xf3;
const MEASURE_HUMIDITY_NO_HOLD: u8 = 0xf5;
const SOFT_RESET: u8 = 0xfe;

const SOFT_RESET_TIME: Duration = Duration::from_millis(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chip {
    Htu21d,
    Si7021,
}

impl Chip {
    /// Worst-case conversion times at full resolution, with some slack.
    fn conversion_times(&self) -> (Duration, Duration) {
        match self {
            Chip::Htu21d => (Duration::from_millis(55), Duration::from_millis(20)),
            Chip::Si7021 => (Duration::from_millis(15), Duration::from_millis(25)),
        }
    }
}

/// A temperature/humidity chip on a Linux i2c-dev bus.
#[derive(Debug)]
pub struct I2cSensor {
    device: File,
    chip: Chip,
}

impl I2cSensor {
    pub async fn open(bus: &Path, chip: Chip) -> Result<Self, SensorError> {
        let device = OpenOptions::new().read(true).write(true).open(bus)?;

        // SAFETY: the fd is owned by `device` and stays open for the call.
        let rc = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(SENSOR_ADDRESS),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut sensor = Self { device, chip };
        sensor.device.write_all(&[SOFT_RESET])?;
        sleep(SOFT_RESET_TIME).await;

        Ok(sensor)
    }

    pub async fn read(&mut self) -> Result<Reading, SensorError> {
        let (temperature_time, humidity_time) = self.chip.conversion_times();

        let raw_temperature = self
            .measure(MEASURE_TEMPERATURE_NO_HOLD, temperature_time)
            .await?;
        let raw_humidity = self
            .measure(MEASURE_HUMIDITY_NO_HOLD, humidity_time)
            .await?;

        Ok(Reading {
            temperature_celsius: temperature_from_raw(raw_temperature),
            humidity_percent: humidity_from_raw(raw_humidity),
        })
    }

    async fn measure(&mut self, command: u8, conversion_time: Duration) -> Result<u16, SensorError> {
        self.device.write_all(&[command])?;
        sleep(conversion_time).await;

        let mut buf = [0u8; 3];
        self.device.read_exact(&mut buf)?;

        let computed = crc8(&buf[..2]);
        if computed != buf[2] {
            return Err(SensorError::Checksum {
                received: buf[2],
                computed,
            });
        }

        // The two low bits carry status, not data.
        Ok(u16::from_be_bytes([buf[0], buf[1]]) & 0xfffc)
    }
}

/// CRC-8 with polynomial x^8 + x^5 + x^4 + 1 and a zero initial value.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

pub fn temperature_from_raw(raw: u16) -> f64 {
    -46.85 + 175.72 * f64::from(raw) / 65536.0
}

pub fn humidity_from_raw(raw: u16) -> f64 {
    (-6.0 + 125.0 * f64::from(raw) / 65536.0).clamp(0.0, 100.0)
}
