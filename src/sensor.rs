mod i2c;
mod switchbot;

use std::{future::Future, path::Path};

use anyhow::{Context as _, Result, bail};
use clap::ValueEnum;
use macaddr::MacAddr6;
use serde::Deserialize;
use thiserror::Error;

use crate::measurement::Reading;

pub use i2c::*;
pub use switchbot::*;

/// Anything the sampler can poll for a reading.
pub trait SampleSource: Send {
    fn read(&mut self) -> impl Future<Output = Result<Reading, SensorError>> + Send;
}

/// Read failures. The sampler treats all of them as transient.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: sensor sent 0x{received:02x}, computed 0x{computed:02x}")]
    Checksum { received: u8, computed: u8 },

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    #[error("no Bluetooth adapters found")]
    NoAdapter,

    #[error("no recent advertisement from {0}")]
    NotSeen(MacAddr6),

    #[error("failed to decode SwitchBot advertisement: {0:#}")]
    Decode(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SensorVariant {
    #[default]
    #[serde(alias = "primary")]
    #[value(alias = "primary")]
    Htu21d,

    #[serde(alias = "alternate")]
    #[value(alias = "alternate")]
    Si7021,

    #[serde(alias = "switch-bot")]
    #[value(name = "switchbot")]
    SwitchBot,
}

impl SensorVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorVariant::Htu21d => "HTU21D",
            SensorVariant::Si7021 => "SI7021",
            SensorVariant::SwitchBot => "SwitchBot",
        }
    }
}

/// The concrete sensor chosen at startup.
pub enum Sensor {
    I2c(I2cSensor),
    SwitchBot(SwitchBotSensor),
}

impl Sensor {
    pub async fn open(
        variant: SensorVariant,
        i2c_bus: &Path,
        switchbot_address: Option<MacAddr6>,
    ) -> Result<Self> {
        let sensor = match variant {
            SensorVariant::Htu21d => Sensor::I2c(
                I2cSensor::open(i2c_bus, Chip::Htu21d)
                    .await
                    .with_context(|| format!("failed to open HTU21D on {}", i2c_bus.display()))?,
            ),
            SensorVariant::Si7021 => Sensor::I2c(
                I2cSensor::open(i2c_bus, Chip::Si7021)
                    .await
                    .with_context(|| format!("failed to open SI7021 on {}", i2c_bus.display()))?,
            ),
            SensorVariant::SwitchBot => {
                let Some(address) = switchbot_address else {
                    bail!("SwitchBot sensor requires a device address");
                };
                Sensor::SwitchBot(
                    SwitchBotSensor::open(address)
                        .await
                        .context("failed to start SwitchBot BLE scan")?,
                )
            }
        };

        Ok(sensor)
    }
}

impl SampleSource for Sensor {
    async fn read(&mut self) -> Result<Reading, SensorError> {
        match self {
            Sensor::I2c(sensor) => sensor.read().await,
            Sensor::SwitchBot(sensor) => sensor.read().await,
        }
    }
}
