use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context as _, Result, anyhow, bail};
use btleplug::{
    api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter},
    platform::{Adapter, Manager},
};
use macaddr::MacAddr6;
use tokio::{
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_stream::StreamExt as _;
use tracing::debug;
use uuid::{Uuid, uuid};

use crate::{measurement::Reading, sensor::SensorError};

// Ref: https://github.com/OpenWonderLabs/SwitchBotAPI-BLE/blob/2bd727ecf7c0898b25ac2df58a4886b5930c9138/README.md?plain=1#L44
const SWITCHBOT_MANUFACTURER_DATA_COMPANY_ID: u16 = 0x0969;

// Ref: https://github.com/OpenWonderLabs/SwitchBotAPI-BLE/blob/2bd727ecf7c0898b25ac2df58a4886b5930c9138/README.md?plain=1#L45
const SWITCHBOT_SERVICE_DATA_UUID: Uuid = uuid!("0000fd3d-0000-1000-8000-00805f9b34fb");

// Meters advertise every few seconds; the adapter keeps the last
// advertisement around long after the device is gone.
const STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Hub2,
    MeterPlus,
    WoIOSensor,
    MeterProCO2,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Hub2 => "Hub 2",
            DeviceType::MeterPlus => "MeterPlus",
            DeviceType::WoIOSensor => "WoIOSensor",
            DeviceType::MeterProCO2 => "MeterPro(CO2)",
        }
    }
}

/// When the device was last heard from.
#[derive(Debug, Clone, Default)]
pub struct LastHeard(Arc<Mutex<Option<Instant>>>);

impl LastHeard {
    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub fn is_fresh(&self, stale_after: Duration) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() <= stale_after)
    }
}

/// A SwitchBot thermo-hygrometer read from its BLE advertisements.
///
/// Each `read` decodes the advertisement the adapter has cached for
/// `address`, as long as the device has been heard from recently.
pub struct SwitchBotSensor {
    adapter: Adapter,
    address: MacAddr6,
    last_heard: LastHeard,
    listener: JoinHandle<()>,
}

impl SwitchBotSensor {
    pub async fn open(address: MacAddr6) -> Result<Self, SensorError> {
        let manager = Manager::new().await?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SensorError::NoAdapter)?;

        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let last_heard = LastHeard::default();
        let listener = tokio::spawn(listen(adapter.clone(), events, address, last_heard.clone()));

        Ok(Self {
            adapter,
            address,
            last_heard,
            listener,
        })
    }

    pub async fn read(&mut self) -> Result<Reading, SensorError> {
        if !self.last_heard.is_fresh(STALE_AFTER) {
            return Err(SensorError::NotSeen(self.address));
        }

        for peripheral in self.adapter.peripherals().await? {
            let mac_address: MacAddr6 = peripheral.address().into_inner().into();
            if mac_address != self.address {
                continue;
            }

            let Some(properties) = peripheral.properties().await? else {
                break;
            };

            return decode_ble_data(&properties.manufacturer_data, &properties.service_data)
                .map_err(SensorError::Decode);
        }

        Err(SensorError::NotSeen(self.address))
    }
}

impl Drop for SwitchBotSensor {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen<S>(adapter: Adapter, mut events: S, address: MacAddr6, last_heard: LastHeard)
where
    S: tokio_stream::Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        let id = match &event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. } => id,
            _ => continue,
        };

        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(err) => {
                debug!(error = %err, "failed to look up BLE peripheral");
                continue;
            }
        };

        let mac_address: MacAddr6 = peripheral.address().into_inner().into();
        if mac_address == address {
            last_heard.touch();
        }
    }
}

pub fn decode_ble_data(
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    service_data: &HashMap<Uuid, Vec<u8>>,
) -> Result<Reading> {
    let switchbot_service_data = service_data
        .get(&SWITCHBOT_SERVICE_DATA_UUID)
        .ok_or_else(|| anyhow!("SwitchBot service data not found: {SWITCHBOT_SERVICE_DATA_UUID}"))?;

    let device_type = detect_device_type(switchbot_service_data)
        .context("failed to detect SwitchBot device type")?;

    let switchbot_manufacturer_data = manufacturer_data
        .get(&SWITCHBOT_MANUFACTURER_DATA_COMPANY_ID)
        .ok_or_else(|| {
            anyhow!(
                "SwitchBot manufacturer data not found: {SWITCHBOT_MANUFACTURER_DATA_COMPANY_ID}"
            )
        })?;

    decode_manufacturer_data(device_type, switchbot_manufacturer_data)
        .with_context(|| format!("failed to decode {} manufacturer data", device_type.as_str()))
}

pub fn decode_manufacturer_data(device_type: DeviceType, manufacturer_data: &[u8]) -> Result<Reading> {
    // Offset of the two temperature bytes; humidity follows them.
    let (min_len, temperature_offset) = match device_type {
        DeviceType::Hub2 => (17, 13),
        DeviceType::MeterPlus => (11, 8),
        DeviceType::WoIOSensor => (12, 8),
        DeviceType::MeterProCO2 => (16, 8),
    };

    if manufacturer_data.len() < min_len {
        bail!(
            "manufacturer data too short: expected at least {min_len} bytes, got {}",
            manufacturer_data.len()
        )
    }

    let temperature_celsius = decode_temperature([
        manufacturer_data[temperature_offset],
        manufacturer_data[temperature_offset + 1],
    ]);
    let humidity_percent = decode_humidity(manufacturer_data[temperature_offset + 2])
        .context("failed to decode humidity")?;

    Ok(Reading {
        temperature_celsius,
        humidity_percent: f64::from(humidity_percent),
    })
}

fn detect_device_type(service_data: &[u8]) -> Result<DeviceType> {
    let Some(&device_type_raw) = service_data.first() else {
        bail!("SwitchBot service data is empty");
    };

    match device_type_raw {
        0x76 => Ok(DeviceType::Hub2),
        0x69 => Ok(DeviceType::MeterPlus),
        0x77 => Ok(DeviceType::WoIOSensor),
        0x35 => Ok(DeviceType::MeterProCO2),
        v => bail!("unsupported SwitchBot device type: 0x{v:02x}"),
    }
}

fn decode_temperature(v: [u8; 2]) -> f64 {
    let fractional_part = f64::from(v[0] & 0x0f);
    let integral_part = f64::from(v[1] & 0x7f);
    let above_zero = v[1] & 0x80 != 0;

    let magnitude = integral_part + fractional_part / 10.0;
    if above_zero { magnitude } else { -magnitude }
}

fn decode_humidity(v: u8) -> Result<u8> {
    let humidity = v & 0x7f;
    if humidity > 100 {
        bail!("humidity out of range: expected 0-100, got {humidity}");
    }

    Ok(humidity)
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn device_goes_stale_without_advertisements() {
        let last_heard = LastHeard::default();
        assert!(!last_heard.is_fresh(STALE_AFTER));

        last_heard.touch();
        assert!(last_heard.is_fresh(STALE_AFTER));

        advance(STALE_AFTER + Duration::from_secs(1)).await;
        assert!(!last_heard.is_fresh(STALE_AFTER));

        last_heard.touch();
        assert!(last_heard.is_fresh(STALE_AFTER));
    }

    fn meter_plus_payload(temperature: [u8; 2], humidity: u8) -> Vec<u8> {
        let mut data = vec![0u8; 11];
        data[8] = temperature[0];
        data[9] = temperature[1];
        data[10] = humidity;
        data
    }

    #[test]
    fn decodes_meter_plus_advertisement() {
        let manufacturer_data = HashMap::from([(
            SWITCHBOT_MANUFACTURER_DATA_COMPANY_ID,
            meter_plus_payload([0x04, 0x80 | 21], 55),
        )]);
        let service_data = HashMap::from([(SWITCHBOT_SERVICE_DATA_UUID, vec![0x69, 0x00])]);

        let reading = decode_ble_data(&manufacturer_data, &service_data).unwrap();
        assert!((reading.temperature_celsius - 21.4).abs() < 1e-9);
        assert_eq!(reading.humidity_percent, 55.0);
    }

    #[test]
    fn decodes_below_zero_temperature() {
        let mut data = meter_plus_payload([0x05, 3], 80);
        data.push(0);

        let reading = decode_manufacturer_data(DeviceType::WoIOSensor, &data).unwrap();
        assert!((reading.temperature_celsius + 3.5).abs() < 1e-9);
        assert_eq!(reading.humidity_percent, 80.0);
    }

    #[test]
    fn decodes_hub2_offsets() {
        let mut data = vec![0u8; 17];
        data[13] = 0x02;
        data[14] = 0x80 | 19;
        data[15] = 41;

        let reading = decode_manufacturer_data(DeviceType::Hub2, &data).unwrap();
        assert!((reading.temperature_celsius - 19.2).abs() < 1e-9);
        assert_eq!(reading.humidity_percent, 41.0);
    }

    #[test]
    fn rejects_short_payload() {
        let err = decode_manufacturer_data(DeviceType::MeterProCO2, &[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn rejects_out_of_range_humidity() {
        let data = meter_plus_payload([0x00, 0x80 | 20], 101);
        assert!(decode_manufacturer_data(DeviceType::MeterPlus, &data).is_err());
    }

    #[test]
    fn rejects_unknown_device_type() {
        let manufacturer_data = HashMap::from([(
            SWITCHBOT_MANUFACTURER_DATA_COMPANY_ID,
            meter_plus_payload([0x00, 0x80 | 20], 50),
        )]);
        let service_data = HashMap::from([(SWITCHBOT_SERVICE_DATA_UUID, vec![0x48])]);

        let err = decode_ble_data(&manufacturer_data, &service_data).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported SwitchBot device type: 0x48"));
    }

    #[test]
    fn missing_service_data_is_an_error() {
        let err = decode_ble_data(&HashMap::new(), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("service data not found"));
    }
}
