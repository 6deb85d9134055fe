use chrono::{DateTime, Utc};

/// A single temperature/humidity reading, before it is tagged with a device and time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_celsius: f64,

    pub humidity_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub device_id: String,

    pub measured_at: DateTime<Utc>,

    pub temperature_celsius: f64,

    pub humidity_percent: f64,
}

impl Measurement {
    pub fn new(device_id: impl Into<String>, measured_at: DateTime<Utc>, reading: Reading) -> Self {
        Self {
            device_id: device_id.into(),
            measured_at,
            temperature_celsius: reading.temperature_celsius,
            humidity_percent: reading.humidity_percent,
        }
    }
}
