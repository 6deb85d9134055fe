use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result, bail, ensure};
use chrono_tz::Tz;
use macaddr::MacAddr6;
use serde::{Deserialize, Deserializer};
use tokio::time::Duration;
use tracing::info;

use crate::{
    sensor::SensorVariant,
    store::{ServerAddress, StoreBackend, StoreSettings},
};

pub const DEFAULT_CONFIG_FILE: &str = "/etc/temps/config.json";

/// One configuration layer: the JSON file or the command line. Unset fields
/// leave the value from the layer below untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub sensor_variant: Option<SensorVariant>,
    pub iteration_limit: Option<u64>,
    pub poll_interval: Option<f64>,
    pub report_interval: Option<f64>,
    pub report_interval_backoff: Option<f64>,
    pub report_interval_max: Option<f64>,
    pub histogram_interval: Option<f64>,
    pub device_id: Option<String>,
    pub database_name: Option<String>,
    pub server_address: Option<String>,
    pub store_backend: Option<StoreBackend>,
    pub store_timeout: Option<f64>,
    pub dry_run: Option<bool>,
    pub create_database_on_start: Option<bool>,
    pub i2c_bus: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_mac_address")]
    pub switchbot_address: Option<MacAddr6>,
    pub timezone: Option<Tz>,
}

// `AA:BB:CC:DD:EE:FF`, the same form the command line accepts.
fn deserialize_mac_address<'de, D>(deserializer: D) -> Result<Option<MacAddr6>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

impl ConfigOverrides {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }
}

/// Merged but not yet validated settings.
#[derive(Debug, Clone)]
struct RawConfig {
    sensor_variant: SensorVariant,
    iteration_limit: u64,
    poll_interval: f64,
    report_interval: f64,
    report_interval_backoff: f64,
    report_interval_max: f64,
    histogram_interval: f64,
    device_id: String,
    database_name: String,
    server_address: String,
    store_backend: StoreBackend,
    store_timeout: f64,
    dry_run: bool,
    create_database_on_start: bool,
    i2c_bus: PathBuf,
    switchbot_address: Option<MacAddr6>,
    timezone: Tz,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            sensor_variant: SensorVariant::Htu21d,
            iteration_limit: 0,
            poll_interval: 1.0,
            report_interval: 1.0,
            report_interval_backoff: 1.2,
            report_interval_max: 300.0,
            histogram_interval: 60.0,
            device_id: default_device_id(),
            database_name: "temps".to_string(),
            server_address: "localhost".to_string(),
            store_backend: StoreBackend::Influx,
            store_timeout: 10.0,
            dry_run: false,
            create_database_on_start: false,
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            switchbot_address: None,
            timezone: Tz::UTC,
        }
    }
}

macro_rules! apply_overrides {
    ($raw:expr, $source:expr, $overrides:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if let Some(value) = $overrides.$field {
                info!("setting from {}: {} → {:?}", $source, stringify!($field), value);
                $raw.$field = value;
            }
        )+
    };
}

impl RawConfig {
    fn apply(&mut self, source: &str, overrides: ConfigOverrides) {
        if let Some(address) = overrides.switchbot_address {
            info!("setting from {source}: switchbot_address → {address}");
            self.switchbot_address = Some(address);
        }

        apply_overrides!(
            self,
            source,
            overrides,
            [
                sensor_variant,
                iteration_limit,
                poll_interval,
                report_interval,
                report_interval_backoff,
                report_interval_max,
                histogram_interval,
                device_id,
                database_name,
                server_address,
                store_backend,
                store_timeout,
                dry_run,
                create_database_on_start,
                i2c_bus,
                timezone,
            ]
        );
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sensor_variant: SensorVariant,

    /// `None` samples forever.
    pub iteration_limit: Option<u64>,

    pub poll_interval: Duration,

    pub report_interval: Duration,

    pub report_interval_backoff: f64,

    pub report_interval_max: Duration,

    pub histogram_interval: Duration,

    pub device_id: String,

    pub database_name: String,

    pub server_address: ServerAddress,

    pub store_backend: StoreBackend,

    pub store_timeout: Duration,

    pub dry_run: bool,

    pub create_database_on_start: bool,

    pub i2c_bus: PathBuf,

    pub switchbot_address: Option<MacAddr6>,

    pub timezone: Tz,
}

impl Config {
    /// Builds the configuration from defaults, then the config file, then the
    /// command line.
    ///
    /// `file` is the path given on the command line, if any; a missing
    /// default file is skipped, a missing explicit one is an error.
    pub fn load(file: Option<&Path>, cli: ConfigOverrides) -> Result<Self> {
        let mut raw = RawConfig::default();

        match file {
            Some(path) => raw.apply(&path.display().to_string(), ConfigOverrides::from_file(path)?),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    raw.apply(DEFAULT_CONFIG_FILE, ConfigOverrides::from_file(path)?);
                }
            }
        }

        raw.apply("command-line", cli);

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self> {
        let poll_interval = seconds("poll_interval", raw.poll_interval)?;
        let report_interval = seconds("report_interval", raw.report_interval)?;
        let report_interval_max = seconds("report_interval_max", raw.report_interval_max)?;
        let histogram_interval = seconds("histogram_interval", raw.histogram_interval)?;
        let store_timeout = seconds("store_timeout", raw.store_timeout)?;

        ensure!(
            !report_interval.is_zero(),
            "report_interval must be greater than zero"
        );
        ensure!(
            !histogram_interval.is_zero(),
            "histogram_interval must be greater than zero"
        );
        ensure!(!store_timeout.is_zero(), "store_timeout must be greater than zero");
        ensure!(
            raw.report_interval_backoff.is_finite() && raw.report_interval_backoff >= 1.0,
            "report_interval_backoff must be at least 1, got {}",
            raw.report_interval_backoff
        );
        ensure!(
            report_interval_max >= report_interval,
            "report_interval_max ({}s) must not be below report_interval ({}s)",
            raw.report_interval_max,
            raw.report_interval
        );

        let device_id = raw.device_id.trim().to_string();
        ensure!(!device_id.is_empty(), "device_id must not be empty");

        let database_name = raw.database_name.trim().to_string();
        ensure!(!database_name.is_empty(), "database_name must not be empty");

        let server_address = ServerAddress::parse(raw.server_address.trim())?;

        if raw.sensor_variant == SensorVariant::SwitchBot && raw.switchbot_address.is_none() {
            bail!("sensor_variant switchbot requires switchbot_address");
        }

        Ok(Self {
            sensor_variant: raw.sensor_variant,
            iteration_limit: (raw.iteration_limit > 0).then_some(raw.iteration_limit),
            poll_interval,
            report_interval,
            report_interval_backoff: raw.report_interval_backoff,
            report_interval_max,
            histogram_interval,
            device_id,
            database_name,
            server_address,
            store_backend: raw.store_backend,
            store_timeout,
            dry_run: raw.dry_run,
            create_database_on_start: raw.create_database_on_start,
            i2c_bus: raw.i2c_bus,
            switchbot_address: raw.switchbot_address,
            timezone: raw.timezone,
        })
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            backend: self.store_backend,
            server: self.server_address.clone(),
            database: self.database_name.clone(),
            timeout: self.store_timeout,
        }
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    ensure!(
        value.is_finite() && value >= 0.0,
        "{key} must be a non-negative number of seconds, got {value}"
    );
    Duration::try_from_secs_f64(value).with_context(|| format!("{key} is out of range: {value}"))
}

fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
