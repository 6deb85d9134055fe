use std::path::PathBuf;

use chrono_tz::Tz;
use clap::Parser;
use macaddr::MacAddr6;
use temps::{config::ConfigOverrides, sensor::SensorVariant, store::StoreBackend};

/// Samples a temperature/humidity sensor and reports the readings to a
/// time-series store in batches.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Number of iterations to run for; 0 runs forever
    pub n: Option<u64>,

    /// Sensor to read from
    #[arg(long, value_enum)]
    pub sensor: Option<SensorVariant>,

    /// Read from an SI7021 sensor (same as --sensor si7021)
    #[arg(long, conflicts_with = "sensor")]
    pub si7: bool,

    /// Config file to read values from [default: /etc/temps/config.json]
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Sleep interval between polls, in seconds
    #[arg(short = 'i', long)]
    pub interval: Option<f64>,

    /// Sleep interval between reporting points to the server, in seconds
    #[arg(short = 'r', long)]
    pub report_interval: Option<f64>,

    /// Factor the report interval grows by after a connection or server error
    #[arg(long)]
    pub report_interval_backoff: Option<f64>,

    /// Upper bound for the report interval, in seconds
    #[arg(long)]
    pub report_interval_max: Option<f64>,

    /// Sleep interval between printing points-per-request histograms, in seconds
    #[arg(long = "hist")]
    pub hist_interval: Option<f64>,

    /// Device ID [default: host name]
    #[arg(short = 'd', long)]
    pub device: Option<String>,

    /// Database to log metrics to
    #[arg(long)]
    pub db: Option<String>,

    /// Server to log metrics to: [user[:password]@]host[:port]
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Kind of store the server runs
    #[arg(long, value_enum)]
    pub store: Option<StoreBackend>,

    /// Timeout for a single store request, in seconds
    #[arg(long)]
    pub store_timeout: Option<f64>,

    /// Only log readings, don't report them to a database
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Create the database (--db) at startup
    #[arg(short = 'c', long)]
    pub create_db: bool,

    /// I2C bus device for the HTU21D/SI7021 sensors
    #[arg(long)]
    pub i2c_bus: Option<PathBuf>,

    /// Bluetooth address of the SwitchBot meter
    #[arg(long)]
    pub switchbot_address: Option<MacAddr6>,

    /// Timezone used when printing readings
    #[arg(long, env = "TEMPS_TIMEZONE")]
    pub timezone: Option<Tz>,
}

impl Args {
    /// Only flags that were actually given override the config file.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            sensor_variant: self
                .sensor
                .or(self.si7.then_some(SensorVariant::Si7021)),
            iteration_limit: self.n,
            poll_interval: self.interval,
            report_interval: self.report_interval,
            report_interval_backoff: self.report_interval_backoff,
            report_interval_max: self.report_interval_max,
            histogram_interval: self.hist_interval,
            device_id: self.device.clone(),
            database_name: self.db.clone(),
            server_address: self.server.clone(),
            store_backend: self.store,
            store_timeout: self.store_timeout,
            dry_run: self.dry_run.then_some(true),
            create_database_on_start: self.create_db.then_some(true),
            i2c_bus: self.i2c_bus.clone(),
            switchbot_address: self.switchbot_address,
            timezone: self.timezone,
        }
    }
}
