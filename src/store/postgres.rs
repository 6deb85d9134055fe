use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Postgres,
    migrate::MigrateDatabase as _,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tokio::time::timeout;
use url::Url;

use crate::{
    measurement::Measurement,
    store::{FailureKind, StoreError, StoreSettings},
};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS measurements (
        device_id TEXT NOT NULL,
        measured_at TIMESTAMPTZ NOT NULL,
        temperature_celsius DOUBLE PRECISION NOT NULL,
        humidity_percent DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (device_id, measured_at)
    )
"#;

// Re-delivered measurements after an ambiguous failure are dropped by the
// primary key instead of failing the whole batch.
const BULK_INSERT: &str = r#"
    INSERT INTO measurements (device_id, measured_at, temperature_celsius, humidity_percent)
    SELECT * FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::FLOAT8[], $4::FLOAT8[])
    ON CONFLICT (device_id, measured_at) DO NOTHING
"#;

/// PostgreSQL (or TimescaleDB) store writing into a `measurements` table.
pub struct PostgresStore {
    pool: PgPool,
    options: PgConnectOptions,
    settings: StoreSettings,
}

impl PostgresStore {
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        let options = connect_options(settings);
        let pool = build_pool(&options, settings);

        Ok(Self {
            pool,
            options,
            settings: settings.clone(),
        })
    }

    pub async fn write(&mut self, batch: &[Measurement]) -> Result<bool, StoreError> {
        if batch.is_empty() {
            return Ok(true);
        }

        timeout(self.settings.timeout, bulk_insert_measurements(&self.pool, batch))
            .await
            .map_err(|_| StoreError::connection("timed out writing batch"))??;

        Ok(true)
    }

    pub async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.pool.close().await;
        self.pool = build_pool(&self.options, &self.settings);
        Ok(())
    }

    pub async fn create_database(&mut self) -> Result<(), StoreError> {
        let url = database_url(&self.settings)?;

        let exists = Postgres::database_exists(url.as_str())
            .await
            .map_err(classify)?;
        if !exists {
            Postgres::create_database(url.as_str())
                .await
                .map_err(classify)?;
        }

        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(())
    }

    pub async fn close(&mut self) {
        self.pool.close().await;
    }
}

async fn bulk_insert_measurements(pool: &PgPool, measurements: &[Measurement]) -> Result<(), StoreError> {
    let device_ids: Vec<&str> = measurements.iter().map(|m| m.device_id.as_str()).collect();
    let measured_ats: Vec<DateTime<Utc>> = measurements.iter().map(|m| m.measured_at).collect();
    let temperature_celsiuses: Vec<f64> =
        measurements.iter().map(|m| m.temperature_celsius).collect();
    let humidity_percents: Vec<f64> = measurements.iter().map(|m| m.humidity_percent).collect();

    let mut tx = pool.begin().await.map_err(classify)?;

    sqlx::query(BULK_INSERT)
        .bind(&device_ids)
        .bind(&measured_ats)
        .bind(&temperature_celsiuses)
        .bind(&humidity_percents)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

    tx.commit().await.map_err(classify)?;

    Ok(())
}

fn connect_options(settings: &StoreSettings) -> PgConnectOptions {
    let server = &settings.server;
    let mut options = PgConnectOptions::new()
        .host(&server.host)
        .port(server.port.unwrap_or_else(|| settings.backend.default_port()))
        .database(&settings.database);
    if let Some(username) = &server.username {
        options = options.username(username);
    }
    if let Some(password) = &server.password {
        options = options.password(password);
    }
    options
}

fn build_pool(options: &PgConnectOptions, settings: &StoreSettings) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(settings.timeout)
        .connect_lazy_with(options.clone())
}

fn database_url(settings: &StoreSettings) -> Result<Url, StoreError> {
    let server = &settings.server;
    let port = server.port.unwrap_or_else(|| settings.backend.default_port());
    let mut url = Url::parse(&format!("postgres://{}:{port}/", server.host))
        .map_err(StoreError::other)?;
    url.set_path(&settings.database);
    if let Some(username) = &server.username {
        url.set_username(username)
            .map_err(|_| StoreError::other("invalid username"))?;
    }
    if let Some(password) = &server.password {
        url.set_password(Some(password))
            .map_err(|_| StoreError::other("invalid password"))?;
    }
    Ok(url)
}

fn classify(err: sqlx::Error) -> StoreError {
    let kind = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => FailureKind::Connection,
        sqlx::Error::Protocol(_) => FailureKind::Server,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| sqlstate_kind(&code))
            .unwrap_or(FailureKind::Other),
        _ => FailureKind::Other,
    };
    StoreError::new(kind, err)
}

/// Maps a SQLSTATE to a failure kind by its class (first two characters).
fn sqlstate_kind(code: &str) -> FailureKind {
    match code.get(..2) {
        Some("08") => FailureKind::Connection,
        Some("53" | "57" | "58" | "XX") => FailureKind::Server,
        _ => FailureKind::Other,
    }
}
