mod influx;
mod postgres;

use std::{fmt, future::Future, time::Duration};

use anyhow::{Context as _, Result, anyhow};
use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::measurement::Measurement;

pub use influx::*;
pub use postgres::*;

/// How a failed delivery should be treated by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The store answered but reported an internal failure.
    Server,

    /// The store could not be reached, or the connection broke mid-request.
    Connection,

    /// Anything else, usually a batch the store refuses to accept.
    Other,
}

#[derive(Debug, Error)]
#[error("{kind:?} error: {message}")]
pub struct StoreError {
    pub kind: FailureKind,

    pub message: String,
}

impl StoreError {
    pub fn new(kind: FailureKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }

    pub fn server(message: impl fmt::Display) -> Self {
        Self::new(FailureKind::Server, message)
    }

    pub fn connection(message: impl fmt::Display) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    pub fn other(message: impl fmt::Display) -> Self {
        Self::new(FailureKind::Other, message)
    }
}

/// A time-series store the reporter delivers batches to.
pub trait Store: Send {
    /// Writes the whole batch in one request.
    ///
    /// `Ok(false)` means the store answered without acknowledging the write.
    fn write(
        &mut self,
        batch: &[Measurement],
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Drops the current connection and opens a fresh one.
    fn reconnect(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn create_database(&mut self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Influx,

    Postgres,
}

impl StoreBackend {
    pub fn default_port(&self) -> u16 {
        match self {
            StoreBackend::Influx => 8086,
            StoreBackend::Postgres => 5432,
        }
    }
}

/// Where and how to reach the store: `[user[:password]@]host[:port]`.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,

    pub port: Option<u16>,

    pub username: Option<String>,

    pub password: Option<String>,
}

impl ServerAddress {
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(&format!("tcp://{s}"))
            .with_context(|| format!("invalid server address: {s}"))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow!("server address missing host: {s}"))?
            .to_string();

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(Self {
            host,
            port: url.port(),
            username,
            password,
        })
    }
}

// Never print the password.
impl fmt::Debug for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAddress")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(username) = &self.username {
            write!(f, "{username}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Everything needed to (re)build a store client.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,

    pub server: ServerAddress,

    pub database: String,

    pub timeout: Duration,
}

/// The store client chosen at startup.
pub enum StoreClient {
    Influx(InfluxStore),
    Postgres(PostgresStore),
}

impl StoreClient {
    pub fn connect(settings: &StoreSettings) -> Result<Self> {
        let client = match settings.backend {
            StoreBackend::Influx => StoreClient::Influx(
                InfluxStore::new(settings).context("failed to build InfluxDB client")?,
            ),
            StoreBackend::Postgres => StoreClient::Postgres(
                PostgresStore::new(settings).context("failed to build PostgreSQL client")?,
            ),
        };

        Ok(client)
    }
}

impl Store for StoreClient {
    async fn write(&mut self, batch: &[Measurement]) -> Result<bool, StoreError> {
        match self {
            StoreClient::Influx(store) => store.write(batch).await,
            StoreClient::Postgres(store) => store.write(batch).await,
        }
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        match self {
            StoreClient::Influx(store) => store.reconnect().await,
            StoreClient::Postgres(store) => store.reconnect().await,
        }
    }

    async fn create_database(&mut self) -> Result<(), StoreError> {
        match self {
            StoreClient::Influx(store) => store.create_database().await,
            StoreClient::Postgres(store) => store.create_database().await,
        }
    }

    async fn close(&mut self) {
        match self {
            StoreClient::Influx(store) => store.close().await,
            StoreClient::Postgres(store) => store.close().await,
        }
    }
}
