use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;
use url::Url;

use crate::{
    measurement::Measurement,
    store::{FailureKind, StoreError, StoreSettings},
};

const MEASUREMENT_NAME: &str = "temps";

/// InfluxDB 1.x HTTP API client.
pub struct InfluxStore {
    client: Client,
    write_url: Url,
    query_url: Url,
    settings: StoreSettings,
}

impl InfluxStore {
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        let port = settings
            .server
            .port
            .unwrap_or_else(|| settings.backend.default_port());
        let base = Url::parse(&format!("http://{}:{port}/", settings.server.host))
            .map_err(StoreError::other)?;

        let mut write_url = base.join("write").map_err(StoreError::other)?;
        write_url
            .query_pairs_mut()
            .append_pair("db", &settings.database)
            .append_pair("precision", "u");

        let query_url = base.join("query").map_err(StoreError::other)?;

        Ok(Self {
            client: build_client(settings)?,
            write_url,
            query_url,
            settings: settings.clone(),
        })
    }

    pub async fn write(&mut self, batch: &[Measurement]) -> Result<bool, StoreError> {
        let request = self
            .authenticate(self.client.post(self.write_url.clone()))
            .body(to_line_protocol(batch));

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(true);
        }
        if status.is_success() {
            debug!(%status, "InfluxDB answered without acknowledging the write");
            return Ok(false);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body.trim()))
    }

    pub async fn reconnect(&mut self) -> Result<(), StoreError> {
        // Dropping the old client closes its pooled connections.
        self.client = build_client(&self.settings)?;
        Ok(())
    }

    pub async fn create_database(&mut self) -> Result<(), StoreError> {
        let mut url = self.query_url.clone();
        url.query_pairs_mut().append_pair(
            "q",
            &format!(
                "CREATE DATABASE \"{}\"",
                self.settings.database.replace('"', "\\\"")
            ),
        );

        let response = self
            .authenticate(self.client.post(url))
            .send()
            .await
            .map_err(classify_request_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body.trim()));
        }

        Ok(())
    }

    pub async fn close(&mut self) {}

    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.server.username {
            Some(username) => request.basic_auth(username, self.settings.server.password.as_ref()),
            None => request,
        }
    }
}

fn build_client(settings: &StoreSettings) -> Result<Client, StoreError> {
    Client::builder()
        .timeout(settings.timeout)
        .build()
        .map_err(StoreError::other)
}

fn classify_request_error(err: reqwest::Error) -> StoreError {
    let kind = if err.is_connect() || err.is_timeout() || err.is_request() {
        FailureKind::Connection
    } else {
        FailureKind::Other
    };
    StoreError::new(kind, err)
}

fn classify_status(status: StatusCode, body: &str) -> StoreError {
    let kind = if status.is_server_error() {
        FailureKind::Server
    } else {
        FailureKind::Other
    };
    StoreError::new(kind, format!("HTTP {status}: {body}"))
}

pub fn to_line_protocol(batch: &[Measurement]) -> String {
    let mut body = String::new();
    for m in batch {
        body.push_str(MEASUREMENT_NAME);
        body.push_str(",device=");
        body.push_str(&escape_tag_value(&m.device_id));
        body.push_str(&format!(
            " temp={},humidity={} {}\n",
            m.temperature_celsius,
            m.humidity_percent,
            m.measured_at.timestamp_micros()
        ));
    }
    body
}

fn escape_tag_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
