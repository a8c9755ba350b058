//! InfluxDB v1 metrics sink.
//!
//! Owns the HTTP connection to the store: a startup reachability probe, the
//! point write path, and a self-healing branch for the one recoverable
//! failure (missing database → create it → retry the write once).

use crate::config::InfluxConfig;
use crate::speedtest::Measurement;
use reqwest::{Method, StatusCode};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Request timeout for probe and write calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// One timestamped record on its way to the store. The server assigns the
/// timestamp on receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub measurement: String,
    /// Download throughput in bits per second.
    pub download: f64,
    /// Upload throughput in bits per second.
    pub upload: f64,
    /// Latency in milliseconds.
    pub ping: f64,
    pub server: String,
    pub server_name: String,
    pub server_country: String,
}

impl MetricPoint {
    /// Build the point for one completed measurement.
    pub fn from_measurement(measurement: &str, result: &Measurement) -> Self {
        Self {
            measurement: measurement.to_string(),
            download: result.download_bps,
            upload: result.upload_bps,
            ping: result.latency_ms,
            server: result.server.id.to_string(),
            server_name: result.server.name.clone(),
            server_country: result.server.country.clone(),
        }
    }

    /// Render the point in line protocol.
    pub fn to_line_protocol(&self) -> String {
        format!(
            "{},server={},server_name={},server_country={} download={},upload={},ping={}",
            escape_measurement(&self.measurement),
            escape_tag(&self.server),
            escape_tag(&self.server_name),
            escape_tag(&self.server_country),
            self.download,
            self.upload,
            self.ping,
        )
    }
}

fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Startup connection failures. All of these are fatal.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),

    #[error("unable to connect to InfluxDB at {url}: {source}")]
    Unreachable { url: String, source: reqwest::Error },

    #[error("unable to connect to InfluxDB with provided credentials")]
    BadCredentials,

    #[error("failed to connect to InfluxDB: {0}")]
    Unknown(String),
}

/// Write-path failures. None of these are fatal to the daemon.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The target database is missing even after the self-heal attempt.
    #[error("database {0} does not exist")]
    DatabaseMissing(String),

    #[error("failed to send points to InfluxDB: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("InfluxDB rejected the write (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to create database {database} (HTTP {status}): {body}")]
    CreateFailed {
        database: String,
        status: u16,
        body: String,
    },
}

/// A sink the daemon can hand metric points to.
pub trait MetricSink {
    fn write(&self, points: &[MetricPoint]) -> impl Future<Output = Result<(), WriteError>> + Send;
}

/// Long-lived InfluxDB connection handle.
#[derive(Debug)]
pub struct InfluxSink {
    http: reqwest::Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
}

impl InfluxSink {
    /// Open a connection and verify reachability and credentials with a
    /// lightweight read-only query. There is no retry here; a failure at
    /// startup is fatal to the caller.
    pub async fn connect(config: &InfluxConfig) -> Result<Self, ConnectError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(ConnectError::Client)?;

        let sink = Self {
            http,
            base_url: config.base_url(),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };

        debug!(url = %sink.base_url, "Testing connection to InfluxDB using provided credentials");
        sink.probe().await?;
        debug!("Successful connection to InfluxDB");

        Ok(sink)
    }

    async fn probe(&self) -> Result<(), ConnectError> {
        let response = self
            .request(Method::GET, "/query")
            .query(&[("q", "SHOW USERS")])
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    ConnectError::Unreachable {
                        url: self.base_url.clone(),
                        source: err,
                    }
                } else {
                    ConnectError::Unknown(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ConnectError::BadCredentials)
        } else {
            Err(ConnectError::Unknown(format!(
                "unexpected probe response: HTTP {}",
                status.as_u16()
            )))
        }
    }

    async fn write_raw(&self, body: &str) -> Result<(), WriteError> {
        let response = self
            .request(Method::POST, "/write")
            .query(&[("db", self.database.as_str())])
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(bytes = body.len(), "Data written to InfluxDB");
            return Ok(());
        }

        if status == StatusCode::NOT_FOUND {
            return Err(WriteError::DatabaseMissing(self.database.clone()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn create_database(&self) -> Result<(), WriteError> {
        let statement = format!("CREATE DATABASE \"{}\"", self.database);
        let response = self
            .request(Method::POST, "/query")
            .query(&[("q", statement.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(database = %self.database, "Database created");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(WriteError::CreateFailed {
            database: self.database.clone(),
            status: status.as_u16(),
            body,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if !self.username.is_empty() {
            builder = builder.basic_auth(&self.username, Some(&self.password));
        }
        builder
    }
}

impl MetricSink for InfluxSink {
    /// Write points, creating the target database and retrying exactly once
    /// when the store reports it missing.
    async fn write(&self, points: &[MetricPoint]) -> Result<(), WriteError> {
        let body = points
            .iter()
            .map(MetricPoint::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        match self.write_raw(&body).await {
            Err(WriteError::DatabaseMissing(_)) => {
                error!(database = %self.database, "Database does not exist, attempting to create");
                self.create_database().await?;
                self.write_raw(&body).await
            }
            result => result,
        }
    }
}
