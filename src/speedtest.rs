//! Speed measurement via the external speedtest CLI.
//!
//! Server discovery, best-server selection, and the throughput methodology
//! all belong to the Ookla `speedtest` binary; this module spawns it,
//! parses its JSON output, and classifies failures into a closed set of
//! error kinds.

use serde::Deserialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// CLI binary name, resolved via PATH unless overridden.
const DEFAULT_BINARY: &str = "speedtest";

/// Upper bound for a single CLI invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// A speed-test server as reported by the measurement network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: u32,
    pub name: String,
    pub country: String,
}

/// Result of one completed speed test.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Download throughput in bits per second.
    pub download_bps: f64,
    /// Upload throughput in bits per second.
    pub upload_bps: f64,
    /// Idle latency against the selected server in milliseconds.
    pub latency_ms: f64,
    /// The server the test ran against.
    pub server: ServerInfo,
}

impl Measurement {
    pub fn download_mbps(&self) -> f64 {
        self.download_bps / 1_000_000.0
    }

    pub fn upload_mbps(&self) -> f64 {
        self.upload_bps / 1_000_000.0
    }
}

/// Failure kinds surfaced by a measurement attempt.
#[derive(Debug, Error)]
pub enum MeasureError {
    /// The measurement network's configuration could not be fetched. The
    /// daemon cannot make progress without it.
    #[error("failed to get speedtest configuration: {0}")]
    ConfigUnavailable(String),

    /// An explicit server id matched nothing in the server list.
    #[error("no matched servers: {0}")]
    NoMatchedServer(u32),

    /// The candidate server list could not be retrieved.
    #[error("cannot retrieve speedtest server list: {0}")]
    ServerListUnavailable(String),

    /// The supplied server id is not numeric.
    #[error("invalid server id '{0}', must be numeric")]
    InvalidServerId(String),

    /// The test itself failed after setup succeeded.
    #[error("speed test failed: {0}")]
    TestFailed(String),
}

impl MeasureError {
    /// Whether this failure should terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeasureError::ConfigUnavailable(_))
    }
}

/// A measurement capability the daemon can drive.
pub trait Measurer {
    /// Run one measurement, optionally pinned to an explicit server id.
    fn measure(
        &self,
        server: Option<&str>,
    ) -> impl Future<Output = Result<Measurement, MeasureError>> + Send;
}

/// Production measurer wrapping the Ookla speedtest CLI.
#[derive(Debug, Clone)]
pub struct SpeedtestCli {
    binary: PathBuf,
    timeout: Duration,
}

impl Default for SpeedtestCli {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedtestCli {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use an alternate CLI binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Set the timeout for a single CLI invocation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch the candidate server list.
    pub async fn list_servers(&self) -> Result<Vec<ServerInfo>, MeasureError> {
        let args = cli_args(&["--servers"]);
        let output = self
            .run_cli(&args)
            .await
            .map_err(|err| err.classify(Phase::ServerList, &self.binary))?;

        if !output.status.success() {
            return Err(classify_cli_failure(Phase::ServerList, &output));
        }

        parse_server_list(&output.stdout).ok_or_else(|| {
            MeasureError::ServerListUnavailable("CLI output contained no server list".to_string())
        })
    }

    async fn run_test(&self, server_id: Option<u32>) -> Result<Measurement, MeasureError> {
        let mut args = cli_args(&[]);
        if let Some(id) = server_id {
            args.push(format!("--server-id={id}"));
        }

        let output = self
            .run_cli(&args)
            .await
            .map_err(|err| err.classify(Phase::Test, &self.binary))?;

        if !output.status.success() {
            return Err(classify_cli_failure(Phase::Test, &output));
        }

        parse_result(&output.stdout).ok_or_else(|| {
            MeasureError::TestFailed("CLI output contained no result payload".to_string())
        })
    }

    async fn run_cli(&self, args: &[String]) -> Result<CliOutput, CliError> {
        debug!(binary = %self.binary.display(), ?args, "Running speedtest CLI");

        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| CliError::TimedOut(self.timeout.as_secs()))?
            .map_err(CliError::Spawn)?;

        Ok(CliOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Measurer for SpeedtestCli {
    async fn measure(&self, server: Option<&str>) -> Result<Measurement, MeasureError> {
        let server_id = server.map(parse_server_id).transpose()?;

        if let Some(id) = server_id {
            let servers = self.list_servers().await?;
            let selected = select_server(&servers, id)?;
            info!(server = selected.id, name = %selected.name, "Selected server");
        } else {
            debug!("Picking the closest server");
        }

        let result = self.run_test(server_id).await?;
        if server_id.is_none() {
            info!(server = result.server.id, name = %result.server.name, "Selected server");
        }

        Ok(result)
    }
}

/// Captured output of one CLI invocation.
struct CliOutput {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

/// CLI invocation failures independent of its output.
enum CliError {
    Spawn(std::io::Error),
    TimedOut(u64),
}

impl CliError {
    fn classify(self, phase: Phase, binary: &Path) -> MeasureError {
        match self {
            CliError::Spawn(err) => MeasureError::ConfigUnavailable(format!(
                "failed to launch {}: {}",
                binary.display(),
                err
            )),
            CliError::TimedOut(secs) => {
                kind_for_phase(phase, format!("timed out after {secs} seconds"))
            }
        }
    }
}

/// Which CLI call failed; picks the non-fatal error kind.
#[derive(Debug, Clone, Copy)]
enum Phase {
    ServerList,
    Test,
}

fn cli_args(extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--format=json".to_string(),
        "--accept-license".to_string(),
        "--accept-gdpr".to_string(),
    ];
    args.extend(extra.iter().map(|arg| arg.to_string()));
    args
}

fn parse_server_id(raw: &str) -> Result<u32, MeasureError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| MeasureError::InvalidServerId(raw.to_string()))
}

fn select_server(servers: &[ServerInfo], id: u32) -> Result<&ServerInfo, MeasureError> {
    servers
        .iter()
        .find(|server| server.id == id)
        .ok_or(MeasureError::NoMatchedServer(id))
}

fn classify_cli_failure(phase: Phase, output: &CliOutput) -> MeasureError {
    let detail =
        failure_detail(&output.stdout, &output.stderr).unwrap_or_else(|| output.status.to_string());
    kind_for_phase(phase, detail)
}

fn kind_for_phase(phase: Phase, detail: String) -> MeasureError {
    if is_config_failure(&detail) {
        return MeasureError::ConfigUnavailable(detail);
    }
    match phase {
        Phase::ServerList => MeasureError::ServerListUnavailable(detail),
        Phase::Test => MeasureError::TestFailed(detail),
    }
}

/// Extract the most useful error line from CLI output.
///
/// With `--format=json` the CLI reports errors as JSON log events; raw
/// stderr is the fallback for everything else.
fn failure_detail(stdout: &str, stderr: &str) -> Option<String> {
    for line in stdout.lines().chain(stderr.lines()) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if value.get("level").and_then(|level| level.as_str()) == Some("error") {
                if let Some(message) = value.get("message").and_then(|message| message.as_str()) {
                    return Some(message.to_string());
                }
            }
        }
    }

    stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn is_config_failure(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    lower.contains("configuration -") || lower.contains("couldn't resolve host")
}

#[derive(Debug, Deserialize)]
struct ServerListPayload {
    servers: Vec<CliServer>,
}

#[derive(Debug, Deserialize)]
struct CliServer {
    id: u32,
    name: String,
    #[serde(default)]
    country: String,
}

impl From<CliServer> for ServerInfo {
    fn from(server: CliServer) -> Self {
        ServerInfo {
            id: server.id,
            name: server.name,
            country: server.country,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResultPayload {
    ping: PingPayload,
    download: TransferPayload,
    upload: TransferPayload,
    server: CliServer,
}

#[derive(Debug, Deserialize)]
struct PingPayload {
    latency: f64,
}

#[derive(Debug, Deserialize)]
struct TransferPayload {
    /// Bytes per second, as reported by the CLI.
    bandwidth: f64,
}

fn parse_server_list(stdout: &str) -> Option<Vec<ServerInfo>> {
    let to_servers = |payload: ServerListPayload| {
        payload
            .servers
            .into_iter()
            .map(ServerInfo::from)
            .collect::<Vec<_>>()
    };

    for line in stdout.lines() {
        if let Ok(payload) = serde_json::from_str::<ServerListPayload>(line) {
            return Some(to_servers(payload));
        }
    }
    // Some builds pretty-print; try the whole blob.
    serde_json::from_str::<ServerListPayload>(stdout)
        .ok()
        .map(to_servers)
}

fn parse_result(stdout: &str) -> Option<Measurement> {
    let to_measurement = |payload: ResultPayload| Measurement {
        download_bps: payload.download.bandwidth * 8.0,
        upload_bps: payload.upload.bandwidth * 8.0,
        latency_ms: payload.ping.latency,
        server: payload.server.into(),
    };

    for line in stdout.lines() {
        if let Ok(payload) = serde_json::from_str::<ResultPayload>(line) {
            return Some(to_measurement(payload));
        }
    }
    serde_json::from_str::<ResultPayload>(stdout)
        .ok()
        .map(to_measurement)
}
