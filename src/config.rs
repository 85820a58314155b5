use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Deserialize;

/// Maximum duration of a single probe run. Longer observation windows are
/// split into sequential runs of at most this many seconds.
pub const MAX_PROBE_SECS: u64 = 600;

/// Number of hot keys reported per instance.
pub const TOP_K: usize = 20;

/// Capture output files older than this are pruned at the start of each run.
pub const RETENTION_DAYS: u64 = 15;

/// Idle flows are evicted from the probe's reassembly table after this long.
pub const FLOW_IDLE_SECS: u64 = 60;

/// TCP connect timeout for the per-instance liveness preflight.
pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(2);

/// Total report attempts before giving up on the control-plane API.
pub const REPORT_ATTEMPTS: u32 = 5;

/// Sleep between report attempts.
pub const REPORT_BACKOFF: Duration = Duration::from_secs(3);

/// Per-attempt HTTP client timeout for report requests.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lowest observable Redis port.
pub const MIN_PORT: u16 = 6379;

/// Highest observable Redis port.
pub const MAX_PORT: u16 = 55535;

/// A single Redis endpoint to observe. Each port is an independent
/// aggregation with its own report.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceRequest {
    /// Redis port on `host_ip`.
    pub port: u16,

    /// Control-plane record id echoed back in the report.
    pub record_id: i64,
}

/// Observation request: the base64 JSON envelope handed to the
/// `hotkey_analysis` subcommand by the workflow engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservationRequest {
    /// IPv4 address of the interface to capture on.
    pub host_ip: String,

    /// Endpoints to observe; each is aggregated and reported independently.
    pub instances: Vec<InstanceRequest>,

    /// Total observation duration per instance, in seconds.
    pub window_seconds: u64,

    /// Cluster identifier echoed in the report.
    #[serde(default)]
    pub cluster_id: i64,

    /// Ticket identifier echoed in the report.
    #[serde(default)]
    pub ticket_id: i64,

    /// Business identifier echoed in the report.
    #[serde(default)]
    pub biz_id: i64,

    /// Cloud area id injected into the report body.
    #[serde(default)]
    pub bk_cloud_id: i64,

    /// Control-plane API base URL.
    pub api_base_url: String,

    /// Shared bearer token injected into the report body.
    pub api_token: String,

    /// Root under which the `dbbak/hotkey` working directory lives.
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Probe binary override. Defaults to re-invoking the current executable
    /// with the `capture` subcommand.
    #[serde(default)]
    pub probe_bin: Option<PathBuf>,
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/data")
}

impl ObservationRequest {
    /// Validate the request for required fields and consistency. Violations
    /// are process-fatal before any capture begins.
    pub fn validate(&self) -> Result<()> {
        if self.host_ip.is_empty() {
            bail!("host_ip is required");
        }

        self.host_ip
            .parse::<Ipv4Addr>()
            .with_context(|| format!("host_ip is not a valid IPv4 address: {}", self.host_ip))?;

        if self.instances.is_empty() {
            bail!("at least one instance is required");
        }

        for ins in &self.instances {
            if !(MIN_PORT..=MAX_PORT).contains(&ins.port) {
                bail!(
                    "port {} out of range [{MIN_PORT}, {MAX_PORT}]",
                    ins.port
                );
            }
        }

        if self.window_seconds == 0 {
            bail!("window_seconds must be positive");
        }

        if self.api_base_url.is_empty() {
            bail!("api_base_url is required");
        }

        if self.api_token.is_empty() {
            bail!("api_token is required");
        }

        Ok(())
    }

    /// Working directory for capture output and probe logs.
    pub fn savedir(&self) -> PathBuf {
        self.backup_root.join("dbbak").join("hotkey")
    }
}

/// Decode and validate a base64 JSON observation request envelope.
pub fn decode_payload(payload: &str) -> Result<ObservationRequest> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("decoding base64 payload")?;

    let request: ObservationRequest =
        serde_json::from_slice(&raw).context("parsing observation request JSON")?;

    request.validate()?;

    Ok(request)
}
