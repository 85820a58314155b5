//! Per-instance observation pipeline.
//!
//! One task owns the whole pipeline for a single Redis endpoint: liveness
//! preflight, probe run planning, sequential capture runs, record folding,
//! top-K selection and the single report POST. Probe runs are strictly
//! sequential within an instance so the capture device is never bound twice
//! for the same endpoint.

use std::io::BufRead;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ObservationRequest, MAX_PROBE_SECS, PREFLIGHT_TIMEOUT, TOP_K};
use crate::probe::record;
use crate::report::{self, HotKeyInfo};

use super::error::InstanceError;
use super::topk::KeyCounter;

/// Extra wall-clock allowance for a probe beyond its own deadline.
const PROBE_GRACE: Duration = Duration::from_secs(30);

/// Everything one instance task needs, copied out of the request so the task
/// owns its state outright.
pub struct InstanceContext {
    pub host_ip: Ipv4Addr,
    pub port: u16,
    pub record_id: i64,
    pub device: String,
    pub window_seconds: u64,
    pub savedir: PathBuf,
    pub probe_bin: Option<PathBuf>,
    pub ticket_id: i64,
    pub cluster_id: i64,
    pub biz_id: i64,
    pub client: report::Client,
}

impl InstanceContext {
    pub fn new(
        request: &ObservationRequest,
        port: u16,
        record_id: i64,
        device: String,
        client: report::Client,
    ) -> Self {
        Self {
            host_ip: request
                .host_ip
                .parse()
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            port,
            record_id,
            device,
            window_seconds: request.window_seconds,
            savedir: request.savedir(),
            probe_bin: request.probe_bin.clone(),
            ticket_id: request.ticket_id,
            cluster_id: request.cluster_id,
            biz_id: request.biz_id,
            client,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host_ip, self.port)
    }
}

/// Result of a successfully reported (or traffic-free) instance.
#[derive(Debug)]
pub struct InstanceOutcome {
    pub addr: String,
    pub record_id: i64,
    /// Number of hot keys in the delivered report; zero when no traffic was
    /// observed and no report was sent.
    pub reported_keys: usize,
    pub all_total_count: i64,
}

/// Split an observation window into probe run durations. The first `N-1`
/// runs use the maximum; the final run covers the remainder. An exact
/// multiple of the maximum yields a full-length final run.
pub fn plan_runs(window_seconds: u64) -> Vec<u64> {
    let n = window_seconds.div_ceil(MAX_PROBE_SECS).max(1) as usize;

    let mut remainder = window_seconds % MAX_PROBE_SECS;
    if remainder == 0 {
        debug!(window_seconds, "window is an exact multiple, final run uses full duration");
        remainder = MAX_PROBE_SECS.min(window_seconds);
    }

    let mut runs = vec![MAX_PROBE_SECS; n - 1];
    runs.push(remainder);
    runs
}

/// Run the whole pipeline for one instance.
pub async fn run_instance(ctx: InstanceContext) -> Result<InstanceOutcome, InstanceError> {
    let addr = ctx.addr();

    // Preflight: the instance must be accepting TCP connections.
    preflight(&addr).await?;
    debug!(instance = %addr, "preflight passed");

    // Plan the capture runs.
    let plan = plan_runs(ctx.window_seconds);
    info!(
        instance = %addr,
        runs = plan.len(),
        durations = ?plan,
        "capture plan ready",
    );

    // Capture loop: strictly sequential probe runs.
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
    let log_path = ctx
        .savedir
        .join(format!("capture_{}_{}_{}.log", ctx.host_ip, ctx.port, ts));

    let mut outputs = Vec::with_capacity(plan.len());

    for (i, duration) in plan.iter().enumerate() {
        let seq = (i + 1) as u32;
        let output = ctx.savedir.join(format!(
            "capture_result_{}_{}_{}_{}.txt",
            ctx.host_ip, ctx.port, ts, seq
        ));

        info!(instance = %addr, seq, duration_secs = duration, "starting probe run");
        run_probe(&ctx, seq, *duration, &output, &log_path).await?;
        outputs.push(output);
    }

    // Parse and fold every produced file into one aggregation.
    let mut counter = KeyCounter::new();
    for output in &outputs {
        fold_file(output, &mut counter)?;
    }

    info!(
        instance = %addr,
        requests = counter.all_total_count,
        distinct_keys = counter.distinct_keys(),
        "aggregation complete",
    );

    // Top-K selection and report.
    let top = counter.top_k(TOP_K);

    if top.is_empty() {
        info!(instance = %addr, "no traffic observed, skipping report");
        return Ok(InstanceOutcome {
            addr,
            record_id: ctx.record_id,
            reported_keys: 0,
            all_total_count: 0,
        });
    }

    let infos: Vec<HotKeyInfo> = top
        .iter()
        .map(|agg| HotKeyInfo {
            ticket_id: ctx.ticket_id,
            record_id: ctx.record_id,
            bk_biz_id: ctx.biz_id,
            cluster_id: ctx.cluster_id,
            ins: addr.clone(),
            key: agg.key.clone(),
            cmd_info: agg.cmd_info(),
            exec_count: agg.total_count,
            ratio: format_ratio(agg.total_count, counter.all_total_count),
        })
        .collect();

    ctx.client.send(&infos).await?;

    Ok(InstanceOutcome {
        addr,
        record_id: ctx.record_id,
        reported_keys: infos.len(),
        all_total_count: counter.all_total_count,
    })
}

/// Percentage of the instance total, two decimals.
pub fn format_ratio(count: i64, total: i64) -> String {
    if total <= 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", count as f64 / total as f64 * 100.0)
}

/// TCP connect probe with a short timeout.
async fn preflight(addr: &str) -> Result<(), InstanceError> {
    let connect = tokio::net::TcpStream::connect(addr);

    match tokio::time::timeout(PREFLIGHT_TIMEOUT, connect).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(InstanceError::InstanceDown {
            addr: addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(InstanceError::InstanceDown {
            addr: addr.to_string(),
            reason: format!("connect timed out after {PREFLIGHT_TIMEOUT:?}"),
        }),
    }
}

/// Spawn one probe run and wait for it. Exit 0 is success; exit 1 is the
/// historical soft-failure path and keeps the schedule going; anything else
/// aborts the instance.
async fn run_probe(
    ctx: &InstanceContext,
    seq: u32,
    duration: u64,
    output: &Path,
    log: &Path,
) -> Result<(), InstanceError> {
    let mut cmd = match &ctx.probe_bin {
        Some(bin) => Command::new(bin),
        None => {
            let exe = std::env::current_exe().map_err(|e| InstanceError::ProbeFailed {
                seq,
                reason: format!("resolving probe binary: {e}"),
            })?;
            let mut cmd = Command::new(exe);
            cmd.arg("capture");
            cmd
        }
    };

    cmd.arg("--device")
        .arg(&ctx.device)
        .arg("--ip")
        .arg(ctx.host_ip.to_string())
        .arg("--port")
        .arg(ctx.port.to_string())
        .arg("--timeout")
        .arg(duration.to_string())
        .arg("--log-file")
        .arg(log)
        .arg("--output-file")
        .arg(output)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| InstanceError::ProbeFailed {
        seq,
        reason: format!("spawning probe: {e}"),
    })?;

    let grace = Duration::from_secs(duration) + PROBE_GRACE;
    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(InstanceError::ProbeFailed {
                seq,
                reason: format!("waiting for probe: {e}"),
            })
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(InstanceError::ProbeFailed {
                seq,
                reason: format!("probe exceeded its deadline plus {PROBE_GRACE:?} grace"),
            });
        }
    };

    match status.code() {
        Some(0) => Ok(()),
        // Exit 1 is treated as a soft failure and the schedule continues.
        // The predicate is kept from the original tooling even though it can
        // swallow real failures, hence the WARN.
        Some(1) => {
            warn!(
                instance = %ctx.addr(),
                seq,
                "probe exited 1; treating as benign and continuing",
            );
            Ok(())
        }
        Some(code) => Err(InstanceError::ProbeFailed {
            seq,
            reason: format!("probe exited with status {code}"),
        }),
        None => Err(InstanceError::ProbeFailed {
            seq,
            reason: "probe terminated by signal".to_string(),
        }),
    }
}

/// Fold one capture output file into the aggregation. Lines with fewer than
/// the minimum token count are logged and skipped.
pub fn fold_file(path: &Path, counter: &mut KeyCounter) -> Result<(), InstanceError> {
    let file = std::fs::File::open(path).map_err(|source| InstanceError::OutputMissing {
        path: path.to_path_buf(),
        source,
    })?;

    let reader = std::io::BufReader::new(file);

    for (lineno, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(file = %path.display(), lineno, error = %e, "stopping at unreadable line");
                break;
            }
        };

        if line.is_empty() {
            continue;
        }

        match record::parse_line(&line) {
            Some(parsed) => counter.observe(&parsed.command, &parsed.first_arg),
            None => {
                warn!(file = %path.display(), lineno, "skipping malformed record line");
            }
        }
    }

    Ok(())
}
