//! Hot-key analysis orchestration.
//!
//! Owns the run lifecycle: workdir preparation, retention pruning, capture
//! device resolution, per-instance fan-out, and the final summary. Instances
//! run in parallel; each one owns its own aggregation state and report.

pub mod error;
pub mod instance;
pub mod retention;
pub mod topk;

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ObservationRequest, RETENTION_DAYS};
use crate::report;

use error::InstanceError;
use instance::{InstanceContext, InstanceOutcome};

/// Final state of the whole run. `failed` entries are soft errors unless
/// every instance failed.
#[derive(Debug)]
pub struct RunSummary {
    pub reported: Vec<InstanceOutcome>,
    pub failed: Vec<(String, InstanceError)>,
}

/// Validate, prepare the working directory, fan out one task per instance,
/// and await them all. Every instance is attempted; an error is returned
/// only when no instance succeeded.
pub async fn run(request: ObservationRequest) -> Result<RunSummary> {
    request.validate()?;

    // Prepare the shared working directory and prune expired captures.
    let savedir = request.savedir();
    std::fs::create_dir_all(&savedir)
        .with_context(|| format!("creating working directory {}", savedir.display()))?;

    let max_age = Duration::from_secs(RETENTION_DAYS * 86400);
    match retention::prune(&savedir, max_age) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "pruned expired capture files"),
        Err(e) => warn!(error = %e, "retention pruning failed"),
    }

    // Resolve the capture interface for the host address.
    let device = resolve_device(&request.host_ip)?;
    info!(host = %request.host_ip, device, "resolved capture device");

    let client = report::Client::new(
        &request.api_base_url,
        &request.api_token,
        request.bk_cloud_id,
    )?;

    // Fan out: one task per instance, joined at the end.
    let mut tasks = JoinSet::new();
    for ins in &request.instances {
        let ctx = InstanceContext::new(
            &request,
            ins.port,
            ins.record_id,
            device.clone(),
            client.clone(),
        );
        let addr = ctx.addr();
        tasks.spawn(async move { (addr, instance::run_instance(ctx).await) });
    }

    let mut summary = RunSummary {
        reported: Vec::new(),
        failed: Vec::new(),
    };

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((addr, Ok(outcome))) => {
                info!(
                    instance = %addr,
                    state = "ReportingSucceeded",
                    keys = outcome.reported_keys,
                    requests = outcome.all_total_count,
                    "instance finished",
                );
                summary.reported.push(outcome);
            }
            Ok((addr, Err(e))) => {
                error!(instance = %addr, state = e.state(), error = %e, "instance failed");
                summary.failed.push((addr, e));
            }
            Err(e) => {
                // Task panic: attribute it to the run, not an instance.
                error!(error = %e, "instance task join failed");
            }
        }
    }

    info!(
        succeeded = summary.reported.len(),
        failed = summary.failed.len(),
        "analysis summary",
    );

    if summary.reported.is_empty() && !summary.failed.is_empty() {
        let joined = summary
            .failed
            .iter()
            .map(|(addr, e)| format!("{addr}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(anyhow!("all instances failed: {joined}"));
    }

    Ok(summary)
}

/// Find the capture device that carries `host_ip`.
fn resolve_device(host_ip: &str) -> Result<String> {
    let devices = pcap::Device::list().context("listing capture devices")?;

    for device in devices {
        if device
            .addresses
            .iter()
            .any(|a| a.addr.to_string() == host_ip)
        {
            return Ok(device.name);
        }
    }

    bail!("no capture interface found for address {host_ip}");
}
