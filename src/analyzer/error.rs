use std::path::PathBuf;

use thiserror::Error;

use crate::report::ReportError;

/// Per-instance failure taxonomy. Each instance owns its pipeline; a failure
/// here never stops the other instances.
#[derive(Error, Debug)]
pub enum InstanceError {
    /// The TCP liveness preflight failed; the instance is skipped entirely.
    #[error("instance {addr} is down: {reason}")]
    InstanceDown { addr: String, reason: String },

    /// A probe run exited non-zero without the benign condition.
    #[error("probe run {seq} failed: {reason}")]
    ProbeFailed { seq: u32, reason: String },

    /// A scheduled capture output file could not be opened.
    #[error("capture output {path} missing: {source}")]
    OutputMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The control-plane API rejected or never accepted the report.
    #[error(transparent)]
    Report(#[from] ReportError),
}

impl InstanceError {
    /// Final per-instance state name for the summary log line.
    pub fn state(&self) -> &'static str {
        match self {
            InstanceError::InstanceDown { .. } => "InstanceDown",
            InstanceError::ProbeFailed { .. } => "ProbeFailed",
            InstanceError::OutputMissing { .. } => "OutputMissing",
            InstanceError::Report(ReportError::Rejected { .. }) => "ReportingFailed(rejected)",
            InstanceError::Report(ReportError::Unreachable { .. }) => "ReportingFailed(unreachable)",
        }
    }
}
