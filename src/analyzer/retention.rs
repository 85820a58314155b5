//! Working-directory retention.
//!
//! The savedir is shared across instances and invocations; file names embed
//! endpoint, timestamp and sequence, so the only cleanup needed is age-based
//! pruning at the start of each run.

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Prefix shared by capture output and probe log files.
const CAPTURE_PREFIX: &str = "capture_";

/// Remove capture files older than `max_age` from `dir`. Returns the number
/// of files removed. Per-file failures are logged and skipped; only a
/// directory read failure is fatal.
pub fn prune(dir: &Path, max_age: Duration) -> Result<usize> {
    let cutoff = SystemTime::now() - max_age;
    let mut removed = 0;

    let entries =
        std::fs::read_dir(dir).with_context(|| format!("reading savedir {}", dir.display()))?;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if !name.starts_with(CAPTURE_PREFIX) {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(file = name, error = %e, "cannot stat capture file");
                continue;
            }
        };

        if modified < cutoff {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(file = name, "pruned expired capture file");
                    removed += 1;
                }
                Err(e) => warn!(file = name, error = %e, "cannot prune capture file"),
            }
        }
    }

    Ok(removed)
}
