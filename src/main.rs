use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use hotkeyoor::analyzer;
use hotkeyoor::config;
use hotkeyoor::probe;

/// Redis hot-key observation agent.
#[derive(Parser)]
#[command(name = "hotkeyoor", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the packet-capture probe against a single Redis endpoint.
    Capture(probe::ProbeArgs),

    /// Analyze hot keys for one or more Redis instances and report the result.
    #[command(name = "hotkey_analysis")]
    HotkeyAnalysis {
        /// Base64-encoded JSON observation request. Read from stdin if omitted.
        #[arg(long)]
        payload: Option<String>,

        /// Read the base64 payload from a file instead of stdin.
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("hotkeyoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    match cli.command {
        Command::Capture(args) => {
            // The probe tees diagnostics into its own log file so the
            // analyzer can collect them next to the capture output.
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&args.log_file)
                .with_context(|| format!("opening probe log file {}", args.log_file.display()))?;

            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(log_file))
                .init();

            tracing::info!(version = version::RELEASE, "starting capture probe");

            // The analyzer treats probe exit status 1 as the benign
            // no-traffic condition, so setup failures must use a different
            // code to abort the remaining schedule.
            if let Err(err) = probe::run(&args) {
                tracing::error!(error = format!("{err:#}"), "capture probe failed");
                std::process::exit(2);
            }

            Ok(())
        }

        Command::HotkeyAnalysis {
            payload,
            payload_file,
        } => {
            fmt().with_env_filter(filter).with_target(true).init();

            let raw = match (payload, payload_file) {
                (Some(p), _) => p,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading payload file {}", path.display()))?,
                (None, None) => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading payload from stdin")?;
                    buf
                }
            };

            let request = config::decode_payload(raw.trim())?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                host = %request.host_ip,
                instances = request.instances.len(),
                window_seconds = request.window_seconds,
                "starting hot-key analysis",
            );

            // Build and run the tokio runtime.
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;

            let summary = rt.block_on(analyzer::run(request))?;

            tracing::info!(
                reported = summary.reported.len(),
                failed = summary.failed.len(),
                "hot-key analysis finished",
            );

            Ok(())
        }

        Command::Version => unreachable!("handled above"),
    }
}
