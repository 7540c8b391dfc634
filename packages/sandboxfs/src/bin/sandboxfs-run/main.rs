//! The launcher binary: runs a single command through the sandbox mount and
//! reports what it read and wrote (spec.md §4.2, §6).
//!
//! Syntax: `sandboxfs-run <input-json> <output-json>`

use std::path::PathBuf;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use sandboxfs::{launcher, proto::LauncherInput};
use tracing::{info, instrument};
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sandboxfs-run")]
struct Args {
    /// Path to the command description (spec.md §6 Input schema).
    input: PathBuf,
    /// Path to write the resulting usage/inputs/outputs report to.
    output: PathBuf,
    /// Workspace root to mount the sandbox under. Defaults to the current
    /// directory.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    /// Path to the daemon binary, spawned on demand if not already running.
    #[arg(long, default_value = "sandboxfsd")]
    daemon_binary: PathBuf,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    let args = Args::parse();

    let input_bytes = std::fs::read(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let input: LauncherInput =
        serde_json::from_slice(&input_bytes).context("parse launcher input")?;

    let output = run(&args.workspace, &args.daemon_binary, &input)?;

    let output_bytes = serde_json::to_vec_pretty(&output).context("serialize launcher output")?;
    std::fs::write(&args.output, output_bytes)
        .with_context(|| format!("write {}", args.output.display()))?;

    // The wrapped command's exit status is recorded in the output document
    // (usage.status), not propagated as this process's own: a non-zero exit
    // here means the launcher itself failed to connect/execute/disconnect
    // (spec.md §6), matching the original launcher's unconditional `return
    // 0` regardless of the wrapped command's result.
    Ok(())
}

#[instrument(skip(workspace, daemon_binary, input))]
fn run(
    workspace: &std::path::Path,
    daemon_binary: &std::path::Path,
    input: &LauncherInput,
) -> Result<sandboxfs::proto::LauncherOutput> {
    // The daemon's rootfd is "." as it sees it when spawned: chdir here so
    // that both this process and any daemon it starts agree on the
    // workspace root (spec.md §4.2.1, mirroring the original launcher's
    // `chdir(working_dir)` before connecting).
    std::env::set_current_dir(workspace)
        .with_context(|| format!("chdir {}", workspace.display()))?;

    let conn = launcher::connect(".", daemon_binary, input.visible.clone())
        .context("connect to sandbox daemon")?;
    info!(job_subdir = ?conn.job_mount_subdir(), "connected");

    let execution = launcher::execute(&conn, input).context("run command through sandbox")?;
    let report = launcher::disconnect(&conn).context("disconnect from sandbox daemon")?;

    Ok(launcher::finish(execution, report))
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_env_var(sandboxfs::LOG_ENV)
                        .from_env_lossy(),
                ),
        )
        .try_init();
}
