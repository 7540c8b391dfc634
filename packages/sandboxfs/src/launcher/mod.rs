//! The launcher (C2, spec.md §4.2): connects to a running daemon (spawning
//! one on demand), runs a single command through the mount, and reports what
//! it touched.

use std::{
    fs::File,
    os::fd::{AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use nix::{
    fcntl::{OFlag, open},
    sys::resource::{UsageWho, getrusage},
    sys::stat::Mode,
};
use tracing::{debug, instrument, warn};

use crate::{
    DEFAULT_DAEMON_NAME, DEFAULT_MOUNT_DIR,
    proto::{InputManifest, LauncherInput, LauncherOutput, OutputReport},
};

/// Number of times [`connect`] will fork a fresh daemon attempt before
/// giving up (spec.md §4.2.2).
const MAX_CONNECT_RETRIES: u32 = 12;

/// Initial backoff between connect attempts, doubled after every failure.
const INITIAL_BACKOFF_MS: u64 = 10;

/// A live connection to the daemon for a single job.
pub struct Connection {
    mount_path: PathBuf,
    job_key: String,
    /// Held open for the connection's lifetime; its process-local fd table
    /// entry is what keeps the job alive in the daemon even if this process
    /// is killed mid-build (spec.md §4.1.1, §9). Opened without `O_CLOEXEC`
    /// (via `nix::fcntl::open` rather than `std::fs::File`, which always
    /// sets it): a grandchild that inherits this fd across `exec` keeps the
    /// job alive too, which is the intended behavior for long-running
    /// wrapped tools.
    live_fd: OwnedFd,
}

impl Connection {
    fn visibles_path(&self) -> PathBuf {
        self.mount_path.join(format!(".i.{}", self.job_key))
    }

    fn output_path(&self) -> PathBuf {
        self.mount_path.join(format!(".o.{}", self.job_key))
    }

    /// The directory through which this job's filtered view of the
    /// workspace is visible.
    pub fn job_mount_subdir(&self) -> PathBuf {
        self.mount_path.join(&self.job_key)
    }
}

/// Connect to the daemon rooted at `workspace_root`, spawning one if none is
/// already listening (spec.md §4.2.2). `visible` is consumed into the
/// manifest written to `.i.<job>`.
#[instrument(skip(visible))]
pub fn connect(
    workspace_root: impl AsRef<Path> + std::fmt::Debug,
    daemon_binary: impl AsRef<Path> + std::fmt::Debug,
    visible: Vec<String>,
) -> Result<Connection> {
    let mount_path = workspace_root.as_ref().join(DEFAULT_MOUNT_DIR);
    let marker_path = mount_path.join(format!(".f.{DEFAULT_DAEMON_NAME}"));
    let job_key = std::process::id().to_string();

    let mut wait_ms = INITIAL_BACKOFF_MS;
    let mut attempts = 0;
    while File::open(&marker_path).is_err() {
        if attempts >= MAX_CONNECT_RETRIES {
            bail!("could not contact sandbox daemon at {}", mount_path.display());
        }
        attempts += 1;

        // The daemon should wait at least 4x as long to exit as we wait for
        // it to start, so a burst of short-lived launcher invocations finds
        // the same daemon rather than starting a new one each time.
        let exit_delay = (4 * wait_ms / 1000).max(2);
        let mut cmd = Command::new(daemon_binary.as_ref());
        cmd.arg(&mount_path)
            .arg(exit_delay.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match cmd.spawn() {
            Ok(mut child) => {
                thread::sleep(Duration::from_millis(wait_ms));
                // Reap eagerly: the spawned process double-forks into the
                // background (or exits immediately if a daemon already won
                // the race), so this wait never blocks for the daemon's
                // full lifetime.
                let _ = child.wait();
            }
            Err(err) => warn!(%err, "failed to spawn daemon candidate"),
        }
        wait_ms = wait_ms.saturating_mul(2);
    }

    let live_path = mount_path.join(format!(".l.{job_key}"));
    // std::fs::File always sets O_CLOEXEC; open this one through nix so it
    // is left out, letting the fd survive exec into the wrapped command.
    let live_fd = open(
        &live_path,
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::from_bits_truncate(0o600),
    )
    .with_context(|| format!("open {}", live_path.display()))?;

    let manifest = InputManifest { visible };
    let ijson = serde_json::to_vec(&manifest).context("serialize visible-set manifest")?;
    std::fs::write(mount_path.join(format!(".i.{job_key}")), ijson)
        .with_context(|| format!("write visible-set manifest for job {job_key}"))?;

    debug!(job = job_key, "connected to sandbox daemon");
    Ok(Connection {
        mount_path,
        job_key,
        live_fd,
    })
}

/// Outcome of running the command through the mount.
pub struct Execution {
    pub status: i32,
    pub runtime_secs: f64,
    pub cputime_secs: f64,
    pub membytes: u64,
}

/// Run `input.command` with its current directory and stdin resolved
/// through `conn.job_mount_subdir()` (spec.md §4.2.3). Stdout/stderr are
/// inherited; stdin is redirected from `input.stdin`, or `/dev/null` if
/// empty (SPEC_FULL.md §11 resolves the stdio Open Question this way).
#[instrument(skip(conn, input))]
pub fn execute(conn: &Connection, input: &LauncherInput) -> Result<Execution> {
    let command_dir = conn.job_mount_subdir().join(&input.directory);

    let stdin_file = if input.stdin.is_empty() {
        File::open("/dev/null").context("open /dev/null")?
    } else {
        File::open(command_dir.join(&input.stdin))
            .with_context(|| format!("open stdin file {}", input.stdin))?
    };

    let (program, rest) = input
        .command
        .split_first()
        .context("launcher input command must not be empty")?;

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .current_dir(&command_dir)
        .stdin(Stdio::from(stdin_file))
        .env_clear()
        .envs(parse_environment(&input.environment));

    let start = Instant::now();
    let mut child = cmd.spawn().with_context(|| format!("spawn {program}"))?;

    // Don't hold our own stdio open while we block on the child: if the
    // caller piped a long-lived terminal to us, this launcher process is
    // the only thing still referencing it.
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        unsafe {
            libc::close(fd);
        }
    }

    let exit_status = child.wait().context("wait for child")?;
    let runtime_secs = start.elapsed().as_secs_f64();

    let status = exit_status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            -exit_status.signal().unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            1
        }
    });

    let rusage = getrusage(UsageWho::RUSAGE_CHILDREN).context("getrusage")?;
    let cputime_secs = timeval_secs(rusage.user_time()) + timeval_secs(rusage.system_time());
    let membytes = (rusage.max_rss() as u64) * 1024;

    Ok(Execution {
        status,
        runtime_secs,
        cputime_secs,
        membytes,
    })
}

fn timeval_secs(tv: nix::sys::time::TimeVal) -> f64 {
    tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1_000_000.0
}

fn parse_environment(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Disconnect from the job, retrieving the daemon's finalized output report
/// (spec.md §4.2.4). The probe write is expected to fail (the daemon's
/// `.l.K` handler always returns an error after finalizing `.o.K`); that
/// failure is the signal, not an error condition here.
#[instrument(skip(conn))]
pub fn disconnect(conn: &Connection) -> Result<OutputReport> {
    unsafe {
        let _ = libc::write(conn.live_fd.as_raw_fd(), b"x".as_ptr().cast(), 1);
        libc::fsync(conn.live_fd.as_raw_fd());
    }

    let bytes = std::fs::read(conn.output_path())
        .with_context(|| format!("read output report for job {}", conn.job_key))?;
    serde_json::from_slice(&bytes).context("parse output report")
}

/// Assemble the final document written to `argv[2]` (spec.md §6).
pub fn finish(execution: Execution, report: OutputReport) -> LauncherOutput {
    LauncherOutput::merge(
        report,
        execution.status,
        execution.runtime_secs,
        execution.cputime_secs,
        execution.membytes,
    )
}

#[cfg(test)]
mod tests {
    use std::os::fd::FromRawFd;

    use super::*;

    #[test]
    fn parse_environment_splits_key_value_pairs() {
        let env = parse_environment(&["FOO=bar".to_string(), "EMPTY=".to_string(), "BROKEN".to_string()]);
        assert_eq!(env[0], ("FOO".to_string(), "bar".to_string()));
        assert_eq!(env[1], ("EMPTY".to_string(), "".to_string()));
        assert_eq!(env.len(), 2, "an entry with no '=' is dropped rather than guessed at");
    }

    #[test]
    fn connection_paths_are_derived_from_job_key() {
        let conn = Connection {
            mount_path: PathBuf::from("/tmp/ws/.fuse"),
            job_key: "4242".to_string(),
            // SAFETY: never dereferenced by this test.
            live_fd: unsafe { OwnedFd::from_raw_fd(-1) },
        };
        assert_eq!(conn.visibles_path(), PathBuf::from("/tmp/ws/.fuse/.i.4242"));
        assert_eq!(conn.output_path(), PathBuf::from("/tmp/ws/.fuse/.o.4242"));
        assert_eq!(conn.job_mount_subdir(), PathBuf::from("/tmp/ws/.fuse/4242"));
        std::mem::forget(conn.live_fd);
    }
}
