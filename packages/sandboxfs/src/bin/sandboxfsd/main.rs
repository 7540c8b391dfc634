//! The sandbox daemon binary: mounts a filtered view of the workspace
//! directory at a given mount point and serves it until idle, per spec.md
//! §4.1 and §4.3.
//!
//! Syntax: `sandboxfsd <mount-point> <linger-secs>`

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use nix::unistd::{ForkResult, fork, setsid};
use sandboxfs::{
    DEFAULT_DAEMON_NAME, Locked,
    daemon::{
        ActivityTracker, DaemonContext,
        filesystem::DaemonFs,
        shutdown::{self, Event, State},
    },
    fs::LockFile,
};
use tracing::{debug, info, instrument, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt};
use tracing_tree::time::Uptime;

#[derive(Debug, Parser)]
#[command(name = "sandboxfsd")]
struct Args {
    /// Directory to mount the sandboxing filesystem at. Its parent is
    /// treated as the workspace root.
    mount_point: PathBuf,
    /// Seconds to linger with no live jobs before attempting to unmount.
    linger_secs: u64,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let log_path = {
        let mut p = args.mount_point.clone().into_os_string();
        p.push(".log");
        PathBuf::from(p)
    };
    let lock = LockFile::open(&log_path).context("open daemon log/lock file")?;
    let locked = match lock.try_lock().context("try-lock daemon log file")? {
        Some(locked) => locked,
        None => {
            // Another daemon already owns this mount point: not an error,
            // the caller's connect-retry loop will find it via the marker.
            return Ok(());
        }
    };

    // Daemonize before doing anything else: double-fork + detach from the
    // controlling terminal, matching the original daemon's approach so a
    // build tool that spawns us doesn't block waiting for our exit.
    daemonize()?;

    init_tracing(&log_path)?;
    info!(mount_point = ?args.mount_point, linger_secs = args.linger_secs, "starting sandbox daemon");

    std::fs::create_dir_all(&args.mount_point).context("create mount point directory")?;
    raise_fd_limit();

    let ctx = DaemonContext::new(".", DEFAULT_DAEMON_NAME.to_string())
        .context("build daemon context from workspace root")?;
    // A freshly started daemon has no jobs: it is idle from the first
    // instant and the linger timer begins immediately, giving exactly one
    // launcher `connect()` window to claim it before it exits unclaimed.
    ctx.note_activity();
    let activity = ctx.activity.clone();
    let force_exit = Arc::new(AtomicBool::new(false));

    let fs = DaemonFs::new(ctx);

    let watchdog = {
        let activity = activity.clone();
        let force_exit = force_exit.clone();
        let mount_point = args.mount_point.clone();
        let linger = Duration::from_secs(args.linger_secs.max(1));
        std::thread::spawn(move || watchdog_loop(activity, force_exit, mount_point, linger))
    };

    install_signal_handlers(force_exit)?;

    let options = [
        fuser::MountOption::FSName("sandboxfs".to_string()),
        fuser::MountOption::NoAtime,
        fuser::MountOption::DefaultPermissions,
    ];
    let mount_result = fuser::mount2(fs, &args.mount_point, &options);
    if let Err(err) = &mount_result {
        warn!(%err, "fuse session ended with an error");
    }

    // The watchdog is responsible for having already unmounted us by the
    // time mount2() returns on its own; join it for its exit code.
    let watchdog_ok = watchdog.join().unwrap_or(false);

    release_lock(locked);
    let _ = std::fs::remove_dir(&args.mount_point);

    if mount_result.is_ok() || watchdog_ok {
        Ok(())
    } else {
        color_eyre::eyre::bail!("sandbox daemon exited after exhausting unmount retries")
    }
}

fn release_lock(locked: LockFile<Locked>) {
    if let Err(err) = locked.unlock() {
        warn!(%err, "failed to release daemon lock on exit");
    }
}

#[instrument]
fn daemonize() -> Result<()> {
    // SAFETY: called at the very start of main, before any other threads
    // (tracing, the watchdog, fuser) are spawned.
    match unsafe { fork() }.context("first daemonize fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    match unsafe { fork() }.context("second daemonize fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    Ok(())
}

fn init_tracing(log_path: &std::path::Path) -> Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open {}", log_path.display()))?;
    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_bracketed_fields(true)
                .with_timer(Uptime::default())
                .with_writer(log_file)
                .with_targets(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_env_var(sandboxfs::LOG_ENV)
                        .from_env_lossy(),
                ),
        )
        .init();
    Ok(())
}

/// Raise the open-fd limit to its hard ceiling: a long build may open far
/// more files through the mount than the default soft limit allows.
fn raise_fd_limit() {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((_, hard)) => {
            if let Err(err) = setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                warn!(%err, "failed to raise RLIMIT_NOFILE");
            }
        }
        Err(err) => warn!(%err, "failed to read RLIMIT_NOFILE"),
    }
}

fn install_signal_handlers(force_exit: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGQUIT, SIGTERM]).context("register signal set")?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            debug!("received termination signal, forcing unmount");
            force_exit.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Runs on its own thread for the daemon's lifetime, applying
/// [`shutdown::transition`] to activity observed through `activity` and to
/// its own retry timers. Returns whether the mount point was unmounted
/// cleanly (as opposed to exhausting retries).
fn watchdog_loop(
    activity: Arc<ActivityTracker>,
    force_exit: Arc<AtomicBool>,
    mount_point: PathBuf,
    linger: Duration,
) -> bool {
    let mut state = State::Running;
    let poll = Duration::from_millis(200);

    loop {
        std::thread::sleep(poll);

        let idle_since = activity.idle_since_ms();
        let forced = force_exit.load(Ordering::SeqCst);

        state = match state {
            State::Running if idle_since != 0 => {
                shutdown::transition(state, Event::WentIdle).unwrap_or(state)
            }
            State::IdleArmed if idle_since == 0 => {
                shutdown::transition(state, Event::ClientConnected).unwrap_or(state)
            }
            State::IdleArmed
                if forced || elapsed_ms(idle_since) >= linger.as_millis() as u64 =>
            {
                shutdown::transition(state, Event::LingerTimerFired).unwrap_or(state)
            }
            other => other,
        };

        if let State::UnmountTry(attempt) = state {
            debug!(attempt, "attempting unmount");
            state = match try_unmount(&mount_point) {
                UnmountOutcome::StillMounted => {
                    std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                    shutdown::transition(state, Event::UnmountStillMounted).unwrap_or(State::Failed)
                }
                UnmountOutcome::Succeeded => {
                    shutdown::transition(state, Event::UnmountSucceeded).unwrap_or(State::Linger)
                }
            };
        }

        match state {
            State::Linger => return true,
            State::Failed => return false,
            _ => {}
        }
    }
}

fn elapsed_ms(since_ms: u64) -> u64 {
    now_ms().saturating_sub(since_ms)
}

enum UnmountOutcome {
    StillMounted,
    Succeeded,
}

/// Shell out to `fusermount -u` (the same mechanism libfuse's own helper
/// binary uses) rather than calling `umount2` directly: it handles the
/// setuid-root handoff needed for an unprivileged mount.
fn try_unmount(mount_point: &std::path::Path) -> UnmountOutcome {
    let status = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .status();
    match status {
        Ok(status) if status.success() => UnmountOutcome::Succeeded,
        _ => UnmountOutcome::StillMounted,
    }
}
