//! The sandbox daemon (C1): mounts a filtered, per-job view of a workspace
//! directory and records accesses through it.

pub mod filesystem;
pub mod shutdown;

use std::{
    collections::{BTreeMap, HashMap},
    os::fd::OwnedFd,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use color_eyre::{Result, eyre::Context};
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use tracing::{debug, instrument};

use crate::{
    job::Job,
    path::JobKey,
};

/// Inode number of the mount root, per the FUSE convention.
pub const ROOT_INO: u64 = 1;

/// Idle/activity signal shared with the daemon's watchdog thread (spec.md
/// §4.3). `DaemonContext` is the only thing that writes to it; the
/// watchdog only ever reads.
#[derive(Default)]
pub struct ActivityTracker {
    /// Unix millis at which the daemon last became idle, or `0` while a
    /// job or marker handle is open.
    idle_since_ms: AtomicU64,
}

impl ActivityTracker {
    pub fn idle_since_ms(&self) -> u64 {
        self.idle_since_ms.load(Ordering::SeqCst)
    }

    fn mark_idle(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.idle_since_ms.store(now, Ordering::SeqCst);
    }

    fn mark_active(&self) {
        self.idle_since_ms.store(0, Ordering::SeqCst);
    }
}

/// Process-wide state for the daemon (spec.md §3 "Daemon context").
///
/// Owned by the single VFS dispatch thread; every [`filesystem::DaemonFs`]
/// method takes `&mut self`, so no internal locking is required (spec.md
/// §4.1.8, §9).
pub struct DaemonContext {
    /// Directory handle to the workspace root; the anchor for every `*at`
    /// syscall the daemon performs.
    pub rootfd: OwnedFd,
    /// Job key → job state.
    pub jobs: BTreeMap<JobKey, Job>,
    /// Name embedded in the `.f.<name>` marker.
    pub daemon_name: String,
    /// Open-handle count on the daemon marker, gating exit.
    pub global_refs: u32,
    /// Set once an unmount attempt has begun (spec.md §4.1.4): further
    /// `.l.K` creates for unknown keys are refused so the client restarts a
    /// successor daemon instead of racing the shutdown.
    pub shutdown_armed: bool,
    /// Shared with the watchdog thread that drives C3 shutdown/handover.
    pub activity: Arc<ActivityTracker>,

    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

impl DaemonContext {
    /// Open the workspace root and build an empty daemon context.
    #[instrument(skip(workspace_root))]
    pub fn new(workspace_root: impl AsRef<Path> + std::fmt::Debug, daemon_name: String) -> Result<Self> {
        let fd = open(
            workspace_root.as_ref(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .context("open workspace root")?;
        debug!("opened workspace root");
        Ok(Self {
            rootfd: fd,
            jobs: BTreeMap::new(),
            daemon_name,
            global_refs: 0,
            shutdown_armed: false,
            activity: Arc::new(ActivityTracker::default()),
            path_to_ino: HashMap::from([(String::new(), ROOT_INO)]),
            ino_to_path: HashMap::from([(ROOT_INO, String::new())]),
            next_ino: ROOT_INO + 1,
        })
    }

    /// Whether the daemon is idle: no live jobs and no open marker handles
    /// (spec.md §4.3 `RUNNING → IDLE_ARMED`).
    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.global_refs == 0
    }

    /// Look up (or assign) the inode number for a mount-relative path.
    pub fn ino_for_path(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    /// The mount-relative path for a previously assigned inode.
    pub fn path_for_ino(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(String::as_str)
    }

    /// Erase a job if all of its reference counters have reached zero
    /// (spec.md §3 invariants, testable property 6).
    pub fn reap_job_if_unreferenced(&mut self, key: &str) {
        if self.jobs.get(key).is_some_and(Job::is_unreferenced) {
            self.jobs.remove(key);
            debug!(job = key, "erased job: all reference counters reached zero");
        }
        self.note_activity();
    }

    /// Refresh the shared idle signal after any change to job/marker
    /// reference counts (spec.md §4.3 `RUNNING <-> IDLE_ARMED`).
    pub fn note_activity(&self) {
        if self.is_idle() {
            self.activity.mark_idle();
        } else {
            self.activity.mark_active();
        }
    }
}
