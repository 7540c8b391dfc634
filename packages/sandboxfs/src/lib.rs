//! Sandboxing filesystem: a per-job filtered view of a workspace directory
//! that records reads and writes made through it.

use derive_more::Display;

pub mod classify;
pub mod daemon;
pub mod fs;
pub mod job;
pub mod launcher;
pub mod path;
pub mod proto;

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Default)]
pub struct Locked;

/// Name of the environment variable that controls log verbosity, the
/// equivalent of the original daemon's `DEBUG_FUSE_WAKE` toggle.
pub const LOG_ENV: &str = "SANDBOXFS_LOG";

/// Conventional name of the mount subdirectory created below the workspace
/// root.
pub const DEFAULT_MOUNT_DIR: &str = ".fuse";

/// Conventional name of the daemon-alive marker file, exposed as
/// `.f.<name>` at the mount root.
pub const DEFAULT_DAEMON_NAME: &str = "sandboxfs-waked";
