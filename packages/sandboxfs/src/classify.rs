//! Pseudo-file path classifier.
//!
//! The daemon's mount root contains, alongside live jobs' directories,
//! several pseudo-files distinguished only by filename prefix: `.i.K`
//! (input), `.o.K` (output), `.l.K` (liveness), and `.f.<name>` (daemon
//! marker). Every callback starts by classifying its path so the rest of the
//! dispatch can match on a tagged variant instead of re-parsing filenames.

use crate::path::{JobKey, RelPath, split_key};

/// The classification of a single mount-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathClass {
    /// The mount root itself.
    Root,
    /// `.f.<name>`, the daemon-alive marker.
    DaemonMarker,
    /// `.i.K`, the input/visible-set manifest for job `K`.
    JobInput(JobKey),
    /// `.o.K`, the finalized output report for job `K`.
    JobOutput(JobKey),
    /// `.l.K`, the liveness handle for job `K`.
    JobLive(JobKey),
    /// A regular path `K/rel` projected through job `K`'s view.
    JobPath(JobKey, RelPath),
}

/// Classify a single filename that appears directly under the mount root
/// (used by `readdir`/`lookup` on the root directory).
pub fn classify_root_entry(name: &str, daemon_name: &str) -> PathClass {
    if name == format!(".f.{daemon_name}") {
        return PathClass::DaemonMarker;
    }
    if let Some(key) = name.strip_prefix(".i.") {
        return PathClass::JobInput(key.to_string());
    }
    if let Some(key) = name.strip_prefix(".o.") {
        return PathClass::JobOutput(key.to_string());
    }
    if let Some(key) = name.strip_prefix(".l.") {
        return PathClass::JobLive(key.to_string());
    }
    // Anything else directly under the root is a job's directory.
    PathClass::JobPath(name.to_string(), crate::path::ROOT.to_string())
}

/// Classify a full mount-relative path (e.g. as handed by a `*at` syscall
/// anchored at the mount root). `""` denotes the root itself.
pub fn classify(path: &str, daemon_name: &str) -> PathClass {
    if path.is_empty() || path == "." {
        return PathClass::Root;
    }
    // Pseudo-files never contain a `/`: they are direct children of the root.
    // Reserved prefixes (`.f.`, `.i.`, `.o.`, `.l.`) are checked first; any
    // other single-component name is an ordinary job directory.
    if !path.contains('/') {
        if let Some(key) = path.strip_prefix(".i.") {
            return PathClass::JobInput(key.to_string());
        }
        if let Some(key) = path.strip_prefix(".o.") {
            return PathClass::JobOutput(key.to_string());
        }
        if let Some(key) = path.strip_prefix(".l.") {
            return PathClass::JobLive(key.to_string());
        }
        if path == format!(".f.{daemon_name}") {
            return PathClass::DaemonMarker;
        }
    }
    let (key, rel) = split_key(path);
    PathClass::JobPath(key, rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_root() {
        assert_eq!(classify("", "sandboxfs-waked"), PathClass::Root);
        assert_eq!(classify(".", "sandboxfs-waked"), PathClass::Root);
    }

    #[test]
    fn classifies_marker() {
        assert_eq!(
            classify(".f.sandboxfs-waked", "sandboxfs-waked"),
            PathClass::DaemonMarker
        );
    }

    #[test]
    fn classifies_pseudo_files() {
        assert_eq!(
            classify(".i.42", "sandboxfs-waked"),
            PathClass::JobInput("42".to_string())
        );
        assert_eq!(
            classify(".o.42", "sandboxfs-waked"),
            PathClass::JobOutput("42".to_string())
        );
        assert_eq!(
            classify(".l.42", "sandboxfs-waked"),
            PathClass::JobLive("42".to_string())
        );
    }

    #[test]
    fn classifies_job_paths() {
        assert_eq!(
            classify("42", "sandboxfs-waked"),
            PathClass::JobPath("42".to_string(), ".".to_string())
        );
        assert_eq!(
            classify("42/src/a.txt", "sandboxfs-waked"),
            PathClass::JobPath("42".to_string(), "src/a.txt".to_string())
        );
    }

    #[test]
    fn job_path_is_not_confused_with_a_marker_named_like_it() {
        // A job whose client chose the literal key ".f.sandboxfs-waked" is
        // not realistic (clients use pids) but the classifier must still be
        // unambiguous: root-level entries are checked for reserved prefixes
        // first.
        assert_eq!(
            classify(".f.sandboxfs-waked", "other-name"),
            PathClass::JobPath(".f.sandboxfs-waked".to_string(), ".".to_string())
        );
    }
}
