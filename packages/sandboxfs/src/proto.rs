//! JSON wire types for the daemon's pseudo-file protocol (spec.md §6) and
//! the launcher's input/output documents.

use serde::{Deserialize, Serialize};

/// Manifest written by the launcher to a job's `.i.K` pseudo-file
/// (spec.md §4.1.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputManifest {
    /// Workspace-relative paths the job is permitted to read. Paths
    /// beginning with `/` are silently dropped by the caller before they
    /// reach [`crate::job::Job::apply_visible_manifest`] (they are already
    /// visible outside the mount).
    #[serde(default)]
    pub visible: Vec<String>,
}

/// Report synthesized by the daemon into a job's `.o.K` pseudo-file
/// (spec.md §4.1.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputReport {
    /// Total bytes read from underlying files through per-file-handle reads.
    pub ibytes: u64,
    /// Total bytes written to underlying files through per-file-handle
    /// writes.
    pub obytes: u64,
    /// Sorted workspace-relative paths the job read but did not write.
    pub inputs: Vec<String>,
    /// Sorted workspace-relative paths the job wrote, excluding
    /// `.fuse_hidden*` artifacts.
    pub outputs: Vec<String>,
}

/// A single mount operation entry from the launcher's input JSON. Parsed for
/// schema fidelity; the base daemon ignores these (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountOp {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub destination: String,
    #[serde(rename = "read-only", default)]
    pub read_only: bool,
}

/// The launcher's input document: the command description consumed from
/// `argv[1]` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherInput {
    /// argv; the first element is the program to execute.
    pub command: Vec<String>,
    /// `KEY=VALUE` environment entries passed to the child.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Workspace-relative paths visible to the job.
    #[serde(default)]
    pub visible: Vec<String>,
    /// Working directory for the command, relative to the mount subdir.
    #[serde(default)]
    pub directory: String,
    /// Path to redirect stdin from, or empty for `/dev/null`.
    #[serde(default)]
    pub stdin: String,
    /// Isolation fields ignored by the base daemon (SPEC_FULL.md §11).
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub domainname: String,
    #[serde(rename = "user-id", default)]
    pub user_id: Option<u32>,
    #[serde(rename = "group-id", default)]
    pub group_id: Option<u32>,
    #[serde(rename = "isolate-network", default)]
    pub isolate_network: bool,
    #[serde(rename = "mount-ops", default)]
    pub mount_ops: Vec<MountOp>,
}

/// Resource usage attached to the launcher's output document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub status: i32,
    pub runtime: f64,
    pub cputime: f64,
    pub membytes: u64,
    pub inbytes: u64,
    pub outbytes: u64,
}

/// The launcher's output document, written to `argv[2]` (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LauncherOutput {
    pub usage: Usage,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl LauncherOutput {
    /// Merge the daemon's [`OutputReport`] with locally observed process
    /// metadata into the final document the build engine consumes
    /// (spec.md §4.2.4 step 3).
    pub fn merge(
        report: OutputReport,
        status: i32,
        runtime_secs: f64,
        cputime_secs: f64,
        membytes: u64,
    ) -> Self {
        Self {
            usage: Usage {
                status,
                runtime: runtime_secs,
                cputime: cputime_secs,
                membytes,
                inbytes: report.ibytes,
                outbytes: report.obytes,
            },
            inputs: report.inputs,
            outputs: report.outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_launcher_input_minimal() {
        let json = r#"{
            "command": ["cat", "a.txt"],
            "environment": [],
            "visible": ["src/a.txt"],
            "directory": ".",
            "stdin": ""
        }"#;
        let parsed: LauncherInput = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.command, vec!["cat", "a.txt"]);
        assert_eq!(parsed.visible, vec!["src/a.txt"]);
        assert!(!parsed.isolate_network);
        assert!(parsed.mount_ops.is_empty());
    }

    #[test]
    fn parses_launcher_input_with_isolation_fields() {
        let json = r#"{
            "command": ["true"],
            "environment": ["FOO=bar"],
            "visible": [],
            "directory": "build",
            "stdin": "in.txt",
            "hostname": "sandbox",
            "user-id": 1000,
            "isolate-network": true,
            "mount-ops": [
                {"type": "bind", "source": "/a", "destination": "/b", "read-only": true}
            ]
        }"#;
        let parsed: LauncherInput = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.hostname, "sandbox");
        assert_eq!(parsed.user_id, Some(1000));
        assert!(parsed.isolate_network);
        assert_eq!(parsed.mount_ops.len(), 1);
        assert!(parsed.mount_ops[0].read_only);
    }

    #[test]
    fn merges_report_into_output() {
        let report = OutputReport {
            ibytes: 10,
            obytes: 20,
            inputs: vec!["src/a.txt".to_string()],
            outputs: vec!["out/b.txt".to_string()],
        };
        let output = LauncherOutput::merge(report, 0, 1.5, 0.2, 4096);
        assert_eq!(output.usage.status, 0);
        assert_eq!(output.usage.inbytes, 10);
        assert_eq!(output.usage.outbytes, 20);
        assert_eq!(output.inputs, vec!["src/a.txt"]);
        assert_eq!(output.outputs, vec!["out/b.txt"]);
    }

    #[test]
    fn input_manifest_defaults_to_empty_visible() {
        let manifest: InputManifest = serde_json::from_str("{}").expect("parse");
        assert!(manifest.visible.is_empty());
    }
}
