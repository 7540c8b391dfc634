//! Per-job state (spec.md §3): visible/read/wrote sets, the pseudo-file
//! buffers, and the reference counters that determine when a job is erased.

use tracing::{debug, trace, warn};

use crate::{
    path::{PathSet, RelPath},
    proto::{InputManifest, OutputReport},
};

/// Bytes beyond this ceiling written to a job's `.i.K` pseudo-file are
/// silently dropped (spec.md §6).
pub const INPUT_BUFFER_CAP: usize = 128 * 1024 * 1024;

/// A live job's complete state.
#[derive(Debug, Default)]
pub struct Job {
    visible: PathSet,
    read: PathSet,
    wrote: PathSet,

    /// Raw bytes accumulated from writes to `.i.K`, parsed into `visible`
    /// on the final close of that pseudo-file (spec.md §4.1.6).
    input_buffer: Vec<u8>,
    /// The finalized report, written into `.o.K`. `None` until the first
    /// meaningful close of `.l.K`.
    output: Option<OutputReport>,

    /// Running total of bytes read from underlying files through per-file
    /// handles (not pseudo-files).
    ibytes: u64,
    /// Running total of bytes written the same way.
    obytes: u64,

    /// Open handles to `.l.K`.
    live_refs: u32,
    /// Open handles to `.i.K`.
    input_refs: u32,
    /// Open handles to `.o.K`.
    output_refs: u32,
}

impl Job {
    /// Create a fresh job with empty state, as happens on the first
    /// creation of `.l.K` for a previously-unknown key (spec.md §4.1.4).
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether all three reference counters are zero: the job may be erased
    /// (spec.md §3 invariants, testable property 6).
    pub fn is_unreferenced(&self) -> bool {
        self.live_refs == 0 && self.input_refs == 0 && self.output_refs == 0
    }

    pub fn bump_live(&mut self) {
        self.live_refs += 1;
    }

    /// Release one liveness handle. Returns the remaining count.
    pub fn release_live(&mut self) -> u32 {
        self.live_refs = self.live_refs.saturating_sub(1);
        self.live_refs
    }

    pub fn bump_input(&mut self) {
        self.input_refs += 1;
    }

    pub fn release_input(&mut self) -> u32 {
        self.input_refs = self.input_refs.saturating_sub(1);
        self.input_refs
    }

    pub fn bump_output(&mut self) {
        self.output_refs += 1;
    }

    pub fn release_output(&mut self) -> u32 {
        self.output_refs = self.output_refs.saturating_sub(1);
        self.output_refs
    }

    /// Readable iff `rel` is in the wrote set, or satisfies the
    /// visible-prefix predicate (spec.md §4.1.3 rule 1).
    pub fn is_readable(&self, rel: &str) -> bool {
        self.wrote.contains(rel) || self.visible.visible(rel)
    }

    /// Writable iff `rel` is already claimed in the wrote set (spec.md
    /// §4.1.3 rule 2).
    pub fn is_writable(&self, rel: &str) -> bool {
        self.wrote.contains(rel)
    }

    /// Create conflict iff `rel` is already visible — a pre-existing
    /// dependency would otherwise be silently clobbered (spec.md §4.1.3
    /// rule 3).
    pub fn is_create_conflict(&self, rel: &str) -> bool {
        self.visible.visible(rel)
    }

    /// Record a successful read-type operation against `rel`. A path
    /// already present in the wrote set is never added to the read set,
    /// which is what keeps write-then-read-back classified as an output
    /// (testable property 9) and keeps read/wrote disjoint (invariant 1)
    /// without needing a separate reconciliation step at finalization.
    pub fn record_read(&mut self, rel: &str) {
        if !self.wrote.contains(rel) {
            self.read.insert(rel.to_string());
        }
    }

    /// Record a successful create/write against `rel`, claiming it in the
    /// wrote set and dropping any stale read-set entry.
    pub fn record_write(&mut self, rel: &str) {
        self.read.remove(rel);
        self.wrote.insert(rel.to_string());
    }

    pub fn add_ibytes(&mut self, n: u64) {
        self.ibytes += n;
    }

    pub fn add_obytes(&mut self, n: u64) {
        self.obytes += n;
    }

    /// Move `from` (and any of its descendants present in the read/wrote
    /// sets) into `to`'s namespace, as required for intra-job rename and
    /// hardlink (spec.md §4.1.3 rule 4).
    pub fn rename_within(&mut self, from: &str, to: &str) {
        self.read.rename_prefix(from, to);
        self.wrote.rename_prefix(from, to);
    }

    /// Append bytes written to `.i.K`, truncating at [`INPUT_BUFFER_CAP`]
    /// (spec.md §6).
    pub fn append_input(&mut self, data: &[u8]) -> usize {
        let remaining = INPUT_BUFFER_CAP.saturating_sub(self.input_buffer.len());
        let take = remaining.min(data.len());
        self.input_buffer.extend_from_slice(&data[..take]);
        data.len() // the write still reports the full length to the caller
    }

    /// Read back the raw bytes of `.i.K`.
    pub fn input_bytes(&self) -> &[u8] {
        &self.input_buffer
    }

    /// Parse the accumulated input buffer into the visible set (spec.md
    /// §4.1.6). Called on the final close of `.i.K`. Absolute paths are
    /// silently dropped; parse failures are logged and leave the visible
    /// set unchanged rather than aborting the job.
    pub fn apply_visible_manifest(&mut self) {
        if self.input_buffer.is_empty() {
            return;
        }
        match serde_json::from_slice::<InputManifest>(&self.input_buffer) {
            Ok(manifest) => {
                let mut accepted = 0usize;
                for path in manifest.visible {
                    if path.is_empty() || path.starts_with('/') {
                        continue;
                    }
                    self.visible.insert(path);
                    accepted += 1;
                }
                debug!(accepted, "applied visible-set manifest");
            }
            Err(err) => {
                warn!(%err, "failed to parse input manifest; job continues with current visible set");
            }
        }
    }

    /// Whether the output report has already been finalized.
    pub fn output_ready(&self) -> bool {
        self.output.is_some()
    }

    /// Synthesize the output report on the first meaningful write to
    /// `.l.K` (spec.md §4.1.7). A no-op if already finalized.
    pub fn finalize_output(&mut self) {
        if self.output.is_some() {
            return;
        }
        let mut inputs: Vec<RelPath> = self.read.iter().cloned().collect();
        inputs.sort();

        let mut outputs: Vec<RelPath> = self
            .wrote
            .iter()
            .filter(|p| {
                !p.rsplit('/')
                    .next()
                    .unwrap_or(p.as_str())
                    .starts_with(".fuse_hidden")
            })
            .cloned()
            .collect();
        outputs.sort();

        trace!(inputs = inputs.len(), outputs = outputs.len(), "finalized output report");
        self.output = Some(OutputReport {
            ibytes: self.ibytes,
            obytes: self.obytes,
            inputs,
            outputs,
        });
    }

    /// Bytes of the finalized `.o.K` report, or an empty object if not yet
    /// finalized (readers should not normally observe this state, since
    /// `.o.K` is only listed in readdir once finalization has happened).
    pub fn output_bytes(&self) -> Vec<u8> {
        match &self.output {
            Some(report) => serde_json::to_vec(report).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_via_visible_prefix() {
        let mut job = Job::new();
        job.visible.insert("lib");
        assert!(job.is_readable("lib/a.rs"));
        assert!(!job.is_readable("other.rs"));
    }

    #[test]
    fn write_then_read_is_classified_as_output_only() {
        let mut job = Job::new();
        job.record_write("out/b.txt");
        job.record_read("out/b.txt");
        job.finalize_output();
        let report: OutputReport = serde_json::from_slice(&job.output_bytes()).unwrap();
        assert_eq!(report.outputs, vec!["out/b.txt".to_string()]);
        assert!(report.inputs.is_empty());
    }

    #[test]
    fn finalize_excludes_fuse_hidden_artifacts() {
        let mut job = Job::new();
        job.record_write("out/.fuse_hidden0001abcd");
        job.record_write("out/real.txt");
        job.finalize_output();
        let report: OutputReport = serde_json::from_slice(&job.output_bytes()).unwrap();
        assert_eq!(report.outputs, vec!["out/real.txt".to_string()]);
    }

    #[test]
    fn finalize_sorts_inputs_lexicographically() {
        let mut job = Job::new();
        job.visible.insert("src");
        job.record_read("src/z.txt");
        job.record_read("src/a.txt");
        job.finalize_output();
        let report: OutputReport = serde_json::from_slice(&job.output_bytes()).unwrap();
        assert_eq!(report.inputs, vec!["src/a.txt".to_string(), "src/z.txt".to_string()]);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut job = Job::new();
        job.record_write("a.txt");
        job.finalize_output();
        job.record_write("b.txt"); // after finalization, further writes don't change the report
        job.finalize_output();
        let report: OutputReport = serde_json::from_slice(&job.output_bytes()).unwrap();
        assert_eq!(report.outputs, vec!["a.txt".to_string()]);
    }

    #[test]
    fn apply_visible_manifest_drops_absolute_paths() {
        let mut job = Job::new();
        job.append_input(br#"{"visible": ["src/a.txt", "/etc/passwd", ""]}"#);
        job.apply_visible_manifest();
        assert!(job.is_readable("src/a.txt"));
        assert!(!job.is_readable("etc/passwd"));
    }

    #[test]
    fn apply_visible_manifest_tolerates_parse_failure() {
        let mut job = Job::new();
        job.visible.insert("src/a.txt");
        job.append_input(b"not json");
        job.apply_visible_manifest();
        // existing visibility is untouched by the failed parse
        assert!(job.is_readable("src/a.txt"));
    }

    #[test]
    fn input_buffer_truncates_at_cap() {
        let mut job = Job::new();
        let chunk = vec![b'x'; INPUT_BUFFER_CAP + 100];
        let reported = job.append_input(&chunk);
        assert_eq!(reported, chunk.len());
        assert_eq!(job.input_bytes().len(), INPUT_BUFFER_CAP);
    }

    #[test]
    fn rename_moves_wrote_and_read_entries() {
        let mut job = Job::new();
        job.visible.insert("in/c.txt");
        job.record_read("in/c.txt");
        job.rename_within("in/c.txt", "out/c.txt");
        assert!(!job.is_readable("in/c.txt") || job.visible.visible("in/c.txt"));
        // after rename the read-set entry moved with it
        job.finalize_output();
        let report: OutputReport = serde_json::from_slice(&job.output_bytes()).unwrap();
        assert!(!report.inputs.contains(&"in/c.txt".to_string()));
    }

    #[test]
    fn job_erased_only_when_all_counters_zero() {
        let mut job = Job::new();
        job.bump_live();
        job.bump_input();
        assert!(!job.is_unreferenced());
        job.release_live();
        assert!(!job.is_unreferenced());
        job.release_input();
        assert!(job.is_unreferenced());
    }
}
