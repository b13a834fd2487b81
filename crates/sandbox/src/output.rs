//! Stream attribution for backends that hand back stdout and stderr merged
//! into a single log.
//!
//! This is a heuristic, not a stream split: the whole merged text goes to one
//! side. A failed run whose output looks like an error report is attributed to
//! stderr; everything else is attributed to stdout. Both backends route merged
//! output through here so callers see the same behaviour regardless of which
//! one ran the code.

/// Substrings that mark interpreter error reports.
const ERROR_MARKERS: &[&str] = &["Traceback", "Error", "Exception", "panicked at"];

/// Output after attribution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl SplitOutput {
    /// Append merged text using the attribution heuristic.
    pub fn push_merged(&mut self, merged: &str, exit_code: i64) {
        let target = if looks_like_error(merged, exit_code) {
            &mut self.stderr
        } else {
            &mut self.stdout
        };
        target.push_str(merged);
    }
}

/// Attribute a merged log to stdout or stderr.
pub fn attribute_merged_output(merged: String, exit_code: i64) -> SplitOutput {
    if looks_like_error(&merged, exit_code) {
        SplitOutput {
            stdout: String::new(),
            stderr: merged,
        }
    } else {
        SplitOutput {
            stdout: merged,
            stderr: String::new(),
        }
    }
}

fn looks_like_error(merged: &str, exit_code: i64) -> bool {
    exit_code != 0 && ERROR_MARKERS.iter().any(|marker| merged.contains(marker))
}
