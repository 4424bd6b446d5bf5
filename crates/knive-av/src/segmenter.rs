//! The external live segmenter's command line and report format.
//!
//! The segmenter reads MPEG-TS from stdin and cuts it into numbered files
//! in a scratch directory. After each file it prints a report line on
//! stderr:
//!
//! ```text
//! segmenter: <first>, <last>, <end>, <label>, <duration>
//! ```

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

fn report_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^segmenter: (\d+), (\d+), (\d+), (.+?), (\d+(?:\.\d+)?)$")
            .expect("valid regex")
    })
}

/// One report line from the segmenter.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentReport {
    pub first_index: u64,
    /// Index of the segment that was just completed.
    pub last_index: u64,
    pub end_of_stream: bool,
    pub label: String,
    /// Length of the completed segment in seconds.
    pub duration: f64,
}

/// Parse a report line. Anything else yields `None`.
pub fn parse_report(line: &str) -> Option<SegmentReport> {
    let caps = report_re().captures(line.trim())?;
    Some(SegmentReport {
        first_index: caps[1].parse().ok()?,
        last_index: caps[2].parse().ok()?,
        end_of_stream: &caps[3] != "0",
        label: caps[4].to_string(),
        duration: caps[5].parse().ok()?,
    })
}

/// Arguments for one segmenter invocation. The label doubles as the
/// file-name prefix.
pub fn segmenter_args(segment_duration: u32, scratch_dir: &Path, label: &str) -> Vec<String> {
    vec![
        segment_duration.to_string(),
        scratch_dir.to_string_lossy().to_string(),
        label.to_string(),
        label.to_string(),
    ]
}

/// File name of segment `index` for `label`.
pub fn segment_file_name(label: &str, index: u64) -> String {
    format!("{label}-{index:08}.ts")
}
