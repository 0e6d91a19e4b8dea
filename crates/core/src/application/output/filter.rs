//! Line sanitizer and progress filter
//!
//! Workers print a high-frequency progress stream. Every line is stripped of
//! terminal escapes, and labeled progress lines that moved less than the
//! threshold since the last logged one are dropped.

use crate::application::constants::{
    DEFAULT_PROGRESS_THRESHOLD, DEFAULT_STREAM_LABELS, PROGRESS_BAR_CHAR,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
static PERCENTAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    /// Minimum change in percentage points for a progress line to be logged
    pub threshold: f64,
    /// Line prefixes naming independent progress streams
    pub stream_labels: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_PROGRESS_THRESHOLD,
            stream_labels: DEFAULT_STREAM_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDecision {
    Suppress,
    Emit(String),
}

/// Remove ANSI cursor-movement and color sequences
pub fn strip_ansi(raw: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(raw, "")
}

/// Strip escapes and surrounding whitespace; None if nothing is left
pub fn sanitize(raw: &str) -> Option<String> {
    let stripped = strip_ansi(raw);
    let trimmed = stripped.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn is_progress_line(line: &str) -> bool {
    line.contains('%') || line.contains(PROGRESS_BAR_CHAR)
}

/// First `NN%` or `NN.N%` value in the line
pub fn parse_percentage(line: &str) -> Option<f64> {
    PERCENTAGE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Per-run filter; holds the progress marker of every stream label
#[derive(Debug, Clone)]
pub struct LineFilter {
    config: FilterConfig,
    markers: HashMap<String, Option<f64>>,
}

impl LineFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            markers: HashMap::new(),
        }
    }

    pub fn process(&mut self, raw: &str) -> LineDecision {
        let Some(line) = sanitize(raw) else {
            return LineDecision::Suppress;
        };

        if !is_progress_line(&line) {
            return LineDecision::Emit(line);
        }

        let Some(label) = self.stream_label(&line) else {
            return LineDecision::Emit(line);
        };

        let current = parse_percentage(&line);
        if let (Some(Some(previous)), Some(current)) = (self.markers.get(&label), current) {
            if (current - previous).abs() < self.config.threshold {
                return LineDecision::Suppress;
            }
        }

        self.markers.insert(label, current);
        LineDecision::Emit(line)
    }

    /// Last logged percentage for `label`
    pub fn marker(&self, label: &str) -> Option<f64> {
        self.markers.get(label).copied().flatten()
    }

    pub fn reset(&mut self) {
        self.markers.clear();
    }

    fn stream_label(&self, line: &str) -> Option<String> {
        self.config
            .stream_labels
            .iter()
            .find(|label| line.starts_with(label.as_str()))
            .cloned()
    }
}

impl Default for LineFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(decision: LineDecision) -> Option<String> {
        match decision {
            LineDecision::Emit(line) => Some(line),
            LineDecision::Suppress => None,
        }
    }

    #[test]
    fn test_strips_ansi_sequences() {
        let mut filter = LineFilter::default();
        let line = "\x1b[2K\x1b[1A\x1b[32mDownloading\x1b[0m manifest  ";
        assert_eq!(
            filter.process(line),
            LineDecision::Emit("Downloading manifest".to_string())
        );
    }

    #[test]
    fn test_empty_after_cleaning_is_suppressed() {
        let mut filter = LineFilter::default();
        assert_eq!(filter.process("   "), LineDecision::Suppress);
        assert_eq!(filter.process("\x1b[0m\x1b[2K"), LineDecision::Suppress);
    }

    #[test]
    fn test_small_progress_step_suppressed() {
        let mut filter = LineFilter::default();
        assert!(emitted(filter.process("Vid 10.0% |━━      |")).is_some());
        assert_eq!(filter.process("Vid 13.0% |━━━     |"), LineDecision::Suppress);
    }

    #[test]
    fn test_large_progress_step_emitted() {
        let mut filter = LineFilter::default();
        filter.process("Vid 10.0%");
        assert_eq!(
            filter.process("Vid 16.0%"),
            LineDecision::Emit("Vid 16.0%".to_string())
        );
        assert_eq!(filter.marker("Vid"), Some(16.0));
    }

    #[test]
    fn test_suppressed_line_does_not_move_marker() {
        let mut filter = LineFilter::default();
        filter.process("Vid 10.0%");
        filter.process("Vid 13.0%");
        // 15.5 is 5.5 away from the last logged 10.0, not 2.5 from 13.0
        assert!(emitted(filter.process("Vid 15.5%")).is_some());
    }

    #[test]
    fn test_stream_labels_are_independent() {
        let mut filter = LineFilter::default();
        filter.process("Vid 10.0%");
        assert!(emitted(filter.process("Aud 11.0%")).is_some());
        assert_eq!(filter.process("Aud 12.0%"), LineDecision::Suppress);
        assert_eq!(filter.process("Vid 12.0%"), LineDecision::Suppress);
    }

    #[test]
    fn test_unlabeled_progress_always_emitted() {
        let mut filter = LineFilter::default();
        assert!(emitted(filter.process("Overall 10.0%")).is_some());
        assert!(emitted(filter.process("Overall 10.5%")).is_some());
        assert!(emitted(filter.process("━━━━━━━━")).is_some());
    }

    #[test]
    fn test_unparseable_percentage_emitted() {
        let mut filter = LineFilter::default();
        filter.process("Vid 10.0%");
        assert!(emitted(filter.process("Vid ━━━━ waiting")).is_some());
        // marker cleared by the unparseable line, so anything goes next
        assert!(emitted(filter.process("Vid 11.0%")).is_some());
    }

    #[test]
    fn test_non_progress_lines_always_emitted() {
        let mut filter = LineFilter::default();
        for _ in 0..3 {
            assert!(emitted(filter.process("Vid stream selected")).is_some());
        }
    }

    #[test]
    fn test_custom_threshold_and_labels() {
        let mut filter = LineFilter::new(FilterConfig {
            threshold: 1.0,
            stream_labels: vec!["[dl]".to_string()],
        });
        filter.process("[dl] 10%");
        assert!(emitted(filter.process("[dl] 11%")).is_some());
        assert_eq!(filter.process("[dl] 11.5%"), LineDecision::Suppress);
    }

    #[test]
    fn test_reset_clears_markers() {
        let mut filter = LineFilter::default();
        filter.process("Vid 10.0%");
        filter.reset();
        assert_eq!(filter.marker("Vid"), None);
        assert!(emitted(filter.process("Vid 11.0%")).is_some());
    }

    #[test]
    fn test_parse_percentage() {
        assert_eq!(parse_percentage("Vid  42.5% 3.1MiB/s"), Some(42.5));
        assert_eq!(parse_percentage("done 100%"), Some(100.0));
        assert_eq!(parse_percentage("no number"), None);
    }
}
