use regex::Regex;
use std::collections::HashSet;

use dbgscope_types::LogRecord;

/// Compiled filter for log records
#[derive(Clone)]
pub struct RecordFilter {
    /// Regex pattern (if any)
    regex: Option<Regex>,

    /// Original pattern string
    pattern: String,

    /// Process ids to include (empty = all)
    pids: HashSet<u32>,

    /// Whether to invert match
    invert: bool,

    /// Case sensitivity
    case_insensitive: bool,
}

impl RecordFilter {
    /// Create a new filter from a pattern string
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Self::build(pattern, false)
    }

    /// Create a case-insensitive filter
    pub fn new_case_insensitive(pattern: &str) -> Result<Self, regex::Error> {
        Self::build(pattern, true)
    }

    fn build(pattern: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let regex = if pattern.is_empty() {
            None
        } else if case_insensitive {
            Some(Regex::new(&format!("(?i){}", pattern))?)
        } else {
            Some(Regex::new(pattern)?)
        };

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            pids: HashSet::new(),
            invert: false,
            case_insensitive,
        })
    }

    /// Set process ids to filter by
    pub fn with_pids(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.pids = pids.into_iter().collect();
        self
    }

    /// Invert the match
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Check if a record matches this filter.
    /// Internal records always pass so connection errors stay visible.
    pub fn matches(&self, record: &LogRecord) -> bool {
        if record.is_internal() {
            return true;
        }

        if !self.pids.is_empty() && !self.pids.contains(&record.pid) {
            return self.invert;
        }

        let text_match = match &self.regex {
            Some(re) => re.is_match(record.text()),
            None => true,
        };

        if self.invert { !text_match } else { text_match }
    }

    /// Get the original pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.regex.is_none() && self.pids.is_empty() && !self.invert
    }

    /// Check if filter is case insensitive
    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }
}

impl std::fmt::Debug for RecordFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFilter")
            .field("pattern", &self.pattern)
            .field("pids", &self.pids)
            .field("invert", &self.invert)
            .finish()
    }
}
