//! Transfer filters
//!
//! Include/exclude patterns for directory downloads. A pattern is matched
//! against a file's base name; `*` matches any run of characters (including
//! none) and everything else is literal, `/` included.

use regex::Regex;

use super::path_utils::remote_base_name;

/// One compiled wildcard pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Self {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        // Every literal is escaped, so the expression is always valid
        let regex = Regex::new(&format!("^(?s:{})$", body))
            .unwrap_or_else(|_| unreachable!("escaped glob produced invalid regex"));
        Self { regex }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Include/exclude filter applied to remote file paths
///
/// Exclude wins over include. An empty include list accepts everything.
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    include: Vec<GlobPattern>,
    exclude: Vec<GlobPattern>,
}

impl TransferFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        Self {
            include: include.iter().map(|p| GlobPattern::new(p.as_ref())).collect(),
            exclude: exclude.iter().map(|p| GlobPattern::new(p.as_ref())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Decide whether the file at `path` should be transferred
    pub fn accepts(&self, path: &str) -> bool {
        let name = remote_base_name(path);

        if self.exclude.iter().any(|p| p.matches(name)) {
            return false;
        }
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(name)) {
            return false;
        }
        true
    }
}
