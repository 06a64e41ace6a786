//! Options controlling a single repository scan.

use crate::filter::PathFilter;

/// How far back and how wide a commit scan reaches.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Per-path admission check applied to every diff.
    pub filter: PathFilter,
    /// Oldest commit (exclusive). Normalized to a full hash, and to the
    /// merge-base with `head_hash` when both are set.
    pub base_hash: String,
    /// Newest commit (inclusive). Empty means all refs.
    pub head_hash: String,
    /// Maximum commits to walk; -1 is unbounded.
    pub max_depth: i64,
    /// The target is a bare repository: skip the staged-changes pass.
    pub bare: bool,
    /// Extra exclude globs merged into `filter`.
    pub exclude_globs: Vec<String>,
    pub log_options: LogOptions,
}

/// Which refs `git log` walks.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub all_refs: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self { all_refs: true }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanOptions {
    /// Defaults: pass-all filter, no range bounds, unbounded depth, all refs.
    pub fn new() -> Self {
        Self {
            filter: PathFilter::default(),
            base_hash: String::new(),
            head_hash: String::new(),
            max_depth: -1,
            bare: false,
            exclude_globs: Vec::new(),
            log_options: LogOptions::default(),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_base_hash(mut self, base: impl Into<String>) -> Self {
        self.base_hash = base.into();
        self
    }

    pub fn with_head_hash(mut self, head: impl Into<String>) -> Self {
        self.head_hash = head.into();
        self
    }

    pub fn with_max_depth(mut self, depth: i64) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_bare(mut self, bare: bool) -> Self {
        self.bare = bare;
        self
    }

    /// Merge extra exclude globs into the path filter.
    pub fn with_exclude_globs(mut self, globs: &[String]) -> Self {
        self.exclude_globs = globs.to_vec();
        self.filter = self.filter.with_excludes(globs);
        self
    }

    pub fn with_log_options(mut self, log_options: LogOptions) -> Self {
        self.log_options = log_options;
        self
    }
}
