//! Glob-based admission filters.
//!
//! Two related pieces live here: [`FilterSet`], a dedup gate used during
//! enumeration (admit each value once, subject to include/exclude globs),
//! and [`PathFilter`], the per-file pass check applied to diff paths and
//! object names during scanning.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compile a glob list, logging and dropping any pattern that fails to
/// compile.
pub(crate) fn compile_globs(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => log::warn!("dropping unparseable glob {pattern:?}: {err}"),
        }
    }
    // An empty builder always compiles.
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Include/exclude membership gate with one-shot admission.
///
/// `add` admits a value iff no exclude glob matches, the include list is
/// empty or at least one include glob matches, and the value has not been
/// admitted before.
pub struct FilterSet {
    include: GlobSet,
    include_empty: bool,
    exclude: GlobSet,
    seen: Mutex<HashSet<String>>,
}

impl FilterSet {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: compile_globs(include),
            include_empty: include.is_empty(),
            exclude: compile_globs(exclude),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a value would pass the include/exclude globs, ignoring the
    /// dedup set.
    pub fn wanted(&self, value: &str) -> bool {
        if self.exclude.is_match(value) {
            return false;
        }
        self.include_empty || self.include.is_match(value)
    }

    /// Admit `value` if it is wanted and has not been admitted before.
    pub fn add(&self, value: &str) -> bool {
        if !self.wanted(value) {
            return false;
        }
        self.seen
            .lock()
            .expect("filter set lock poisoned")
            .insert(value.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("filter set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-path pass check used while chunking diffs and objects.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include_patterns: include.to_vec(),
            exclude_patterns: exclude.to_vec(),
            include: if include.is_empty() { None } else { Some(compile_globs(include)) },
            exclude: compile_globs(exclude),
        }
    }

    /// Build a filter from newline-separated pattern files. Blank lines and
    /// `#` comments are ignored.
    pub fn from_files(
        include_file: Option<&Path>,
        exclude_file: Option<&Path>,
    ) -> std::io::Result<Self> {
        let include = include_file.map(read_pattern_file).transpose()?.unwrap_or_default();
        let exclude = exclude_file.map(read_pattern_file).transpose()?.unwrap_or_default();
        Ok(Self::new(&include, &exclude))
    }

    /// Extend the exclude list with additional patterns.
    pub fn with_excludes(mut self, patterns: &[String]) -> Self {
        if !patterns.is_empty() {
            self.exclude_patterns.extend(patterns.iter().cloned());
            // Recompile; GlobSet has no union operation.
            self.exclude = compile_globs(&self.exclude_patterns);
        }
        self
    }

    /// The include patterns this filter was built with.
    pub fn include_patterns(&self) -> &[String] {
        &self.include_patterns
    }

    /// Whether a path should be scanned.
    pub fn pass(&self, path: &str) -> bool {
        if self.exclude.is_match(path) {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(path),
            None => true,
        }
    }
}

fn read_pattern_file(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_set_admits_once() {
        let set = FilterSet::new(&[], &[]);
        assert!(set.add("acme/widgets"));
        assert!(!set.add("acme/widgets"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn filter_set_exclude_wins() {
        let set = FilterSet::new(&["acme/*".into()], &["acme/secret".into()]);
        assert!(set.add("acme/widgets"));
        assert!(!set.add("acme/secret"));
        assert!(!set.add("other/repo"));
    }

    #[test]
    fn filter_set_empty_include_admits_all_unexcluded() {
        let set = FilterSet::new(&[], &["*.tmp".into()]);
        assert!(set.add("anything"));
        assert!(!set.add("scratch.tmp"));
    }

    #[test]
    fn bad_glob_is_dropped_not_fatal() {
        let set = FilterSet::new(&["a[".into(), "acme/*".into()], &[]);
        assert!(set.add("acme/widgets"));
    }

    #[test]
    fn path_filter_defaults_to_pass() {
        let filter = PathFilter::default();
        assert!(filter.pass("src/main.rs"));
    }

    #[test]
    fn path_filter_include_narrows() {
        let filter = PathFilter::new(&["src/**".into()], &["src/vendor/**".into()]);
        assert!(filter.pass("src/main.rs"));
        assert!(!filter.pass("docs/readme.md"));
        assert!(!filter.pass("src/vendor/lib.rs"));
    }

    #[test]
    fn pattern_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("include.txt");
        std::fs::write(&path, "# comment\n\nsrc/**\n  \n").unwrap();
        let filter = PathFilter::from_files(Some(&path), None).unwrap();
        assert!(filter.pass("src/lib.rs"));
        assert!(!filter.pass("other/file"));
    }
}
