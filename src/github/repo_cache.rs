//! Discovery-time caches: repo name to clone URL, and per-repo metadata.
//!
//! A repository can be found through several enumeration paths at once
//! (org listing, member listing, gists, explicit URLs); the filtered cache
//! is what makes each one scanned at most once.

use std::collections::HashMap;
use std::sync::RwLock;

use globset::GlobSet;

use crate::chunk::Visibility;
use crate::filter::compile_globs;

/// Metadata shared between the enumerator (sole writer) and scanning
/// workers (readers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub has_wiki: bool,
    pub size_kb: i64,
    pub visibility: Visibility,
}

/// `full_name -> clone URL`, gated by include/exclude globs.
pub struct FilteredRepoCache {
    map: HashMap<String, String>,
    include: GlobSet,
    include_empty: bool,
    exclude: GlobSet,
}

impl FilteredRepoCache {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            map: HashMap::new(),
            include: compile_globs(include),
            include_empty: include.is_empty(),
            exclude: compile_globs(exclude),
        }
    }

    /// Whether a repository name passes the include/exclude globs.
    pub fn want_repo(&self, full_name: &str) -> bool {
        if self.exclude.is_match(full_name) {
            return false;
        }
        self.include_empty || self.include.is_match(full_name)
    }

    /// Record a repo if wanted and not already present. Returns whether the
    /// entry was newly admitted.
    pub fn insert(&mut self, full_name: &str, clone_url: &str) -> bool {
        if !self.want_repo(full_name) || self.map.contains_key(full_name) {
            return false;
        }
        self.map.insert(full_name.to_string(), clone_url.to_string());
        true
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.map.contains_key(full_name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All admitted clone URLs.
    pub fn clone_urls(&self) -> Vec<String> {
        self.map.values().cloned().collect()
    }
}

/// Thread-safe repo metadata keyed by clone URL. Only the enumerator
/// writes; scanners read concurrently.
#[derive(Default)]
pub struct RepoInfoCache {
    map: RwLock<HashMap<String, RepoInfo>>,
}

impl RepoInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, clone_url: &str, info: RepoInfo) {
        self.map
            .write()
            .expect("repo info lock poisoned")
            .insert(clone_url.to_string(), info);
    }

    pub fn get(&self, clone_url: &str) -> Option<RepoInfo> {
        self.map.read().expect("repo info lock poisoned").get(clone_url).cloned()
    }

    /// Drop everything at source teardown.
    pub fn clear(&self) {
        self.map.write().expect("repo info lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_and_exclude_gate_admission() {
        let mut cache =
            FilteredRepoCache::new(&["org/*".into()], &["org/repo1".into()]);
        assert!(cache.insert("org/repo2", "https://github.com/org/repo2.git"));
        assert!(!cache.insert("org/repo1", "https://github.com/org/repo1.git"));
        assert!(!cache.insert("other/x", "https://github.com/other/x.git"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn duplicate_discovery_is_ignored() {
        let mut cache = FilteredRepoCache::new(&[], &[]);
        assert!(cache.insert("acme/widgets", "url-1"));
        assert!(!cache.insert("acme/widgets", "url-2"));
        assert_eq!(cache.clone_urls(), vec!["url-1".to_string()]);
    }

    #[test]
    fn repo_info_round_trip() {
        let cache = RepoInfoCache::new();
        let info = RepoInfo {
            owner: "acme".into(),
            name: "widgets".into(),
            full_name: "acme/widgets".into(),
            has_wiki: true,
            size_kb: 42,
            visibility: Visibility::Private,
        };
        cache.put("https://github.com/acme/widgets.git", info.clone());
        assert_eq!(cache.get("https://github.com/acme/widgets.git"), Some(info));
        cache.clear();
        assert_eq!(cache.get("https://github.com/acme/widgets.git"), None);
    }
}
