//! Path classification.
//!
//! Maps an absolute path to its change category. Patterns are compiled once
//! from the `monitoring` section; categories are tried in the order the
//! configuration declares them and the first matching pattern wins. Paths
//! that match nothing are not tracked.

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::debug;

struct CategoryGlobs {
    name: String,
    patterns: Vec<Pattern>,
}

/// Ordered glob -> category matcher.
pub struct PathClassifier {
    categories: Vec<CategoryGlobs>,
}

impl PathClassifier {
    /// Compile the configured glob lists, preserving declaration order.
    /// Patterns are assumed valid; config validation rejects malformed ones
    /// before the daemon gets this far.
    pub fn new(monitoring: &[(String, Vec<String>)]) -> Self {
        let categories = monitoring
            .iter()
            .map(|(name, globs)| CategoryGlobs {
                name: name.clone(),
                patterns: globs
                    .iter()
                    .filter_map(|g| match Pattern::new(g) {
                        Ok(p) => Some(p),
                        Err(e) => {
                            debug!(pattern = %g, "skipping malformed glob: {e}");
                            None
                        }
                    })
                    .collect(),
            })
            .collect();
        Self { categories }
    }

    /// Category of `path`, or `None` when the path is not monitored.
    /// Categories are tried in declaration order; the first match wins.
    pub fn classify(&self, path: &Path) -> Option<&str> {
        for category in &self.categories {
            if category.patterns.iter().any(|p| p.matches_path(path)) {
                return Some(&category.name);
            }
        }
        None
    }

    /// All configured categories in match order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.name.as_str())
    }

    /// Expand every pattern against the live filesystem.
    ///
    /// Returns existing concrete paths per category, used both to seed the
    /// watcher and to scope pre-change snapshots.
    pub fn expand_existing(&self, category: &str) -> Vec<PathBuf> {
        let Some(globs) = self.categories.iter().find(|c| c.name == category) else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        for pattern in &globs.patterns {
            match glob::glob(pattern.as_str()) {
                Ok(matches) => {
                    for entry in matches.flatten() {
                        if entry.is_file() {
                            paths.push(entry);
                        }
                    }
                }
                Err(e) => debug!(pattern = %pattern.as_str(), "glob expansion failed: {e}"),
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }

    /// Directories the watcher must observe: parents of every pattern.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for category in &self.categories {
            for pattern in &category.patterns {
                let raw = Path::new(pattern.as_str());
                // For a glob, the parent of the wildcard component; for a
                // literal path, its parent directory.
                let mut dir = PathBuf::new();
                let mut had_wildcard = false;
                for component in raw.components() {
                    let text = component.as_os_str().to_string_lossy();
                    if text.contains('*') || text.contains('?') || text.contains('[') {
                        had_wildcard = true;
                        break;
                    }
                    dir.push(component);
                }
                if !had_wildcard {
                    if let Some(parent) = dir.parent() {
                        dir = parent.to_path_buf();
                    }
                }
                if dir.as_os_str().is_empty() {
                    continue;
                }
                roots.push(dir);
            }
        }
        roots.sort();
        roots.dedup();
        roots
    }
}
