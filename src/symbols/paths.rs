//! Source path aliasing
//!
//! Debug info, dump tools and the front end rarely agree on how a source
//! file is spelled: one sends `/build/proj/src/main.c`, another `src/main.c`,
//! a third `main.c`. An alias set records every suffix variant of each
//! canonical path so any of those spellings resolves to the same file.

use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Default)]
pub struct FileAliasSet {
    /// Suffix variant -> canonical paths that end in it.
    aliases: HashMap<String, BTreeSet<String>>,
    canonical: HashSet<String>,
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// All '/'-separated suffixes of `path`, longest first (the path itself
/// included).
fn suffixes(path: &str) -> Vec<&str> {
    let mut out = vec![path];
    for (i, c) in path.char_indices() {
        if c == '/' && i + 1 < path.len() {
            out.push(&path[i + 1..]);
        }
    }
    out
}

impl FileAliasSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path and all its suffix variants. Idempotent; returns the
    /// normalized canonical form.
    pub fn add(&mut self, path: &str) -> String {
        let canonical = normalize(path);
        if self.canonical.insert(canonical.clone()) {
            for suffix in suffixes(&canonical) {
                self.aliases
                    .entry(suffix.to_string())
                    .or_default()
                    .insert(canonical.clone());
            }
        }
        canonical
    }

    /// Resolve any spelling of a known file to its canonical path.
    ///
    /// Exact canonical matches win; otherwise the longest suffix of the
    /// query that names a known variant is used. Ambiguous variants resolve
    /// to the lexicographically smallest candidate so repeated queries agree.
    pub fn resolve(&self, query: &str) -> Option<&str> {
        let q = normalize(query);
        if let Some(exact) = self.canonical.get(&q) {
            return Some(exact.as_str());
        }
        for suffix in suffixes(&q) {
            if let Some(candidates) = self.aliases.get(suffix) {
                if let Some(first) = candidates.iter().next() {
                    return Some(first.as_str());
                }
            }
        }
        None
    }

    pub fn contains(&self, path: &str) -> bool {
        self.canonical.contains(&normalize(path))
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}
