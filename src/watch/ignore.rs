//! Path ignore rules for watched projects.
//!
//! A built-in set of build/dependency/VCS directories is always ignored;
//! caller patterns are added on top. Plain names match any path component,
//! patterns containing `*`, `?` or `[` are globs over the relative path or
//! over a single component.

use glob::{MatchOptions, Pattern};

use crate::log;

/// Always ignored, whatever the caller passes.
pub const DEFAULT_IGNORES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".cache",
    ".turbo",
    "coverage",
    "target",
    ".svelte-kit",
    ".vite",
];

/// `*` and `?` stay within one component, `**` spans directories.
const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct IgnoreSet {
    names: Vec<String>,
    globs: Vec<Pattern>,
}

impl IgnoreSet {
    /// Built-in defaults plus `extra`.
    pub fn new<S: AsRef<str>>(extra: &[S]) -> Self {
        let mut set = Self {
            names: DEFAULT_IGNORES.iter().map(|s| (*s).to_owned()).collect(),
            globs: Vec::new(),
        };
        for pattern in extra {
            set.add(pattern.as_ref());
        }
        set
    }

    fn add(&mut self, pattern: &str) {
        let pattern = pattern.trim().trim_matches('/');
        if pattern.is_empty() {
            return;
        }
        if !pattern.contains(['*', '?', '[']) {
            if !self.names.iter().any(|n| n == pattern) {
                self.names.push(pattern.to_owned());
            }
            return;
        }
        match Pattern::new(pattern) {
            Ok(glob) => self.globs.push(glob),
            Err(err) => log!("warning"; "ignoring watch pattern `{}`: {}", pattern, err),
        }
    }

    /// `relative` uses `/` separators and no leading slash.
    pub fn is_ignored(&self, relative: &str) -> bool {
        let mut components = relative.split('/').filter(|c| !c.is_empty());
        if components.any(|c| self.names.iter().any(|n| n == c)) {
            return true;
        }
        self.globs.iter().any(|glob| {
            glob.matches_with(relative, MATCH)
                || relative.split('/').any(|c| glob.matches_with(c, MATCH))
        })
    }

    pub fn glob_count(&self) -> usize {
        self.globs.len()
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new::<&str>(&[])
    }
}
