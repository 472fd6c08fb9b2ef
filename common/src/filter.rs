//! Include/exclude filtering of the files considered for upload
//!
//! Patterns use glob syntax:
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/`
//! - `?` matches a single character (except `/`)
//! - `[...]` character classes
//! - Leading `/` anchors the pattern to the synchronized root
//! - Trailing `/` matches only directories
//!
//! A path is accepted when no exclude pattern matches it and either there are no include
//! patterns or at least one of them matches. Lock files (see [`crate::lockfile`]) are always
//! rejected, regardless of the configured patterns.
//!
//! ```
//! use common::filter::{Filters, Verdict};
//! use std::path::Path;
//!
//! let mut filters = Filters::default();
//! filters.add_exclude("*.tmp").unwrap();
//!
//! assert!(matches!(
//!     filters.check(Path::new("video/part.tmp"), false),
//!     Verdict::ExcludedByPattern(_)
//! ));
//! assert!(filters.accepts(Path::new("video/stream.ts"), false));
//! // lock files never pass
//! assert!(!filters.accepts(Path::new("video/stream.ts.lock"), false));
//! ```

use anyhow::{Context, anyhow};
use std::path::Path;

/// A compiled glob pattern together with its original spelling
#[derive(Debug, Clone)]
pub struct Pattern {
    pub original: String,
    matcher: globset::GlobMatcher,
    /// pattern ends with `/` and only matches directories
    pub dir_only: bool,
    /// pattern starts with `/` and only matches from the root
    pub anchored: bool,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty pattern is not allowed"));
        }
        let dir_only = pattern.ends_with('/');
        let anchored = pattern.starts_with('/');
        let glob_str = pattern.trim_start_matches('/').trim_end_matches('/');
        if glob_str.is_empty() {
            return Err(anyhow!(
                "pattern '{}' results in empty glob after stripping / markers",
                pattern
            ));
        }
        let matcher = globset::GlobBuilder::new(glob_str)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob pattern: {}", pattern))?
            .compile_matcher();
        Ok(Self {
            original: pattern.to_string(),
            matcher,
            dir_only,
            anchored,
        })
    }

    /// Patterns with an inner `/` must match the whole relative path.
    fn is_path_pattern(&self) -> bool {
        self.core().contains('/')
    }

    fn core(&self) -> &str {
        self.original.trim_start_matches('/').trim_end_matches('/')
    }

    pub fn matches(&self, relative_path: &Path, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        if self.matcher.is_match(relative_path) {
            return true;
        }
        if self.anchored || self.is_path_pattern() {
            return false;
        }
        relative_path
            .file_name()
            .is_some_and(|name| self.matcher.is_match(Path::new(name)))
    }

    /// Could a directory at `dir_path` hold something this pattern matches?
    fn may_match_below(&self, dir_path: &Path) -> bool {
        if !self.anchored && !self.is_path_pattern() {
            return true;
        }
        let prefix = literal_prefix(self.core());
        let dir = dir_path.to_string_lossy();
        if prefix.is_empty() || dir.is_empty() {
            return true;
        }
        // dir is an ancestor of (or equal to) the literal prefix
        if let Some(rest) = prefix.strip_prefix(&*dir) {
            if rest.is_empty() || rest.starts_with('/') {
                return true;
            }
        }
        // dir is inside the literal prefix
        if let Some(rest) = dir.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with('/') {
                return true;
            }
        }
        false
    }
}

/// Portion of a glob before its first wildcard, cut back to a whole path component.
fn literal_prefix(pattern: &str) -> &str {
    let Some(wildcard) = pattern.find(['*', '?', '[']) else {
        return pattern;
    };
    match pattern[..wildcard].rfind('/') {
        Some(slash) => &pattern[..slash],
        None => "",
    }
}

/// Outcome of checking a path against [`Filters`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Included,
    /// include patterns exist but none matched
    ExcludedByDefault,
    ExcludedByPattern(String),
    LockFile,
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub includes: Vec<Pattern>,
    pub excludes: Vec<Pattern>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_include(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.includes.push(Pattern::parse(pattern)?);
        Ok(())
    }

    pub fn add_exclude(&mut self, pattern: &str) -> Result<(), anyhow::Error> {
        self.excludes.push(Pattern::parse(pattern)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Build filters from CLI style include/exclude lists.
    pub fn from_patterns(includes: &[String], excludes: &[String]) -> Result<Self, anyhow::Error> {
        let mut filters = Self::new();
        for pattern in includes {
            filters.add_include(pattern)?;
        }
        for pattern in excludes {
            filters.add_exclude(pattern)?;
        }
        Ok(filters)
    }

    pub fn check(&self, relative_path: &Path, is_dir: bool) -> Verdict {
        if !is_dir && crate::lockfile::is_lock_file(relative_path) {
            return Verdict::LockFile;
        }
        if let Some(pattern) = self
            .excludes
            .iter()
            .find(|pattern| pattern.matches(relative_path, is_dir))
        {
            return Verdict::ExcludedByPattern(pattern.original.clone());
        }
        if self.includes.is_empty() {
            return Verdict::Included;
        }
        if self
            .includes
            .iter()
            .any(|pattern| pattern.matches(relative_path, is_dir))
        {
            return Verdict::Included;
        }
        // keep walking directories that may hold included files
        if is_dir
            && self
                .includes
                .iter()
                .any(|pattern| pattern.may_match_below(relative_path))
        {
            return Verdict::Included;
        }
        Verdict::ExcludedByDefault
    }

    pub fn accepts(&self, relative_path: &Path, is_dir: bool) -> bool {
        self.check(relative_path, is_dir) == Verdict::Included
    }

    /// Parse a filter file
    ///
    /// ```text
    /// # comments are allowed
    /// --include *.ts
    /// --exclude scratch/
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file: {:?}", path))?;
        Self::parse_content(&content)
    }

    pub fn parse_content(content: &str) -> Result<Self, anyhow::Error> {
        let mut filters = Self::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_num = idx + 1;
            if let Some(pattern) = line.strip_prefix("--include ") {
                filters
                    .add_include(pattern.trim())
                    .with_context(|| format!("line {}: invalid include pattern", line_num))?;
            } else if let Some(pattern) = line.strip_prefix("--exclude ") {
                filters
                    .add_exclude(pattern.trim())
                    .with_context(|| format!("line {}: invalid exclude pattern", line_num))?;
            } else {
                return Err(anyhow!(
                    "line {}: invalid syntax '{}', expected '--include PATTERN' or '--exclude PATTERN'",
                    line_num,
                    line
                ));
            }
        }
        Ok(filters)
    }
}
