//! Enumerates the local files to synchronize

use anyhow::{Context, anyhow};
use async_recursion::async_recursion;
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::filter::{Filters, Verdict};

/// A file to upload, with its path relative to the synchronized root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub local_path: PathBuf,
    /// `/`-separated, used to build the remote key
    pub relative_path: String,
}

#[derive(Debug, Clone)]
pub struct Source {
    root: PathBuf,
    recursive: bool,
    filters: Filters,
}

fn relative_key(relative: &Path) -> anyhow::Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| anyhow!("path {:?} is not valid UTF-8", relative))?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

impl Source {
    pub fn new(root: PathBuf, recursive: bool, filters: Filters) -> Self {
        Self {
            root,
            recursive,
            filters,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files under the root that pass the filters, sorted by relative path.
    ///
    /// A root that is a file yields just that file, keyed by its name. Symlinks below the root
    /// are not followed.
    #[instrument(skip(self), fields(root = ?self.root))]
    pub async fn list_files(&self) -> anyhow::Result<Vec<SourceFile>> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("cannot read source {:?}", &self.root))?;
        let mut files = Vec::new();
        if metadata.is_file() {
            let name = self
                .root
                .file_name()
                .ok_or_else(|| anyhow!("source {:?} has no file name", &self.root))?;
            let relative = Path::new(name);
            if self.filters.accepts(relative, false) {
                files.push(SourceFile {
                    local_path: self.root.clone(),
                    relative_path: relative_key(relative)?,
                });
            }
            return Ok(files);
        }
        self.walk(&self.root, Path::new(""), &mut files).await?;
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        tracing::debug!("found {} files", files.len());
        Ok(files)
    }

    #[async_recursion]
    async fn walk(
        &self,
        dir: &Path,
        relative_dir: &Path,
        files: &mut Vec<SourceFile>,
    ) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed reading file type of {:?}", entry.path()))?;
            let relative = relative_dir.join(entry.file_name());
            if file_type.is_symlink() {
                tracing::debug!("skipping symlink {:?}", &relative);
                continue;
            }
            if file_type.is_dir() {
                if !self.recursive {
                    continue;
                }
                if let Verdict::ExcludedByPattern(pattern) = self.filters.check(&relative, true) {
                    tracing::debug!("skipping directory {:?}, excluded by '{}'", &relative, pattern);
                    continue;
                }
                self.walk(&entry.path(), &relative, files).await?;
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            match self.filters.check(&relative, false) {
                Verdict::Included => {}
                verdict => {
                    tracing::trace!("skipping {:?}: {:?}", &relative, verdict);
                    continue;
                }
            }
            match relative_key(&relative) {
                Ok(relative_path) => files.push(SourceFile {
                    local_path: entry.path(),
                    relative_path,
                }),
                Err(error) => tracing::warn!("skipping file: {:#}", &error),
            }
        }
        Ok(())
    }
}
