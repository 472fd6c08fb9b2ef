//! Synchronizes a local folder into a [`Destination`]
//!
//! Files are handled one after another; each gets a bounded number of whole-file attempts.
//! A failed file does not stop the run unless `fail_early` is set.

use anyhow::anyhow;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::instrument;

use crate::destination::Destination;
use crate::progress::Progress;
use crate::source::Source;
use crate::strategy::{FileOutcome, FileReport, MultipartUploadFileUploadingStrategy};

/// Error returned by [`FolderSynchronizer::sync`], with what was done before the failure
///
/// # Logging Convention
/// Log with `{:#}` to see the whole cause chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// whole-file attempts, at least 1
    pub max_attempts: usize,
    /// waited after the first failed attempt, growing linearly
    pub retry_delay: std::time::Duration,
    pub fail_early: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: std::time::Duration::from_secs(1),
            fail_early: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_checked: usize,
    /// already complete remotely
    pub files_skipped: usize,
    pub files_uploaded: usize,
    /// still being written, uploaded as far as possible
    pub files_in_progress: usize,
    pub files_failed: usize,
    pub parts_uploaded: u64,
    pub bytes_uploaded: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_checked: self.files_checked + other.files_checked,
            files_skipped: self.files_skipped + other.files_skipped,
            files_uploaded: self.files_uploaded + other.files_uploaded,
            files_in_progress: self.files_in_progress + other.files_in_progress,
            files_failed: self.files_failed + other.files_failed,
            parts_uploaded: self.parts_uploaded + other.parts_uploaded,
            bytes_uploaded: self.bytes_uploaded + other.bytes_uploaded,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "files checked: {}\n\
            files skipped: {}\n\
            files uploaded: {}\n\
            files in progress: {}\n\
            files failed: {}\n\
            parts uploaded: {}\n\
            bytes uploaded: {}",
            self.files_checked,
            self.files_skipped,
            self.files_uploaded,
            self.files_in_progress,
            self.files_failed,
            self.parts_uploaded,
            bytesize::ByteSize(self.bytes_uploaded)
        )
    }
}

impl Summary {
    fn record(&mut self, report: &FileReport) {
        self.parts_uploaded += report.parts_uploaded;
        self.bytes_uploaded += report.bytes_uploaded;
        match report.outcome {
            FileOutcome::Committed => self.files_uploaded += 1,
            FileOutcome::InProgress => self.files_in_progress += 1,
        }
    }
}

pub struct FolderSynchronizer<D: Destination> {
    source: Source,
    strategy: MultipartUploadFileUploadingStrategy<D>,
    settings: Settings,
    progress: Option<&'static Progress>,
}

impl<D: Destination> FolderSynchronizer<D> {
    pub fn new(
        source: Source,
        strategy: MultipartUploadFileUploadingStrategy<D>,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        if settings.max_attempts == 0 {
            return Err(anyhow!("max attempts must be at least 1"));
        }
        Ok(Self {
            source,
            strategy,
            settings,
            progress: None,
        })
    }

    /// Also report file outcomes into `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: &'static Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs attempts for one file until it succeeds, fails for good, or runs out of attempts.
    async fn upload_with_retries(
        &self,
        local_path: &std::path::Path,
        relative_path: &str,
    ) -> Result<FileReport, crate::upload::Error> {
        let mut attempt = 1;
        loop {
            match self.strategy.upload(local_path, relative_path).await {
                Ok(report) => return Ok(report),
                Err(error) if !error.is_retryable() || attempt >= self.settings.max_attempts => {
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.settings.retry_delay * attempt as u32;
                    tracing::warn!(
                        "{:?}: attempt {}/{} failed, retrying in {}: {:#}",
                        local_path,
                        attempt,
                        self.settings.max_attempts,
                        humantime::format_duration(delay),
                        &error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    #[instrument(skip(self), fields(root = ?self.source.root()))]
    pub async fn sync(&self) -> Result<Summary, Error> {
        let mut summary = Summary::default();
        let files = self
            .source
            .list_files()
            .await
            .map_err(|err| Error::new(err, summary))?;
        summary.files_checked = files.len();
        let mut local_paths: HashMap<String, PathBuf> = files
            .into_iter()
            .map(|file| (file.relative_path, file.local_path))
            .collect();
        let mut candidates: Vec<String> = local_paths.keys().cloned().collect();
        candidates.sort();
        let mut remaining = self
            .strategy
            .destination()
            .filter_uploadable_files(candidates)
            .await
            .map_err(|err| Error::new(err.into(), summary))?;
        remaining.sort();
        summary.files_skipped = summary.files_checked.saturating_sub(remaining.len());
        if let Some(progress) = self.progress {
            progress.files_skipped.add(summary.files_skipped as u64);
        }
        tracing::info!(
            "{} files to upload, {} already complete",
            remaining.len(),
            summary.files_skipped
        );
        let mut failed = Vec::new();
        for relative_path in remaining {
            let Some(local_path) = local_paths.remove(&relative_path) else {
                tracing::warn!("destination returned unknown path '{}'", &relative_path);
                continue;
            };
            match self.upload_with_retries(&local_path, &relative_path).await {
                Ok(report) => {
                    summary.record(&report);
                    if let Some(progress) = self.progress {
                        match report.outcome {
                            FileOutcome::Committed => progress.files_committed.inc(),
                            FileOutcome::InProgress => progress.files_in_progress.inc(),
                        }
                    }
                }
                Err(error) => {
                    tracing::error!("{:?}: upload failed: {:#}", &local_path, &error);
                    summary.files_failed += 1;
                    if let Some(progress) = self.progress {
                        progress.files_failed.inc();
                    }
                    if self.settings.fail_early {
                        return Err(Error::new(
                            anyhow::Error::new(error)
                                .context(format!("failed uploading {:?}", &local_path)),
                            summary,
                        ));
                    }
                    failed.push(relative_path);
                }
            }
        }
        if !failed.is_empty() {
            return Err(Error::new(
                anyhow!("{} files failed to upload: {}", failed.len(), failed.join(", ")),
                summary,
            ));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MIN_PART_SIZE;
    use crate::filter::Filters;
    use crate::progress::NoopListener;
    use crate::strategy;
    use crate::testutils::{self, FakeProbe, MemoryDestination, UploadRecord};
    use std::sync::Arc;
    use tracing_test::traced_test;

    const MIB: u64 = 1024 * 1024;

    fn synchronizer(
        root: &std::path::Path,
        destination: &Arc<MemoryDestination>,
        settings: Settings,
    ) -> anyhow::Result<FolderSynchronizer<MemoryDestination>> {
        let strategy = MultipartUploadFileUploadingStrategy::new(
            destination.clone(),
            Arc::new(NoopListener),
            Arc::new(FakeProbe::alive(&[std::process::id()])),
            strategy::Settings::default(),
        )?;
        FolderSynchronizer::new(
            Source::new(root.to_path_buf(), true, Filters::new()),
            strategy,
            settings,
        )
    }

    fn quick() -> Settings {
        Settings {
            retry_delay: std::time::Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn new_file_is_split_and_existing_file_left_alone() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::write(tmp.path().join("a.txt"), "already there").await?;
        let data = testutils::write_pattern(&tmp.path().join("b.txt"), 12 * MIB).await?;
        let destination = Arc::new(MemoryDestination::new(""));
        destination.insert_object("a.txt", b"already there");
        let summary = synchronizer(tmp.path(), &destination, quick())?.sync().await?;
        assert_eq!(destination.calls().filter, 1);
        assert_eq!(destination.inits(), vec!["b.txt".to_string()]);
        let record = |part_number, size, is_last| UploadRecord {
            key: "b.txt".to_string(),
            part_number,
            size,
            is_last,
        };
        let mut uploads = destination.uploads();
        uploads.sort_by_key(|u| u.part_number);
        assert_eq!(
            uploads,
            vec![
                record(1, 5 * MIB, false),
                record(2, 5 * MIB, false),
                record(3, 2 * MIB, true)
            ]
        );
        let commits = destination.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].key, "b.txt");
        assert_eq!(commits[0].part_numbers, vec![1, 2, 3]);
        assert_eq!(destination.calls().list_parts, 1);
        assert_eq!(destination.object("b.txt").map(|o| o.to_vec()), Some(data));
        assert_eq!(
            summary,
            Summary {
                files_checked: 2,
                files_skipped: 1,
                files_uploaded: 1,
                files_in_progress: 0,
                files_failed: 0,
                parts_uploaded: 3,
                bytes_uploaded: 12 * MIB,
            }
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn second_run_uploads_nothing() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        testutils::write_pattern(&tmp.path().join("a.ts"), 6 * MIB).await?;
        tokio::fs::create_dir(tmp.path().join("cam")).await?;
        testutils::write_pattern(&tmp.path().join("cam").join("b.ts"), 10).await?;
        tokio::fs::write(tmp.path().join("empty.ts"), b"").await?;
        let destination = Arc::new(MemoryDestination::new("rec"));
        let synchronizer = synchronizer(tmp.path(), &destination, quick())?;
        let first = synchronizer.sync().await?;
        assert_eq!(first.files_uploaded, 3);
        let before = destination.calls();
        let second = synchronizer.sync().await?;
        let after = destination.calls();
        assert_eq!(after.upload_part, before.upload_part);
        assert_eq!(after.commit, before.commit);
        assert_eq!(after.init, before.init);
        assert_eq!(second.files_skipped, 3);
        assert_eq!(second.files_uploaded, 0);
        assert!(destination.object("rec/cam/b.ts").is_some());
        assert_eq!(destination.object("rec/empty.ts").map(|o| o.len()), Some(0));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn locked_file_stays_in_progress_until_unlocked() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("live.ts");
        testutils::write_pattern(&path, MIN_PART_SIZE + 1).await?;
        testutils::lock(&path).await?;
        let destination = Arc::new(MemoryDestination::new(""));
        let synchronizer = synchronizer(tmp.path(), &destination, quick())?;
        let first = synchronizer.sync().await?;
        assert_eq!(first.files_checked, 1);
        assert_eq!(first.files_in_progress, 1);
        assert_eq!(destination.uploaded_part_numbers("live.ts"), vec![1]);
        testutils::unlock(&path).await?;
        let second = synchronizer.sync().await?;
        assert_eq!(second.files_uploaded, 1);
        assert_eq!(destination.uploaded_part_numbers("live.ts"), vec![1, 2]);
        assert_eq!(destination.commits()[0].part_numbers, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_file_is_retried_then_reported() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        testutils::write_pattern(&tmp.path().join("a.ts"), 10).await?;
        testutils::write_pattern(&tmp.path().join("b.ts"), 10).await?;
        let destination = Arc::new(MemoryDestination::new(""));
        destination.fail_part(1);
        let error = synchronizer(tmp.path(), &destination, quick())?
            .sync()
            .await
            .unwrap_err();
        // each file: three attempts, every one uploading part 1
        assert_eq!(destination.calls().upload_part, 6);
        assert_eq!(error.summary.files_failed, 2);
        assert!(format!("{:#}", error).contains("2 files failed to upload"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn fail_early_stops_at_first_failure() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        testutils::write_pattern(&tmp.path().join("a.ts"), 10).await?;
        testutils::write_pattern(&tmp.path().join("b.ts"), 10).await?;
        let destination = Arc::new(MemoryDestination::new(""));
        destination.fail_part(1);
        let settings = Settings {
            max_attempts: 1,
            fail_early: true,
            ..quick()
        };
        let error = synchronizer(tmp.path(), &destination, settings)?
            .sync()
            .await
            .unwrap_err();
        assert_eq!(destination.inits(), vec!["a.ts".to_string()]);
        assert_eq!(error.summary.files_failed, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn size_violation_is_not_retried() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("a.ts");
        testutils::write_pattern(&path, 10).await?;
        let destination = Arc::new(MemoryDestination::new(""));
        let remote = destination.remote_path("a.ts");
        destination.init_uploading(&remote).await?;
        destination.insert_part(&remote, 1, testutils::pattern(MIN_PART_SIZE));
        let error = synchronizer(tmp.path(), &destination, quick())?
            .sync()
            .await
            .unwrap_err();
        assert_eq!(destination.calls().list_parts, 1);
        assert_eq!(destination.calls().upload_part, 0);
        assert_eq!(error.summary.files_failed, 1);
        Ok(())
    }

    #[test]
    fn zero_attempts_rejected() {
        let destination = Arc::new(MemoryDestination::new(""));
        let settings = Settings {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(synchronizer(std::path::Path::new("."), &destination, settings).is_err());
    }

    #[test]
    fn summaries_add_up() {
        let one = Summary {
            files_checked: 2,
            files_uploaded: 1,
            parts_uploaded: 3,
            bytes_uploaded: 100,
            ..Default::default()
        };
        let total = one + one;
        assert_eq!(total.files_checked, 4);
        assert_eq!(total.parts_uploaded, 6);
        assert!(format!("{}", total).contains("files uploaded: 2"));
    }
}
