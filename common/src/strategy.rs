//! One upload attempt of one file, end to end

use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

use crate::checksum::ChecksumAlgorithm;
use crate::destination::{Destination, ProgressCallback};
use crate::lockfile::ProcessProbe;
use crate::multipart::MultipartUploadFile;
use crate::progress::ProgressListener;
use crate::upload::Error;
use crate::uploader::{ConcurrentMultipartUploader, PartUploadHandle};

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// part uploads running at the same time, at least 1
    pub threads: usize,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub drain_timeout: std::time::Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: 4,
            checksum_algorithm: ChecksumAlgorithm::default(),
            drain_timeout: crate::uploader::DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// the remote object is complete
    Committed,
    /// the file is still being written, the session stays open
    InProgress,
}

/// What one attempt achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReport {
    pub outcome: FileOutcome,
    pub parts_uploaded: u64,
    pub bytes_uploaded: u64,
}

/// Uploads what is missing of a file, then commits it once its writer is done.
pub struct MultipartUploadFileUploadingStrategy<D: Destination> {
    destination: Arc<D>,
    listener: Arc<dyn ProgressListener>,
    probe: Arc<dyn ProcessProbe>,
    settings: Settings,
}

impl<D: Destination> MultipartUploadFileUploadingStrategy<D> {
    pub fn new(
        destination: Arc<D>,
        listener: Arc<dyn ProgressListener>,
        probe: Arc<dyn ProcessProbe>,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        if settings.threads == 0 {
            return Err(anyhow::anyhow!("number of upload threads must be at least 1"));
        }
        Ok(Self {
            destination,
            listener,
            probe,
            settings,
        })
    }

    pub fn destination(&self) -> &Arc<D> {
        &self.destination
    }

    /// Runs one attempt for `local_path`, stored under `relative_path`.
    ///
    /// Failed parts are logged and left for the next attempt; every other part still uploads.
    /// The attempt then fails with [`Error::PartsFailed`] without committing.
    #[instrument(skip(self))]
    pub async fn upload(&self, local_path: &Path, relative_path: &str) -> Result<FileReport, Error> {
        let remote_path = self.destination.remote_path(relative_path);
        let mut file = MultipartUploadFile::new(
            local_path,
            remote_path,
            self.destination.clone(),
            self.settings.checksum_algorithm,
            self.probe.as_ref(),
        )
        .await?;
        file.validate_uploaded_file_size().await?;
        let uploader = ConcurrentMultipartUploader::new(self.destination.clone(), self.settings.threads)
            .map_err(Error::Io)?;
        let upload_id = file.upload_id().to_string();
        self.listener.upload_file_started(local_path, &upload_id);
        let progress: ProgressCallback = {
            let listener = self.listener.clone();
            let upload_id = upload_id.clone();
            Arc::new(move |bytes| listener.upload_file_progress(&upload_id, bytes))
        };
        let mut handles: Vec<PartUploadHandle> = Vec::new();
        {
            let mut failed_parts = std::pin::pin!(file.stream_upload_part_request_for_failed_parts());
            while let Some(mut request) = failed_parts.next().await {
                tracing::debug!("re-uploading missing part {}", request.part_number);
                request.progress = Some(progress.clone());
                handles.push(uploader.submit_task_for_part_uploading(request).await);
            }
        }
        {
            let mut new_parts =
                std::pin::pin!(file.stream_upload_part_request_for_incomplete_parts());
            while let Some(mut request) = new_parts.next().await {
                request.progress = Some(progress.clone());
                handles.push(uploader.submit_task_for_part_uploading(request).await);
            }
        }
        if let Err(error) = uploader
            .shutdown_and_await_termination(self.settings.drain_timeout)
            .await
        {
            self.listener.upload_file_finished(local_path);
            return Err(error);
        }
        let mut parts_uploaded = 0;
        let mut bytes_uploaded = 0;
        let mut failed = Vec::new();
        for handle in handles {
            let part_number = handle.part_number();
            match handle.outcome().await {
                Ok(result) => {
                    parts_uploaded += 1;
                    bytes_uploaded += result.size;
                    self.listener.upload_part_finished(&upload_id, result.part_number);
                    file.add_uploaded_part(result);
                }
                Err(error) => {
                    tracing::warn!(
                        "{}: part {} not uploaded, will retry later: {:#}",
                        file.remote_path(),
                        part_number,
                        &error
                    );
                    file.add_failed_part(part_number);
                    failed.push(part_number);
                }
            }
        }
        let committed = file.commit_if_finished_writing().await;
        self.listener.upload_file_finished(local_path);
        let committed = committed?;
        if !failed.is_empty() {
            return Err(Error::PartsFailed { parts: failed });
        }
        if file.sequential_read_failed() {
            return Err(Error::Io(anyhow::anyhow!(
                "reading {:?} failed, upload left open",
                local_path
            )));
        }
        let outcome = if committed {
            tracing::info!("{}: upload complete", file.remote_path());
            FileOutcome::Committed
        } else {
            FileOutcome::InProgress
        };
        Ok(FileReport {
            outcome,
            parts_uploaded,
            bytes_uploaded,
        })
    }
}
