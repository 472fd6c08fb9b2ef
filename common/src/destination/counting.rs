use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    CompletedPart, Destination, Error, PartsPage, RemotePath, UploadPartRequest, UploadPartResult,
};

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct DestinationStats {
    pub filter_calls: AtomicU64,
    pub init_calls: AtomicU64,
    pub list_calls: AtomicU64,
    pub upload_calls: AtomicU64,
    pub upload_failures: AtomicU64,
    pub commit_calls: AtomicU64,
    pub bytes_uploaded: AtomicU64,
}

impl std::fmt::Display for DestinationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "existence checks: {}\n\
            sessions started: {}\n\
            part listings: {}\n\
            part uploads: {} ({} failed)\n\
            commits: {}\n\
            bytes sent: {}",
            self.filter_calls.load(Ordering::Relaxed),
            self.init_calls.load(Ordering::Relaxed),
            self.list_calls.load(Ordering::Relaxed),
            self.upload_calls.load(Ordering::Relaxed),
            self.upload_failures.load(Ordering::Relaxed),
            self.commit_calls.load(Ordering::Relaxed),
            bytesize::ByteSize(self.bytes_uploaded.load(Ordering::Relaxed)),
        )
    }
}

/// Counts backend calls and uploaded bytes.
#[derive(Debug)]
pub struct CountingDestination<D> {
    inner: D,
    stats: std::sync::Arc<DestinationStats>,
}

impl<D: Destination> CountingDestination<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            stats: Default::default(),
        }
    }

    /// Shared handle, stays readable after the destination is dropped.
    pub fn stats(&self) -> std::sync::Arc<DestinationStats> {
        self.stats.clone()
    }
}

impl<D: Destination> Destination for CountingDestination<D> {
    fn remote_path(&self, relative_path: &str) -> RemotePath {
        self.inner.remote_path(relative_path)
    }

    async fn filter_uploadable_files(
        &self,
        relative_paths: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        self.stats.filter_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.filter_uploadable_files(relative_paths).await
    }

    async fn init_uploading(&self, remote_path: &RemotePath) -> Result<String, Error> {
        self.stats.init_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.init_uploading(remote_path).await
    }

    async fn list_parts_page(
        &self,
        remote_path: &RemotePath,
        part_number_marker: Option<u32>,
    ) -> Result<Option<PartsPage>, Error> {
        self.stats.list_calls.fetch_add(1, Ordering::Relaxed);
        self.inner
            .list_parts_page(remote_path, part_number_marker)
            .await
    }

    async fn upload_multi_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResult, Error> {
        self.stats.upload_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.upload_multi_part(request).await;
        match &result {
            Ok(uploaded) => {
                self.stats
                    .bytes_uploaded
                    .fetch_add(uploaded.size, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.upload_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn commit_multipart_upload(
        &self,
        remote_path: &RemotePath,
        parts: Vec<CompletedPart>,
        upload_id: &str,
    ) -> Result<(), Error> {
        self.stats.commit_calls.fetch_add(1, Ordering::Relaxed);
        self.inner
            .commit_multipart_upload(remote_path, parts, upload_id)
            .await
    }
}
