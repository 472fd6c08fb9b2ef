use super::{
    CompletedPart, Destination, Error, PartListing, PartsPage, RemotePath, UploadPartRequest,
    UploadPartResult,
};

/// Logs every backend call with its duration; failures are logged at WARN.
#[derive(Debug)]
pub struct LoggingDestination<D> {
    inner: D,
}

impl<D: Destination> LoggingDestination<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

fn log_outcome<T>(what: &str, target: &dyn std::fmt::Display, start: std::time::Instant, result: &Result<T, Error>) {
    let elapsed = start.elapsed();
    match result {
        Ok(_) => tracing::debug!("{} {}: ok in {:?}", what, target, elapsed),
        Err(error) => tracing::warn!("{} {}: failed in {:?}: {:#}", what, target, elapsed, error),
    }
}

impl<D: Destination> Destination for LoggingDestination<D> {
    fn remote_path(&self, relative_path: &str) -> RemotePath {
        self.inner.remote_path(relative_path)
    }

    async fn filter_uploadable_files(
        &self,
        relative_paths: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        let count = relative_paths.len();
        let start = std::time::Instant::now();
        let result = self.inner.filter_uploadable_files(relative_paths).await;
        log_outcome("filter uploadable files", &count, start, &result);
        if let Ok(remaining) = &result {
            tracing::debug!("{} of {} files still need uploading", remaining.len(), count);
        }
        result
    }

    async fn init_uploading(&self, remote_path: &RemotePath) -> Result<String, Error> {
        let start = std::time::Instant::now();
        let result = self.inner.init_uploading(remote_path).await;
        log_outcome("init uploading", remote_path, start, &result);
        result
    }

    async fn list_parts_page(
        &self,
        remote_path: &RemotePath,
        part_number_marker: Option<u32>,
    ) -> Result<Option<PartsPage>, Error> {
        let start = std::time::Instant::now();
        let result = self
            .inner
            .list_parts_page(remote_path, part_number_marker)
            .await;
        log_outcome("list parts", remote_path, start, &result);
        result
    }

    async fn get_already_uploaded_parts(
        &self,
        remote_path: &RemotePath,
    ) -> Result<Option<PartListing>, Error> {
        let result = self.inner.get_already_uploaded_parts(remote_path).await;
        match &result {
            Ok(Some(listing)) => tracing::debug!(
                "{}: open upload {} with {} parts",
                remote_path,
                listing.upload_id,
                listing.parts.len()
            ),
            Ok(None) => tracing::debug!("{}: no open upload", remote_path),
            Err(_) => {}
        }
        result
    }

    async fn upload_multi_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResult, Error> {
        let target = format!(
            "{} part {} ({})",
            request.remote_path,
            request.part_number,
            bytesize::ByteSize(request.size())
        );
        let start = std::time::Instant::now();
        let result = self.inner.upload_multi_part(request).await;
        log_outcome("upload", &target, start, &result);
        result
    }

    async fn commit_multipart_upload(
        &self,
        remote_path: &RemotePath,
        parts: Vec<CompletedPart>,
        upload_id: &str,
    ) -> Result<(), Error> {
        let count = parts.len();
        let start = std::time::Instant::now();
        let result = self
            .inner
            .commit_multipart_upload(remote_path, parts, upload_id)
            .await;
        log_outcome("commit", remote_path, start, &result);
        if result.is_ok() {
            tracing::info!("{}: committed {} parts", remote_path, count);
        }
        result
    }
}
