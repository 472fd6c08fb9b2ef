use super::{
    CompletedPart, Destination, Error, PartsPage, RemotePath, UploadPartRequest, UploadPartResult,
};

/// Takes a request token before every backend call and bandwidth tokens before every part.
///
/// The token buckets are the process-wide ones configured through the `throttle` crate; with
/// nothing configured this wrapper adds no waiting.
#[derive(Debug)]
pub struct ThrottledDestination<D> {
    inner: D,
    chunk_size: u64,
}

impl<D: Destination> ThrottledDestination<D> {
    pub fn new(inner: D, chunk_size: u64) -> Self {
        Self { inner, chunk_size }
    }
}

impl<D: Destination> Destination for ThrottledDestination<D> {
    fn remote_path(&self, relative_path: &str) -> RemotePath {
        self.inner.remote_path(relative_path)
    }

    async fn filter_uploadable_files(
        &self,
        relative_paths: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        throttle::get_ops_token().await;
        self.inner.filter_uploadable_files(relative_paths).await
    }

    async fn init_uploading(&self, remote_path: &RemotePath) -> Result<String, Error> {
        throttle::get_ops_token().await;
        self.inner.init_uploading(remote_path).await
    }

    async fn list_parts_page(
        &self,
        remote_path: &RemotePath,
        part_number_marker: Option<u32>,
    ) -> Result<Option<PartsPage>, Error> {
        throttle::get_ops_token().await;
        self.inner
            .list_parts_page(remote_path, part_number_marker)
            .await
    }

    async fn upload_multi_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResult, Error> {
        throttle::get_ops_token().await;
        throttle::get_part_iops_tokens(self.chunk_size, request.size()).await;
        self.inner.upload_multi_part(request).await
    }

    async fn commit_multipart_upload(
        &self,
        remote_path: &RemotePath,
        parts: Vec<CompletedPart>,
        upload_id: &str,
    ) -> Result<(), Error> {
        throttle::get_ops_token().await;
        self.inner
            .commit_multipart_upload(remote_path, parts, upload_id)
            .await
    }
}
