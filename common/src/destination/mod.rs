//! Remote blob store contract used by the upload engine
//!
//! A [`Destination`] exposes the multipart upload primitives of an object store: start a
//! session, list the parts it already holds, upload one part, and commit the assembled object.
//! Everything else in the engine is written against this trait only.
//!
//! Implementations compose by wrapping:
//!
//! ```rust,no_run
//! use common::destination::{CountingDestination, LocalDestination, LoggingDestination};
//!
//! let backend = LocalDestination::new("/srv/bucket".into(), "recordings");
//! let destination = CountingDestination::new(LoggingDestination::new(backend));
//! ```

mod counting;
mod local;
mod logging;
mod throttled;

pub use counting::{CountingDestination, DestinationStats};
pub use local::LocalDestination;
pub use logging::LoggingDestination;
pub use throttled::ThrottledDestination;

use bytes::Bytes;
use std::future::Future;

use crate::checksum::ChecksumAlgorithm;

/// Key of an object in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// `prefix/relative`, with an empty prefix meaning the bucket root.
    pub fn with_prefix(prefix: &str, relative_path: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let relative_path = relative_path.trim_start_matches('/');
        if prefix.is_empty() {
            Self(relative_path.to_string())
        } else {
            Self(format!("{}/{}", prefix, relative_path))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FilterUploadableFiles,
    InitUploading,
    ListParts,
    UploadPart,
    Commit,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::FilterUploadableFiles => "filter uploadable files",
            Operation::InitUploading => "init uploading",
            Operation::ListParts => "list parts",
            Operation::UploadPart => "upload part",
            Operation::Commit => "commit multipart upload",
        };
        f.write_str(name)
    }
}

/// A failed backend call.
///
/// # Logging Convention
/// Display shows the whole chain, log it with `{}` or `{:#}`.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed for '{remote_path}': {source:#}")]
pub struct Error {
    pub operation: Operation,
    pub remote_path: String,
    #[source]
    pub source: anyhow::Error,
}

impl Error {
    #[must_use]
    pub fn new(operation: Operation, remote_path: &RemotePath, source: anyhow::Error) -> Self {
        Self {
            operation,
            remote_path: remote_path.to_string(),
            source,
        }
    }
}

/// A part the backend already holds for an open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub size: u64,
    pub etag: String,
}

/// One page of a part listing.
#[derive(Debug, Clone)]
pub struct PartsPage {
    pub upload_id: String,
    pub parts: Vec<UploadedPart>,
    pub is_truncated: bool,
    /// continue listing after this part number
    pub next_part_number_marker: Option<u32>,
}

/// All parts of an open multipart session
#[derive(Debug, Clone)]
pub struct PartListing {
    pub upload_id: String,
    pub parts: Vec<UploadedPart>,
}

/// Part number and ETag, as passed to commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

pub type ProgressCallback = std::sync::Arc<dyn Fn(u64) + Send + Sync>;

/// Everything needed to upload one part.
#[derive(Clone)]
pub struct UploadPartRequest {
    pub remote_path: RemotePath,
    pub upload_id: String,
    pub part_number: u32,
    pub checksum_algorithm: ChecksumAlgorithm,
    /// base64 digest of `data`
    pub content_digest: String,
    pub data: Bytes,
    /// final part of a finished file, may be shorter than the minimum part size
    pub is_last: bool,
    /// called with the number of bytes transferred
    pub progress: Option<ProgressCallback>,
}

impl UploadPartRequest {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn report_progress(&self, bytes: u64) {
        if let Some(progress) = &self.progress {
            progress(bytes);
        }
    }
}

impl std::fmt::Debug for UploadPartRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPartRequest")
            .field("remote_path", &self.remote_path)
            .field("upload_id", &self.upload_id)
            .field("part_number", &self.part_number)
            .field("size", &self.data.len())
            .field("content_digest", &self.content_digest)
            .field("is_last", &self.is_last)
            .finish()
    }
}

/// Request template with the session already bound; the engine fills in the part.
#[derive(Debug, Clone)]
pub struct UploadPartTemplate {
    pub remote_path: RemotePath,
    pub upload_id: String,
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl UploadPartTemplate {
    pub fn build(
        &self,
        part_number: u32,
        data: Bytes,
        is_last: bool,
        progress: Option<ProgressCallback>,
    ) -> UploadPartRequest {
        UploadPartRequest {
            remote_path: self.remote_path.clone(),
            upload_id: self.upload_id.clone(),
            part_number,
            checksum_algorithm: self.checksum_algorithm,
            content_digest: crate::checksum::digest(&data, self.checksum_algorithm),
            data,
            is_last,
            progress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPartResult {
    pub part_number: u32,
    pub size: u64,
    pub etag: String,
}

impl UploadPartResult {
    pub fn completed(&self) -> CompletedPart {
        CompletedPart {
            part_number: self.part_number,
            etag: self.etag.clone(),
        }
    }
}

/// Remote object store capable of multipart uploads.
///
/// Implementations are shared by all part-upload workers and must be safe for concurrent use.
pub trait Destination: Send + Sync + 'static {
    /// Remote key for a path relative to the synchronized root.
    fn remote_path(&self, relative_path: &str) -> RemotePath;

    /// The subset of `relative_paths` not yet fully present remotely.
    fn filter_uploadable_files(
        &self,
        relative_paths: Vec<String>,
    ) -> impl Future<Output = Result<Vec<String>, Error>> + Send;

    /// Starts a new multipart session, returning its upload id.
    fn init_uploading(
        &self,
        remote_path: &RemotePath,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    /// One page of the parts of the open session for `remote_path`, `None` without a session.
    fn list_parts_page(
        &self,
        remote_path: &RemotePath,
        part_number_marker: Option<u32>,
    ) -> impl Future<Output = Result<Option<PartsPage>, Error>> + Send;

    /// All parts of the open session for `remote_path`, following pagination.
    fn get_already_uploaded_parts(
        &self,
        remote_path: &RemotePath,
    ) -> impl Future<Output = Result<Option<PartListing>, Error>> + Send {
        async move {
            let Some(first) = self.list_parts_page(remote_path, None).await? else {
                return Ok(None);
            };
            let upload_id = first.upload_id.clone();
            let mut parts = first.parts;
            let mut truncated = first.is_truncated;
            let mut marker = first.next_part_number_marker;
            while truncated {
                let Some(page) = self.list_parts_page(remote_path, marker).await? else {
                    return Err(Error::new(
                        Operation::ListParts,
                        remote_path,
                        anyhow::anyhow!("upload {} vanished while listing its parts", upload_id),
                    ));
                };
                if page.next_part_number_marker.is_some() && page.next_part_number_marker == marker
                {
                    return Err(Error::new(
                        Operation::ListParts,
                        remote_path,
                        anyhow::anyhow!("part listing did not advance past marker {:?}", marker),
                    ));
                }
                parts.extend(page.parts);
                truncated = page.is_truncated;
                marker = page.next_part_number_marker;
            }
            Ok(Some(PartListing { upload_id, parts }))
        }
    }

    fn create_upload_part_request(
        &self,
        remote_path: &RemotePath,
        upload_id: &str,
        checksum_algorithm: ChecksumAlgorithm,
    ) -> UploadPartTemplate {
        UploadPartTemplate {
            remote_path: remote_path.clone(),
            upload_id: upload_id.to_string(),
            checksum_algorithm,
        }
    }

    fn upload_multi_part(
        &self,
        request: UploadPartRequest,
    ) -> impl Future<Output = Result<UploadPartResult, Error>> + Send;

    /// Assembles the object from `parts`, which must be sorted by part number.
    fn commit_multipart_upload(
        &self,
        remote_path: &RemotePath,
        parts: Vec<CompletedPart>,
        upload_id: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MemoryDestination;

    #[test]
    fn remote_path_joins_prefix() {
        assert_eq!(RemotePath::with_prefix("", "a/b.ts").as_str(), "a/b.ts");
        assert_eq!(RemotePath::with_prefix("rec/", "a.ts").as_str(), "rec/a.ts");
        assert_eq!(RemotePath::with_prefix("/rec", "/a.ts").as_str(), "rec/a.ts");
    }

    #[test]
    fn template_fills_digest() {
        let template = UploadPartTemplate {
            remote_path: RemotePath::new("k"),
            upload_id: "u".to_string(),
            checksum_algorithm: ChecksumAlgorithm::Sha256,
        };
        let request = template.build(3, Bytes::from_static(b"abc"), true, None);
        assert_eq!(request.part_number, 3);
        assert_eq!(request.size(), 3);
        assert_eq!(
            request.content_digest,
            crate::checksum::digest(b"abc", ChecksumAlgorithm::Sha256)
        );
        assert!(request.is_last);
    }

    #[tokio::test]
    async fn listing_follows_pages() -> anyhow::Result<()> {
        let destination = MemoryDestination::new("").with_page_size(2);
        let path = RemotePath::new("k");
        assert!(destination.get_already_uploaded_parts(&path).await?.is_none());
        let upload_id = destination.init_uploading(&path).await?;
        for part_number in [1, 2, 3, 5, 6] {
            destination.insert_part(&path, part_number, vec![0u8; 4]);
        }
        let listing = destination
            .get_already_uploaded_parts(&path)
            .await?
            .expect("session exists");
        assert_eq!(listing.upload_id, upload_id);
        let numbers: Vec<u32> = listing.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 5, 6]);
        assert_eq!(destination.calls().list_parts, 3 + 1);
        Ok(())
    }
}
