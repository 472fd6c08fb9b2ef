//! Reconciles one local file with its remote multipart session
//!
//! [`MultipartUploadFile`] looks up (or starts) the session for a file, works out which parts
//! the backend already holds and which part numbers below the highest one are missing, and then
//! produces the upload requests for what is left:
//!
//! - [`MultipartUploadFile::stream_upload_part_request_for_failed_parts`] re-reads the gaps,
//! - [`MultipartUploadFile::stream_upload_part_request_for_incomplete_parts`] reads the data
//!   past everything uploaded so far, in [`MIN_PART_SIZE`] parts.
//!
//! Every part but the last is exactly [`MIN_PART_SIZE`] bytes, so part `n` always starts at byte
//! `(n - 1) * MIN_PART_SIZE` of the file.

use anyhow::Context;
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use crate::checksum::ChecksumAlgorithm;
use crate::chunk::{self, MIN_PART_SIZE};
use crate::destination::{
    CompletedPart, Destination, RemotePath, UploadPartRequest, UploadPartResult,
    UploadPartTemplate, UploadedPart,
};
use crate::lockfile::{LockFile, ProcessProbe};
use crate::upload::Error;

/// Upload state of one local file against one remote key
pub struct MultipartUploadFile<D: Destination> {
    local_path: PathBuf,
    remote_path: RemotePath,
    destination: Arc<D>,
    template: UploadPartTemplate,
    resumed: bool,
    /// parts known to be on the backend, keyed (and therefore sorted) by part number
    parts: BTreeMap<u32, UploadedPart>,
    uploaded_size: u64,
    last_part_number: u32,
    failed_middle_parts: BTreeSet<u32>,
    data_offset: u64,
    is_writing_finished: bool,
    local_file_size: u64,
    parts_failed_this_attempt: BTreeSet<u32>,
    sequential_read_failed: bool,
}

impl<D: Destination> std::fmt::Debug for MultipartUploadFile<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUploadFile")
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .field("upload_id", &self.template.upload_id)
            .field("resumed", &self.resumed)
            .field("uploaded_size", &self.uploaded_size)
            .field("last_part_number", &self.last_part_number)
            .field("failed_middle_parts", &self.failed_middle_parts)
            .field("is_writing_finished", &self.is_writing_finished)
            .field("local_file_size", &self.local_file_size)
            .finish()
    }
}

/// Part numbers in `1..last_part_number` without an uploaded part.
fn missing_part_numbers(parts: &BTreeMap<u32, UploadedPart>, last_part_number: u32) -> BTreeSet<u32> {
    (1..last_part_number)
        .filter(|part_number| !parts.contains_key(part_number))
        .collect()
}

async fn local_file_size(path: &Path) -> Result<u64, Error> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed reading metadata of {:?}", path))
        .map_err(Error::Io)?;
    Ok(metadata.len())
}

struct SequentialCursor {
    file: Option<(tokio::fs::File, throttle::OpenFileGuard)>,
    part_number: u32,
    done: bool,
}

impl<D: Destination> MultipartUploadFile<D> {
    /// Looks up the session for `remote_path`, starting a new one if there is none.
    #[instrument(skip(destination, probe))]
    pub async fn new(
        local_path: &Path,
        remote_path: RemotePath,
        destination: Arc<D>,
        checksum_algorithm: ChecksumAlgorithm,
        probe: &dyn ProcessProbe,
    ) -> Result<Self, Error> {
        let (upload_id, parts, resumed) =
            match destination.get_already_uploaded_parts(&remote_path).await? {
                Some(listing) => {
                    let parts: BTreeMap<u32, UploadedPart> = listing
                        .parts
                        .into_iter()
                        .map(|part| (part.part_number, part))
                        .collect();
                    (listing.upload_id, parts, true)
                }
                None => {
                    let upload_id = destination.init_uploading(&remote_path).await?;
                    tracing::info!("{}: started upload {}", &remote_path, &upload_id);
                    (upload_id, BTreeMap::new(), false)
                }
            };
        let uploaded_size = parts.values().map(|part| part.size).sum::<u64>();
        let last_part_number = parts.keys().next_back().copied().unwrap_or(0);
        let failed_middle_parts = missing_part_numbers(&parts, last_part_number);
        let data_offset = uploaded_size + failed_middle_parts.len() as u64 * MIN_PART_SIZE;
        // lock first: once it is gone the size read below is final
        let is_writing_finished = LockFile::for_file(local_path)
            .is_writing_finished(probe)
            .await;
        let local_file_size = local_file_size(local_path).await?;
        if resumed {
            tracing::info!(
                "{}: resuming upload {} with {} parts ({} bytes), missing parts: {:?}",
                &remote_path,
                &upload_id,
                parts.len(),
                uploaded_size,
                &failed_middle_parts
            );
        }
        let template =
            destination.create_upload_part_request(&remote_path, &upload_id, checksum_algorithm);
        let file = Self {
            local_path: local_path.to_path_buf(),
            remote_path,
            destination,
            template,
            resumed,
            parts,
            uploaded_size,
            last_part_number,
            failed_middle_parts,
            data_offset,
            is_writing_finished,
            local_file_size,
            parts_failed_this_attempt: BTreeSet::new(),
            sequential_read_failed: false,
        };
        file.check_size()?;
        Ok(file)
    }

    fn check_size(&self) -> Result<(), Error> {
        if self.uploaded_size > self.local_file_size {
            return Err(Error::UploadedSizeExceedsFileSize {
                path: self.local_path.clone(),
                uploaded_size: self.uploaded_size,
                file_size: self.local_file_size,
            });
        }
        Ok(())
    }

    /// Re-reads the local file size and checks nothing beyond it was uploaded.
    pub async fn validate_uploaded_file_size(&mut self) -> Result<(), Error> {
        self.local_file_size = local_file_size(&self.local_path).await?;
        self.check_size()
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &RemotePath {
        &self.remote_path
    }

    pub fn upload_id(&self) -> &str {
        &self.template.upload_id
    }

    /// The session existed before this attempt.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn uploaded_size(&self) -> u64 {
        self.uploaded_size
    }

    /// Highest part number on the backend, 0 for a session without parts.
    pub fn last_part_number(&self) -> u32 {
        self.last_part_number
    }

    pub fn next_part_to_upload_index(&self) -> u32 {
        self.last_part_number + 1
    }

    pub fn failed_middle_parts(&self) -> &BTreeSet<u32> {
        &self.failed_middle_parts
    }

    pub fn is_writing_finished(&self) -> bool {
        self.is_writing_finished
    }

    pub fn local_file_size(&self) -> u64 {
        self.local_file_size
    }

    /// ETags of all parts known so far, sorted by part number.
    pub fn etags(&self) -> Vec<CompletedPart> {
        self.parts
            .values()
            .map(|part| CompletedPart {
                part_number: part.part_number,
                etag: part.etag.clone(),
            })
            .collect()
    }

    async fn read_failed_part(&self, part_number: u32) -> anyhow::Result<UploadPartRequest> {
        let _open_file_guard = throttle::open_file_permit().await;
        let mut file = tokio::fs::File::open(&self.local_path)
            .await
            .with_context(|| format!("cannot open {:?} for reading", &self.local_path))?;
        let data = chunk::read_exact_at(
            &mut file,
            chunk::part_offset(part_number),
            MIN_PART_SIZE as usize,
        )
        .await
        .with_context(|| format!("failed reading part {} of {:?}", part_number, &self.local_path))?;
        Ok(self.template.build(part_number, data, false, None))
    }

    /// Requests re-uploading the missing parts below the highest uploaded one.
    ///
    /// A part that cannot be read is skipped with a warning; it stays missing and is retried by
    /// the next attempt.
    pub fn stream_upload_part_request_for_failed_parts(
        &mut self,
    ) -> impl Stream<Item = UploadPartRequest> + Send + '_ {
        let remaining: VecDeque<u32> = self.failed_middle_parts.iter().copied().collect();
        futures::stream::unfold((self, remaining), |(file, mut remaining)| async move {
            while let Some(part_number) = remaining.pop_front() {
                match file.read_failed_part(part_number).await {
                    Ok(request) => {
                        file.uploaded_size += request.size();
                        return Some((request, (file, remaining)));
                    }
                    Err(error) => {
                        tracing::warn!("skipping part {} for now: {:#}", part_number, &error);
                    }
                }
            }
            None
        })
    }

    async fn next_sequential_part(
        &mut self,
        cursor: &mut SequentialCursor,
    ) -> anyhow::Result<Option<UploadPartRequest>> {
        if cursor.file.is_none() {
            let guard = throttle::open_file_permit().await;
            let mut file = tokio::fs::File::open(&self.local_path)
                .await
                .with_context(|| format!("cannot open {:?} for reading", &self.local_path))?;
            tokio::io::AsyncSeekExt::seek(&mut file, std::io::SeekFrom::Start(self.data_offset))
                .await
                .with_context(|| {
                    format!("cannot seek {:?} to {}", &self.local_path, self.data_offset)
                })?;
            cursor.file = Some((file, guard));
        }
        let Some((file, _)) = cursor.file.as_mut() else {
            return Ok(None);
        };
        let data = chunk::read_chunk(file, MIN_PART_SIZE as usize)
            .await
            .with_context(|| {
                format!(
                    "failed reading part {} of {:?}",
                    cursor.part_number, &self.local_path
                )
            })?;
        let full = data.len() as u64 == MIN_PART_SIZE;
        if !full {
            cursor.done = true;
            if !self.is_writing_finished {
                tracing::debug!(
                    "{}: {} bytes after part {} are not final yet",
                    &self.remote_path,
                    data.len(),
                    cursor.part_number - 1
                );
                return Ok(None);
            }
            if data.is_empty() {
                return Ok(None);
            }
        }
        let request = self
            .template
            .build(cursor.part_number, data, !full, None);
        cursor.part_number += 1;
        self.uploaded_size += request.size();
        Ok(Some(request))
    }

    /// Requests uploading the data past everything already uploaded.
    ///
    /// Emits full [`MIN_PART_SIZE`] parts while the file has them. The remainder is emitted as
    /// the last part only once writing is finished, and never when it is empty. A read error
    /// ends the stream and keeps this attempt from committing.
    pub fn stream_upload_part_request_for_incomplete_parts(
        &mut self,
    ) -> impl Stream<Item = UploadPartRequest> + Send + '_ {
        let cursor = SequentialCursor {
            file: None,
            part_number: self.next_part_to_upload_index(),
            done: false,
        };
        futures::stream::unfold((self, cursor), |(file, mut cursor)| async move {
            if cursor.done {
                return None;
            }
            match file.next_sequential_part(&mut cursor).await {
                Ok(Some(request)) => Some((request, (file, cursor))),
                Ok(None) => None,
                Err(error) => {
                    tracing::error!("{:#}", &error);
                    file.sequential_read_failed = true;
                    None
                }
            }
        })
    }

    /// Reading sequential data failed during this attempt.
    pub fn sequential_read_failed(&self) -> bool {
        self.sequential_read_failed
    }

    pub fn add_uploaded_part(&mut self, result: UploadPartResult) {
        self.parts.insert(
            result.part_number,
            UploadedPart {
                part_number: result.part_number,
                size: result.size,
                etag: result.etag,
            },
        );
        self.parts_failed_this_attempt.remove(&result.part_number);
    }

    pub fn add_failed_part(&mut self, part_number: u32) {
        self.parts_failed_this_attempt.insert(part_number);
    }

    /// Why the session cannot be committed yet, `None` when it can.
    fn commit_blocker(&self) -> Option<String> {
        if !self.parts_failed_this_attempt.is_empty() {
            return Some(format!(
                "parts {:?} failed to upload",
                &self.parts_failed_this_attempt
            ));
        }
        if self.sequential_read_failed {
            return Some("reading the file failed".to_string());
        }
        if let Some(gap) = self
            .parts
            .keys()
            .zip(1u32..)
            .find(|(part_number, expected)| **part_number != *expected)
        {
            return Some(format!("part {} is missing", gap.1));
        }
        let committed_size = self.parts.values().map(|part| part.size).sum::<u64>();
        if committed_size != self.local_file_size {
            return Some(format!(
                "parts hold {} bytes but the file has {}",
                committed_size, self.local_file_size
            ));
        }
        None
    }

    /// Commits the session if the file is no longer being written.
    ///
    /// Returns whether a commit happened. Parts are passed sorted by part number.
    #[instrument(skip(self), fields(remote_path = %self.remote_path))]
    pub async fn commit_if_finished_writing(&mut self) -> Result<bool, Error> {
        if !self.is_writing_finished {
            tracing::debug!("still being written, leaving the upload open");
            return Ok(false);
        }
        if let Some(reason) = self.commit_blocker() {
            tracing::warn!(
                "{}: not committing upload {}: {}",
                &self.remote_path,
                self.upload_id(),
                reason
            );
            return Ok(false);
        }
        let mut etags = self.etags();
        etags.sort_by_key(|part| part.part_number);
        self.destination
            .commit_multipart_upload(&self.remote_path, etags, &self.template.upload_id)
            .await?;
        Ok(true)
    }
}
