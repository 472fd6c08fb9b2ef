use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use super::{
    CompletedPart, Destination, Error, Operation, PartsPage, RemotePath, UploadPartRequest,
    UploadPartResult, UploadedPart,
};
use crate::checksum;

const SESSIONS_DIR: &str = ".rup-multipart";
const UPLOAD_ID_FILE: &str = "upload-id";
const PART_PREFIX: &str = "part-";
const ETAG_SUFFIX: &str = ".etag";
const TMP_SUFFIX: &str = ".tmp";

/// Object store kept in a local directory.
///
/// Committed objects live at `<root>/<key>`. Open multipart sessions live under
/// `<root>/.rup-multipart/<sha256(key)>/` with one `part-<n>` file per uploaded part, next to a
/// `part-<n>.etag` file holding its ETag. Parts become visible atomically (write + rename) so a
/// crash mid-upload never leaves a half-written part in a listing.
#[derive(Debug)]
pub struct LocalDestination {
    root: PathBuf,
    prefix: String,
    page_size: usize,
    upload_counter: AtomicU64,
}

impl LocalDestination {
    pub fn new(root: PathBuf, prefix: &str) -> Self {
        Self {
            root,
            prefix: prefix.trim_matches('/').to_string(),
            page_size: 1000,
            upload_counter: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn object_path(&self, remote_path: &RemotePath) -> anyhow::Result<PathBuf> {
        let key = remote_path.as_str();
        if key.is_empty() || key.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(anyhow!("invalid object key '{}'", key));
        }
        if key.split('/').next() == Some(SESSIONS_DIR) {
            return Err(anyhow!("object key '{}' collides with the session area", key));
        }
        Ok(self.root.join(key))
    }

    fn session_dir(&self, remote_path: &RemotePath) -> PathBuf {
        self.root
            .join(SESSIONS_DIR)
            .join(checksum::etag(remote_path.as_str().as_bytes()))
    }

    fn new_upload_id(&self) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.upload_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{:x}-{:x}", nanos, std::process::id(), seq)
    }

    /// Upload id of the open session, `None` if there is none.
    async fn session_upload_id(session_dir: &Path) -> anyhow::Result<Option<String>> {
        match tokio::fs::read_to_string(session_dir.join(UPLOAD_ID_FILE)).await {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error)
                .with_context(|| format!("failed reading upload id in {:?}", session_dir)),
        }
    }

    async fn require_session(&self, remote_path: &RemotePath, upload_id: &str) -> anyhow::Result<PathBuf> {
        let session_dir = self.session_dir(remote_path);
        match Self::session_upload_id(&session_dir).await? {
            Some(id) if id == upload_id => Ok(session_dir),
            Some(id) => Err(anyhow!(
                "upload id mismatch: session has {}, request has {}",
                id,
                upload_id
            )),
            None => Err(anyhow!("no such upload: {}", upload_id)),
        }
    }

    async fn session_parts(session_dir: &Path) -> anyhow::Result<Vec<UploadedPart>> {
        let mut entries = tokio::fs::read_dir(session_dir)
            .await
            .with_context(|| format!("cannot open session directory {:?}", session_dir))?;
        let mut parts = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing session directory {:?}", session_dir))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(part_number) = name
                .strip_prefix(PART_PREFIX)
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let etag_path = session_dir.join(format!("{}{}", name, ETAG_SUFFIX));
            let etag = match tokio::fs::read_to_string(&etag_path).await {
                Ok(etag) => etag.trim().to_string(),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("part {:?} has no etag, ignoring it", entry.path());
                    continue;
                }
                Err(error) => {
                    return Err(error).with_context(|| format!("failed reading {:?}", etag_path));
                }
            };
            let size = entry
                .metadata()
                .await
                .with_context(|| format!("failed reading metadata from {:?}", entry.path()))?
                .len();
            parts.push(UploadedPart {
                part_number,
                size,
                etag,
            });
        }
        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    async fn write_atomically(path: &Path, data: &[u8]) -> anyhow::Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed writing {:?}", &tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed renaming {:?} to {:?}", &tmp, path))?;
        Ok(())
    }

    async fn store_part(&self, request: &UploadPartRequest) -> anyhow::Result<UploadPartResult> {
        let session_dir = self
            .require_session(&request.remote_path, &request.upload_id)
            .await?;
        if request.part_number == 0 {
            return Err(anyhow!("part numbers start at 1"));
        }
        let digest = checksum::digest(&request.data, request.checksum_algorithm);
        if digest != request.content_digest {
            return Err(anyhow!(
                "{} digest mismatch for part {}: expected {}, computed {}",
                request.checksum_algorithm,
                request.part_number,
                request.content_digest,
                digest
            ));
        }
        let etag = checksum::etag(&request.data);
        let part_path = session_dir.join(format!("{}{}", PART_PREFIX, request.part_number));
        let mut etag_path = part_path.as_os_str().to_owned();
        etag_path.push(ETAG_SUFFIX);
        // the etag goes first, a part file is only listed once it is complete
        Self::write_atomically(Path::new(&etag_path), etag.as_bytes()).await?;
        Self::write_atomically(&part_path, &request.data).await?;
        request.report_progress(request.size());
        Ok(UploadPartResult {
            part_number: request.part_number,
            size: request.size(),
            etag,
        })
    }

    async fn assemble(
        &self,
        remote_path: &RemotePath,
        parts: &[CompletedPart],
        upload_id: &str,
    ) -> anyhow::Result<()> {
        let session_dir = self.require_session(remote_path, upload_id).await?;
        if parts
            .windows(2)
            .any(|pair| pair[0].part_number >= pair[1].part_number)
        {
            return Err(anyhow!("parts must be sorted by ascending part number"));
        }
        let stored = Self::session_parts(&session_dir).await?;
        for part in parts {
            let Some(found) = stored.iter().find(|s| s.part_number == part.part_number) else {
                return Err(anyhow!("part {} was never uploaded", part.part_number));
            };
            if found.etag != part.etag {
                return Err(anyhow!(
                    "etag mismatch for part {}: stored {}, given {}",
                    part.part_number,
                    found.etag,
                    part.etag
                ));
            }
        }
        let object_path = self.object_path(remote_path)?;
        if let Some(parent) = object_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        let mut tmp = object_path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        let mut writer = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("cannot create {:?}", &tmp))?;
        for part in parts {
            let part_path = session_dir.join(format!("{}{}", PART_PREFIX, part.part_number));
            let mut reader = tokio::fs::File::open(&part_path)
                .await
                .with_context(|| format!("cannot open {:?}", &part_path))?;
            tokio::io::copy(&mut reader, &mut writer)
                .await
                .with_context(|| format!("failed appending {:?} to {:?}", &part_path, &tmp))?;
        }
        writer.flush().await?;
        writer.sync_all().await?;
        drop(writer);
        tokio::fs::rename(&tmp, &object_path)
            .await
            .with_context(|| format!("failed renaming {:?} to {:?}", &tmp, &object_path))?;
        tokio::fs::remove_dir_all(&session_dir)
            .await
            .with_context(|| format!("failed removing session {:?}", &session_dir))?;
        Ok(())
    }
}

impl Destination for LocalDestination {
    fn remote_path(&self, relative_path: &str) -> RemotePath {
        RemotePath::with_prefix(&self.prefix, relative_path)
    }

    #[instrument(skip(self, relative_paths), fields(count = relative_paths.len()))]
    async fn filter_uploadable_files(
        &self,
        relative_paths: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        let mut remaining = Vec::with_capacity(relative_paths.len());
        for relative_path in relative_paths {
            let remote_path = self.remote_path(&relative_path);
            let object_path = self
                .object_path(&remote_path)
                .map_err(|err| Error::new(Operation::FilterUploadableFiles, &remote_path, err))?;
            let exists = match tokio::fs::metadata(&object_path).await {
                Ok(metadata) => metadata.is_file(),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
                Err(error) => {
                    return Err(Error::new(
                        Operation::FilterUploadableFiles,
                        &remote_path,
                        anyhow::Error::new(error)
                            .context(format!("failed reading metadata from {:?}", &object_path)),
                    ));
                }
            };
            if !exists {
                remaining.push(relative_path);
            }
        }
        Ok(remaining)
    }

    #[instrument(skip(self))]
    async fn init_uploading(&self, remote_path: &RemotePath) -> Result<String, Error> {
        let init = async {
            self.object_path(remote_path)?;
            let session_dir = self.session_dir(remote_path);
            tokio::fs::create_dir_all(&session_dir)
                .await
                .with_context(|| format!("cannot create session directory {:?}", &session_dir))?;
            let upload_id = self.new_upload_id();
            Self::write_atomically(&session_dir.join(UPLOAD_ID_FILE), upload_id.as_bytes())
                .await?;
            tokio::fs::write(session_dir.join("key"), remote_path.as_str())
                .await
                .with_context(|| format!("failed writing key to {:?}", &session_dir))?;
            anyhow::Ok(upload_id)
        };
        init.await
            .map_err(|err| Error::new(Operation::InitUploading, remote_path, err))
    }

    #[instrument(skip(self))]
    async fn list_parts_page(
        &self,
        remote_path: &RemotePath,
        part_number_marker: Option<u32>,
    ) -> Result<Option<PartsPage>, Error> {
        let list = async {
            let session_dir = self.session_dir(remote_path);
            let Some(upload_id) = Self::session_upload_id(&session_dir).await? else {
                return anyhow::Ok(None);
            };
            let after = part_number_marker.unwrap_or(0);
            let mut parts: Vec<UploadedPart> = Self::session_parts(&session_dir)
                .await?
                .into_iter()
                .filter(|part| part.part_number > after)
                .collect();
            let is_truncated = parts.len() > self.page_size;
            parts.truncate(self.page_size);
            let next_part_number_marker = parts.last().map(|part| part.part_number);
            Ok(Some(PartsPage {
                upload_id,
                parts,
                is_truncated,
                next_part_number_marker,
            }))
        };
        list.await
            .map_err(|err| Error::new(Operation::ListParts, remote_path, err))
    }

    #[instrument(skip(self, request), fields(remote_path = %request.remote_path, part_number = request.part_number))]
    async fn upload_multi_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResult, Error> {
        self.store_part(&request)
            .await
            .map_err(|err| Error::new(Operation::UploadPart, &request.remote_path, err))
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn commit_multipart_upload(
        &self,
        remote_path: &RemotePath,
        parts: Vec<CompletedPart>,
        upload_id: &str,
    ) -> Result<(), Error> {
        self.assemble(remote_path, &parts, upload_id)
            .await
            .map_err(|err| Error::new(Operation::Commit, remote_path, err))
    }
}
