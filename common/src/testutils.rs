//! In-memory backend and helpers shared by the engine unit tests

use anyhow::anyhow;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::checksum;
use crate::chunk::MIN_PART_SIZE;
use crate::destination::{
    CompletedPart, Destination, Error, Operation, PartsPage, RemotePath, UploadPartRequest,
    UploadPartResult, UploadedPart,
};
use crate::lockfile::ProcessProbe;

/// Number of calls seen per backend operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub filter: usize,
    pub init: usize,
    pub list_parts: usize,
    pub upload_part: usize,
    pub commit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub key: String,
    pub part_number: u32,
    pub size: u64,
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub key: String,
    pub part_numbers: Vec<u32>,
}

#[derive(Debug)]
struct Session {
    upload_id: String,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    calls: Calls,
    inits: Vec<String>,
    uploads: Vec<UploadRecord>,
    commits: Vec<CommitRecord>,
    failing_parts: HashSet<u32>,
    fail_commits: bool,
    in_flight: usize,
    max_in_flight: usize,
    next_id: u64,
}

/// Object store held in memory, with injectable part and commit failures.
///
/// Non-final parts smaller than [`MIN_PART_SIZE`] are rejected the way a real store would.
#[derive(Debug)]
pub struct MemoryDestination {
    prefix: String,
    page_size: usize,
    upload_delay: Option<std::time::Duration>,
    state: Mutex<State>,
}

impl MemoryDestination {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            page_size: 1000,
            upload_delay: None,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Every part upload sleeps this long, so concurrent uploads overlap.
    pub fn with_upload_delay(mut self, delay: std::time::Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_object(&self, key: &str, data: &[u8]) {
        self.state()
            .objects
            .insert(key.to_string(), Bytes::copy_from_slice(data));
    }

    /// Stores a part directly into the open session for `remote_path`.
    pub fn insert_part(&self, remote_path: &RemotePath, part_number: u32, data: Vec<u8>) {
        let etag = checksum::etag(&data);
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(remote_path.as_str())
            .expect("no open session");
        session.parts.insert(part_number, (Bytes::from(data), etag));
    }

    pub fn fail_part(&self, part_number: u32) {
        self.state().failing_parts.insert(part_number);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_parts.clear();
        state.fail_commits = false;
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commits = fail;
    }

    pub fn calls(&self) -> Calls {
        self.state().calls
    }

    /// Keys a session was started for, in call order.
    pub fn inits(&self) -> Vec<String> {
        self.state().inits.clone()
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.state().uploads.clone()
    }

    pub fn uploaded_part_numbers(&self, key: &str) -> Vec<u32> {
        self.state()
            .uploads
            .iter()
            .filter(|record| record.key == key)
            .map(|record| record.part_number)
            .collect()
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state().commits.clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).cloned()
    }

    /// Part numbers held by the open session for `key`, empty without a session.
    pub fn session_part_numbers(&self, key: &str) -> Vec<u32> {
        self.state()
            .sessions
            .get(key)
            .map(|session| session.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn max_concurrent_uploads(&self) -> usize {
        self.state().max_in_flight
    }

    fn store_part(&self, request: &UploadPartRequest) -> anyhow::Result<UploadPartResult> {
        let mut state = self.state();
        if state.failing_parts.contains(&request.part_number) {
            return Err(anyhow!("injected failure for part {}", request.part_number));
        }
        if !request.is_last && request.size() < MIN_PART_SIZE {
            return Err(anyhow!(
                "part {} is {} bytes, below the minimum part size",
                request.part_number,
                request.size()
            ));
        }
        if checksum::digest(&request.data, request.checksum_algorithm) != request.content_digest {
            return Err(anyhow!("digest mismatch for part {}", request.part_number));
        }
        let session = state
            .sessions
            .get_mut(request.remote_path.as_str())
            .filter(|session| session.upload_id == request.upload_id)
            .ok_or_else(|| anyhow!("no such upload {}", request.upload_id))?;
        let etag = checksum::etag(&request.data);
        session
            .parts
            .insert(request.part_number, (request.data.clone(), etag.clone()));
        state.uploads.push(UploadRecord {
            key: request.remote_path.to_string(),
            part_number: request.part_number,
            size: request.size(),
            is_last: request.is_last,
        });
        Ok(UploadPartResult {
            part_number: request.part_number,
            size: request.size(),
            etag,
        })
    }
}

impl Destination for MemoryDestination {
    fn remote_path(&self, relative_path: &str) -> RemotePath {
        RemotePath::with_prefix(&self.prefix, relative_path)
    }

    async fn filter_uploadable_files(
        &self,
        relative_paths: Vec<String>,
    ) -> Result<Vec<String>, Error> {
        let mut state = self.state();
        state.calls.filter += 1;
        Ok(relative_paths
            .into_iter()
            .filter(|path| {
                !state
                    .objects
                    .contains_key(RemotePath::with_prefix(&self.prefix, path).as_str())
            })
            .collect())
    }

    async fn init_uploading(&self, remote_path: &RemotePath) -> Result<String, Error> {
        let mut state = self.state();
        state.calls.init += 1;
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.inits.push(remote_path.to_string());
        state.sessions.insert(
            remote_path.to_string(),
            Session {
                upload_id: upload_id.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn list_parts_page(
        &self,
        remote_path: &RemotePath,
        part_number_marker: Option<u32>,
    ) -> Result<Option<PartsPage>, Error> {
        let mut state = self.state();
        state.calls.list_parts += 1;
        let Some(session) = state.sessions.get(remote_path.as_str()) else {
            return Ok(None);
        };
        let after = part_number_marker.unwrap_or(0);
        let mut remaining = session
            .parts
            .range(after + 1..)
            .map(|(part_number, (data, etag))| UploadedPart {
                part_number: *part_number,
                size: data.len() as u64,
                etag: etag.clone(),
            });
        let parts: Vec<UploadedPart> = remaining.by_ref().take(self.page_size).collect();
        let is_truncated = remaining.next().is_some();
        Ok(Some(PartsPage {
            upload_id: session.upload_id.clone(),
            next_part_number_marker: parts.last().map(|part| part.part_number),
            parts,
            is_truncated,
        }))
    }

    async fn upload_multi_part(
        &self,
        request: UploadPartRequest,
    ) -> Result<UploadPartResult, Error> {
        {
            let mut state = self.state();
            state.calls.upload_part += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.store_part(&request);
        self.state().in_flight -= 1;
        let uploaded =
            result.map_err(|err| Error::new(Operation::UploadPart, &request.remote_path, err))?;
        request.report_progress(uploaded.size);
        Ok(uploaded)
    }

    async fn commit_multipart_upload(
        &self,
        remote_path: &RemotePath,
        parts: Vec<CompletedPart>,
        upload_id: &str,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.commit += 1;
        let commit = |state: &mut State| -> anyhow::Result<Bytes> {
            if state.fail_commits {
                return Err(anyhow!("injected commit failure"));
            }
            if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
                return Err(anyhow!("parts are not sorted by part number"));
            }
            let session = state
                .sessions
                .get(remote_path.as_str())
                .filter(|session| session.upload_id == upload_id)
                .ok_or_else(|| anyhow!("no such upload {}", upload_id))?;
            let mut object = Vec::new();
            for part in &parts {
                match session.parts.get(&part.part_number) {
                    Some((data, etag)) if *etag == part.etag => object.extend_from_slice(data),
                    _ => return Err(anyhow!("unknown part {}", part.part_number)),
                }
            }
            Ok(Bytes::from(object))
        };
        let object = commit(&mut *state)
            .map_err(|err| Error::new(Operation::Commit, remote_path, err))?;
        state.sessions.remove(remote_path.as_str());
        state.objects.insert(remote_path.to_string(), object);
        state.commits.push(CommitRecord {
            key: remote_path.to_string(),
            part_numbers: parts.iter().map(|part| part.part_number).collect(),
        });
        Ok(())
    }
}

/// Process table with a fixed set of live pids
#[derive(Debug, Default)]
pub struct FakeProbe {
    alive: HashSet<u32>,
}

impl FakeProbe {
    pub fn alive(pids: &[u32]) -> Self {
        Self {
            alive: pids.iter().copied().collect(),
        }
    }
}

impl ProcessProbe for FakeProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

/// Deterministic non-repeating-per-part content, so misplaced parts are detected.
pub fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn write_pattern(path: &std::path::Path, len: u64) -> anyhow::Result<Vec<u8>> {
    let data = pattern(len);
    tokio::fs::write(path, &data).await?;
    Ok(data)
}

/// Marks `path` as being written by a live process (this test process).
pub async fn lock(path: &std::path::Path) -> anyhow::Result<()> {
    let lock = crate::lockfile::LockFile::for_file(path);
    tokio::fs::write(lock.path(), std::process::id().to_string()).await?;
    Ok(())
}

pub async fn unlock(path: &std::path::Path) -> anyhow::Result<()> {
    let lock = crate::lockfile::LockFile::for_file(path);
    tokio::fs::remove_file(lock.path()).await?;
    Ok(())
}
