//! Lock-file convention for files that are still being written
//!
//! A writer signals an in-progress file `name` by keeping `name.lock` next to it. The lock may
//! carry the writer's process id; a lock whose process is gone is stale and gets removed.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::instrument;

pub const LOCK_SUFFIX: &str = ".lock";

pub fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with(LOCK_SUFFIX))
}

/// Answers whether a process with a given id is running
pub trait ProcessProbe: Send + Sync {
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// Queries the OS process table
#[derive(Debug, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

/// Contents of a lock file as seen by one read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// no lock, or it vanished before it could be read
    Absent,
    /// empty or not a process id
    NoPid,
    Writer(u32),
}

#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn for_file(path: &Path) -> Self {
        let mut name = path.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        Self {
            path: PathBuf::from(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads what the lock currently says about its writer.
    pub async fn state(&self) -> anyhow::Result<LockState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(match content.trim().parse::<u32>() {
                Ok(pid) => LockState::Writer(pid),
                Err(_) => LockState::NoPid,
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(LockState::Absent),
            Err(error) => {
                Err(error).with_context(|| format!("failed reading lock file {:?}", &self.path))
            }
        }
    }

    /// True once the companion file is complete: no lock, or a lock left behind by a dead
    /// writer (which is removed on the way).
    #[instrument(skip(probe))]
    pub async fn is_writing_finished(&self, probe: &dyn ProcessProbe) -> bool {
        let pid = match self.state().await {
            Ok(LockState::Absent) => return true,
            Ok(LockState::Writer(pid)) => pid,
            Ok(LockState::NoPid) => {
                // no pid to verify, trust the lock
                return false;
            }
            Err(error) => {
                tracing::warn!("cannot check lock file: {:#}", &error);
                return false;
            }
        };
        if probe.is_process_alive(pid) {
            tracing::debug!("writer process {} is alive", pid);
            return false;
        }
        tracing::info!(
            "removing stale lock {:?}, writer process {} is gone",
            &self.path,
            pid
        );
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => true,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => true,
            Err(error) => {
                tracing::warn!("failed removing stale lock {:?}: {:#}", &self.path, &error);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeProbe;
    use tracing_test::traced_test;

    #[test]
    fn lock_path_appends_suffix() {
        let lock = LockFile::for_file(Path::new("/rec/cam1.ts"));
        assert_eq!(lock.path(), Path::new("/rec/cam1.ts.lock"));
        assert!(is_lock_file(lock.path()));
        assert!(!is_lock_file(Path::new("/rec/cam1.ts")));
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_lock_means_finished() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("a.ts");
        tokio::fs::write(&file, b"data").await?;
        assert!(
            LockFile::for_file(&file)
                .is_writing_finished(&FakeProbe::alive(&[]))
                .await
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn lock_without_pid_means_still_writing() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("a.ts");
        let lock = LockFile::for_file(&file);
        tokio::fs::write(lock.path(), b"").await?;
        assert!(!lock.is_writing_finished(&FakeProbe::alive(&[])).await);
        tokio::fs::write(lock.path(), b"not a pid").await?;
        assert!(!lock.is_writing_finished(&FakeProbe::alive(&[])).await);
        assert!(lock.path().exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn live_writer_keeps_lock() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = LockFile::for_file(&tmp.path().join("a.ts"));
        tokio::fs::write(lock.path(), b"4242\n").await?;
        assert_eq!(lock.state().await?, LockState::Writer(4242));
        assert!(!lock.is_writing_finished(&FakeProbe::alive(&[4242])).await);
        assert!(lock.path().exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_lock_is_reclaimed() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = LockFile::for_file(&tmp.path().join("a.ts"));
        tokio::fs::write(lock.path(), b"4242").await?;
        assert!(lock.is_writing_finished(&FakeProbe::alive(&[1])).await);
        assert!(!lock.path().exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn lock_removed_by_writer_means_finished() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let lock = LockFile::for_file(&tmp.path().join("a.ts"));
        tokio::fs::write(lock.path(), b"").await?;
        assert_eq!(lock.state().await?, LockState::NoPid);
        tokio::fs::remove_file(lock.path()).await?;
        assert_eq!(lock.state().await?, LockState::Absent);
        assert!(lock.is_writing_finished(&FakeProbe::alive(&[])).await);
        Ok(())
    }

    #[test]
    fn own_process_is_alive() {
        assert!(SystemProcessProbe.is_process_alive(std::process::id()));
    }
}
