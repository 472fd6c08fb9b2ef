//! Upload progress: listener hooks called by the engine and the counters behind the printer

use std::path::Path;
use tracing::{Level, event, instrument};

/// Receives per-file upload events from the upload strategy.
///
/// `upload_file_progress` is called from part-upload workers, concurrently.
pub trait ProgressListener: Send + Sync {
    fn upload_file_started(&self, file: &Path, upload_id: &str);
    fn upload_file_progress(&self, upload_id: &str, bytes_transferred: u64);
    /// A part was acknowledged by the backend.
    fn upload_part_finished(&self, _upload_id: &str, _part_number: u32) {}
    fn upload_file_finished(&self, file: &Path);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ProgressListener for NoopListener {
    fn upload_file_started(&self, _file: &Path, _upload_id: &str) {}
    fn upload_file_progress(&self, _upload_id: &str, _bytes_transferred: u64) {}
    fn upload_file_finished(&self, _file: &Path) {}
}

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap();
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock().unwrap())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Started vs finished count of some unit of work.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.started.inc();
    }

    pub fn finish(&self) {
        self.finished.inc();
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide upload counters
#[derive(Debug)]
pub struct Progress {
    /// file upload attempts
    pub files: ProgressCounter,
    pub bytes_uploaded: TlsCounter,
    pub parts_uploaded: TlsCounter,
    pub files_committed: TlsCounter,
    pub files_skipped: TlsCounter,
    pub files_in_progress: TlsCounter,
    pub files_failed: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            files: Default::default(),
            bytes_uploaded: Default::default(),
            parts_uploaded: Default::default(),
            files_committed: Default::default(),
            files_skipped: Default::default(),
            files_in_progress: Default::default(),
            files_failed: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds engine events into a [`Progress`].
#[derive(Debug, Clone, Copy)]
pub struct ProgressTracker {
    progress: &'static Progress,
}

impl ProgressTracker {
    pub fn new(progress: &'static Progress) -> Self {
        Self { progress }
    }
}

impl ProgressListener for ProgressTracker {
    fn upload_file_started(&self, file: &Path, upload_id: &str) {
        tracing::trace!("{:?}: upload {} started", file, upload_id);
        self.progress.files.start();
    }

    fn upload_file_progress(&self, _upload_id: &str, bytes_transferred: u64) {
        self.progress.bytes_uploaded.add(bytes_transferred);
    }

    fn upload_part_finished(&self, _upload_id: &str, _part_number: u32) {
        self.progress.parts_uploaded.inc();
    }

    fn upload_file_finished(&self, file: &Path) {
        tracing::trace!("{:?}: upload finished", file);
        self.progress.files.finish();
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_bytes: progress.bytes_uploaded.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let files = self.progress.files.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let bytes = self.progress.bytes_uploaded.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        self.last_bytes = bytes;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            FILES:\n\
            uploading:   {:>10}\n\
            done:        {:>10}\n\
            -----------------------\n\
            UPLOADED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            parts:   {:>10}\n\
            -----------------------\n\
            committed:   {:>10}\n\
            skipped:     {:>10}\n\
            in progress: {:>10}\n\
            failed:      {:>10}",
            files.started - files.finished,
            files.finished,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.parts_uploaded.get(),
            self.progress.files_committed.get(),
            self.progress.files_skipped.get(),
            self.progress.files_in_progress.get(),
            self.progress.files_failed.get(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn tracker_feeds_counters() -> Result<()> {
        let progress: &'static Progress = Box::leak(Box::new(Progress::new()));
        let tracker = ProgressTracker::new(progress);
        tracker.upload_file_started(Path::new("a.ts"), "u1");
        tracker.upload_file_progress("u1", 100);
        tracker.upload_file_progress("u1", 50);
        assert_eq!(progress.parts_uploaded.get(), 0);
        tracker.upload_part_finished("u1", 1);
        let status = progress.files.get();
        assert_eq!((status.started, status.finished), (1, 0));
        tracker.upload_file_finished(Path::new("a.ts"));
        assert_eq!(progress.files.get().finished, 1);
        assert_eq!(progress.bytes_uploaded.get(), 150);
        assert_eq!(progress.parts_uploaded.get(), 1);
        let mut printer = ProgressPrinter::new(progress);
        let text = printer.print()?;
        assert!(text.contains("parts:"));
        Ok(())
    }
}
