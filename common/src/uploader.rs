//! Bounded pool of part-upload workers
//!
//! A fixed number of tasks pull requests from a bounded queue and run them against the shared
//! [`Destination`]. Submitting waits while the queue is full, which keeps the number of part
//! buffers in memory bounded no matter how fast the file can be read.

use std::sync::Arc;
use tokio::sync::oneshot;

use crate::destination::{self, Destination, UploadPartRequest, UploadPartResult};
use crate::upload::Error;

/// Default ceiling for waiting on outstanding uploads.
pub const DEFAULT_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

type Reply = oneshot::Sender<Result<UploadPartResult, destination::Error>>;

/// Result of one submitted part, available once a worker has run it
#[derive(Debug)]
pub struct PartUploadHandle {
    part_number: u32,
    size: u64,
    receiver: oneshot::Receiver<Result<UploadPartResult, destination::Error>>,
}

impl PartUploadHandle {
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn outcome(self) -> Result<UploadPartResult, Error> {
        match self.receiver.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::CannotFinishUploading(format!(
                "part {} was dropped before it was uploaded",
                self.part_number
            ))),
        }
    }
}

pub struct ConcurrentMultipartUploader {
    sender: async_channel::Sender<(UploadPartRequest, Reply)>,
    workers: tokio::task::JoinSet<()>,
    threads: usize,
}

impl std::fmt::Debug for ConcurrentMultipartUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMultipartUploader")
            .field("threads", &self.threads)
            .field("queued", &self.sender.len())
            .finish()
    }
}

impl ConcurrentMultipartUploader {
    /// Starts `threads` workers uploading through `destination`.
    pub fn new<D: Destination>(destination: Arc<D>, threads: usize) -> anyhow::Result<Self> {
        if threads == 0 {
            return Err(anyhow::anyhow!("number of upload threads must be at least 1"));
        }
        let (sender, receiver) = async_channel::bounded::<(UploadPartRequest, Reply)>(1);
        let mut workers = tokio::task::JoinSet::new();
        for worker in 0..threads {
            let destination = destination.clone();
            let receiver = receiver.clone();
            workers.spawn(async move {
                while let Ok((request, reply)) = receiver.recv().await {
                    let part_number = request.part_number;
                    let result = destination.upload_multi_part(request).await;
                    if reply.send(result).is_err() {
                        tracing::debug!("worker {}: nobody waits for part {}", worker, part_number);
                    }
                }
                tracing::trace!("worker {}: queue closed", worker);
            });
        }
        Ok(Self {
            sender,
            workers,
            threads,
        })
    }

    /// Queues `request`, waiting while the queue is full.
    ///
    /// The returned handle resolves once a worker has uploaded the part, or failed to.
    pub async fn submit_task_for_part_uploading(
        &self,
        request: UploadPartRequest,
    ) -> PartUploadHandle {
        let (reply, receiver) = oneshot::channel();
        let part_number = request.part_number;
        let size = request.size();
        if self.sender.send((request, reply)).await.is_err() {
            // the reply sender is dropped with the rejected job, the handle reports it
            tracing::error!("upload queue is closed, part {} not submitted", part_number);
        }
        PartUploadHandle {
            part_number,
            size,
            receiver,
        }
    }

    /// Stops accepting parts and waits up to `timeout` for the queued ones to finish.
    pub async fn shutdown_and_await_termination(
        mut self,
        timeout: std::time::Duration,
    ) -> Result<(), Error> {
        self.sender.close();
        let drain = async {
            while let Some(joined) = self.workers.join_next().await {
                joined.map_err(|error| {
                    Error::CannotFinishUploading(format!("upload worker failed: {}", error))
                })?;
            }
            Ok::<(), Error>(())
        };
        let drained = tokio::time::timeout(timeout, drain).await;
        match drained {
            Ok(result) => result,
            Err(_) => {
                self.workers.abort_all();
                Err(Error::CannotFinishUploading(format!(
                    "parts still uploading after {}",
                    humantime::format_duration(timeout)
                )))
            }
        }
    }
}
