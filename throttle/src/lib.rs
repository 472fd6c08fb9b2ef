//! Resource throttling for uploads
//!
//! Three process-wide token buckets control how hard `rup` pushes on the local disk and on the
//! remote backend:
//!
//! 1. **Open files limit** - caps the number of local files held open at the same time
//! 2. **Ops throttle** - caps the number of backend requests per second
//! 3. **I/O throttle** - caps the upload bandwidth, measured in chunks per second
//!
//! All buckets are disabled until configured with a non-zero value.
//!
//! # Open files
//!
//! ```rust,no_run
//! # async fn example() {
//! throttle::set_max_open_files(512);
//! let _guard = throttle::open_file_permit().await;
//! // read from the file while the guard is alive
//! # }
//! ```
//!
//! # Requests and bandwidth
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 50 requests per second
//! throttle::init_ops_tokens(5);
//! tokio::spawn(throttle::run_ops_replenish_thread(5, Duration::from_millis(100)));
//!
//! // 100 chunks of 1 MiB per second, roughly 100 MiB/s
//! throttle::init_iops_tokens(10);
//! tokio::spawn(throttle::run_iops_replenish_thread(10, Duration::from_millis(100)));
//!
//! throttle::get_ops_token().await;
//! throttle::get_part_iops_tokens(1024 * 1024, 5 * 1024 * 1024).await;
//! # }
//! ```
//!
//! A part of `size` bytes costs `⌈size / chunk_size⌉` I/O tokens, a zero-length part costs one.

mod bucket;

pub use bucket::TokenBucket;

static OPEN_FILES_LIMIT: TokenBucket = TokenBucket::new();
static OPS_THROTTLE: TokenBucket = TokenBucket::new();
static IOPS_THROTTLE: TokenBucket = TokenBucket::new();

pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.configure(max_open_files);
}

pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.borrow().await,
    }
}

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.configure(ops_tokens);
}

pub fn init_iops_tokens(iops_tokens: usize) {
    IOPS_THROTTLE.configure(iops_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.take(1).await;
}

/// Number of I/O tokens charged for a part of `part_size` bytes.
pub fn part_iops_tokens(chunk_size: u64, part_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    let tokens = 1 + (std::cmp::max(1, part_size) - 1) / chunk_size;
    u32::try_from(tokens).ok()
}

pub async fn get_part_iops_tokens(chunk_size: u64, part_size: u64) {
    if chunk_size == 0 {
        return;
    }
    match part_iops_tokens(chunk_size, part_size) {
        Some(tokens) => IOPS_THROTTLE.take(tokens).await,
        None => tracing::error!(
            "chunk size: {} is too small to limit throughput for parts this big, size: {}",
            chunk_size,
            part_size,
        ),
    }
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.refill_forever(replenish, interval).await;
}

pub async fn run_iops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    IOPS_THROTTLE.refill_forever(replenish, interval).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_tokens_round_up() {
        assert_eq!(part_iops_tokens(0, 100), None);
        assert_eq!(part_iops_tokens(10, 0), Some(1));
        assert_eq!(part_iops_tokens(10, 1), Some(1));
        assert_eq!(part_iops_tokens(10, 10), Some(1));
        assert_eq!(part_iops_tokens(10, 11), Some(2));
        assert_eq!(part_iops_tokens(1024 * 1024, 5 * 1024 * 1024), Some(5));
    }

    #[test]
    fn tiny_chunks_overflow_token_count() {
        assert_eq!(part_iops_tokens(1, u64::MAX), None);
    }

    #[tokio::test]
    async fn unconfigured_throttles_pass_through() {
        get_ops_token().await;
        get_part_iops_tokens(1, 1_000_000).await;
        let _guard = open_file_permit().await;
    }
}
