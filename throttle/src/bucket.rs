use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket backed by a tokio semaphore.
///
/// A bucket that was never configured (or configured with 0) is disabled and every acquire
/// returns immediately.
pub struct TokenBucket {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl TokenBucket {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn configure(&self, capacity: usize) {
        self.enabled.store(capacity > 0, Ordering::Release);
        if capacity == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(capacity);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Borrow a single token, returned to the bucket when the permit drops.
    pub async fn borrow(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed
        self.sem.acquire().await.ok()
    }

    /// Take tokens out of the bucket for good; they come back only through refills.
    pub async fn take(&self, tokens: u32) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire_many(tokens).await {
            permit.forget();
        }
    }

    /// Top the bucket up to `level` tokens every `interval`. Never returns for an enabled bucket.
    pub async fn refill_forever(&self, level: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let current = self.sem.available_permits();
            if current < level {
                self.sem.add_permits(level - current);
            }
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}
