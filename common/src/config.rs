//! Configuration types for runtime, throttling, output and uploads

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open local files (None = no limit)
    pub max_open_files: Option<usize>,
    /// Backend requests per second (0 = no throttle)
    pub ops_throttle: usize,
    /// Uploaded chunks per second (0 = no throttle)
    pub iops_throttle: usize,
    /// Chunk size used to convert part sizes into I/O tokens (bytes)
    pub chunk_size: u64,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.iops_throttle > 0 && self.chunk_size == 0 {
            return Err("chunk_size must be specified when using iops_throttle".to_string());
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Settings of the upload engine
#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    /// Concurrent part uploads per file
    pub threads: usize,
    /// Walk subdirectories
    pub recursive: bool,
    /// Whole-file attempts before a file counts as failed
    pub max_attempts: usize,
    /// Delay after the first failed attempt, grows linearly
    pub retry_delay: std::time::Duration,
    pub checksum_algorithm: crate::checksum::ChecksumAlgorithm,
    /// Ceiling for waiting on outstanding part uploads
    pub drain_timeout: std::time::Duration,
    /// Stop at the first file that fails
    pub fail_early: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            recursive: false,
            max_attempts: 3,
            retry_delay: std::time::Duration::from_secs(1),
            checksum_algorithm: Default::default(),
            drain_timeout: crate::uploader::DEFAULT_DRAIN_TIMEOUT,
            fail_early: false,
        }
    }
}

impl UploadConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("threads must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.drain_timeout.is_zero() {
            return Err("drain_timeout must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn strategy_settings(&self) -> crate::strategy::Settings {
        crate::strategy::Settings {
            threads: self.threads,
            checksum_algorithm: self.checksum_algorithm,
            drain_timeout: self.drain_timeout,
        }
    }

    pub fn sync_settings(&self) -> crate::sync::Settings {
        crate::sync::Settings {
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            fail_early: self.fail_early,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iops_throttle_needs_chunk_size() {
        let config = ThrottleConfig {
            iops_throttle: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ThrottleConfig {
            iops_throttle: 10,
            chunk_size: 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn upload_config_limits() {
        assert!(UploadConfig::default().validate().is_ok());
        for config in [
            UploadConfig {
                threads: 0,
                ..Default::default()
            },
            UploadConfig {
                max_attempts: 0,
                ..Default::default()
            },
            UploadConfig {
                drain_timeout: std::time::Duration::ZERO,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }
}
