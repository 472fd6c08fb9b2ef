//! Errors of a single file upload attempt

use std::path::PathBuf;

use crate::destination;

/// Error returned by one upload attempt of a single file
///
/// # Logging Convention
/// Log with `{:#}` to see the whole cause chain.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Destination(#[from] destination::Error),
    /// The file shrank or was replaced after some of it was uploaded.
    #[error(
        "{path:?} is {file_size} bytes but {uploaded_size} bytes of it were already uploaded, the file was truncated or replaced"
    )]
    UploadedSizeExceedsFileSize {
        path: PathBuf,
        uploaded_size: u64,
        file_size: u64,
    },
    #[error("cannot finish uploading: {0}")]
    CannotFinishUploading(String),
    /// Some parts failed; the others are on the backend and the session stays open.
    #[error("parts {parts:?} failed to upload")]
    PartsFailed { parts: Vec<u32> },
    #[error("{0:#}")]
    Io(#[source] anyhow::Error),
}

impl Error {
    /// Retrying the whole file may help, unlike for a size violation.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::UploadedSizeExceedsFileSize { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn size_violation_is_final() {
        let error = Error::UploadedSizeExceedsFileSize {
            path: PathBuf::from("a.ts"),
            uploaded_size: 10,
            file_size: 5,
        };
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("truncated or replaced"));
        assert!(Error::CannotFinishUploading("timeout".to_string()).is_retryable());
        assert!(Error::Io(anyhow!("disk gone")).is_retryable());
        assert!(Error::PartsFailed { parts: vec![2] }.is_retryable());
    }

    #[test]
    fn io_error_shows_chain() {
        let error = Error::Io(anyhow!("permission denied").context("failed opening \"a.ts\""));
        assert_eq!(
            error.to_string(),
            "failed opening \"a.ts\": permission denied"
        );
    }
}
