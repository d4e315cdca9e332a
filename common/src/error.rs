use std::path::PathBuf;
use thiserror::Error;

/// Which of the two companion IDX files a [`FormatError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdxFile {
    Images,
    Labels,
}

impl std::fmt::Display for IdxFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdxFile::Images => f.write_str("images file"),
            IdxFile::Labels => f.write_str("labels file"),
        }
    }
}

/// A malformed IDX header or payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("{file}: header needs {needed} bytes but only {found} are present")]
    TruncatedHeader {
        file: IdxFile,
        needed: usize,
        found: usize,
    },

    #[error("{file}: bad magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        file: IdxFile,
        expected: u32,
        found: u32,
    },

    #[error("{file}: item count is negative ({value})")]
    NegativeCount { file: IdxFile, value: i32 },

    #[error("{file}: {dimension} must be positive, got {value}")]
    NonPositiveDimension {
        file: IdxFile,
        dimension: &'static str,
        value: i32,
    },

    #[error("{file}: payload needs {expected} bytes but only {found} are present")]
    TruncatedPayload {
        file: IdxFile,
        expected: u64,
        found: u64,
    },

    #[error("images file holds {images} items but labels file holds {labels}")]
    CountMismatch { images: usize, labels: usize },
}

/// Failure to read a dataset from disk.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Failure of a single exchange with the classification service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("service responded with status {status}")]
    Status { status: u16 },

    #[error("could not decode response body: {0}")]
    Decode(String),

    #[error("request cancelled before it resolved")]
    Cancelled,

    #[error("request task failed: {0}")]
    Task(String),
}

impl ServiceError {
    /// Transport-level failures are worth another attempt; a response the
    /// service actually produced is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Network(_) | ServiceError::Timeout)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Network(_) => "network",
            ServiceError::Timeout => "timeout",
            ServiceError::Status { .. } => "status",
            ServiceError::Decode(_) => "decode",
            ServiceError::Cancelled => "cancelled",
            ServiceError::Task(_) => "task",
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout
        } else if let Some(status) = err.status() {
            ServiceError::Status {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("got {predicted} predictions for {expected} expected labels")]
pub struct LengthMismatchError {
    pub predicted: usize,
    pub expected: usize,
}
