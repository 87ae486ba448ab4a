use thiserror::Error;

use crate::records::PlayKey;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// How a failure is handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Logged and skipped or diverted; the partition keeps moving.
    RecoverableLocal,
    /// Retried with backoff; fatal for the worker once retries are exhausted.
    SurfacedForRetry,
    /// The play is still emitted, with `completeness = false`.
    DegradedButEmitted,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed {stream} record at offset {offset}: {reason}")]
    MalformedRecord {
        stream: &'static str,
        offset: u64,
        reason: String,
    },

    #[error("late data for {key}: {reason}")]
    LateData { key: PlayKey, reason: String },

    #[error("stream '{stream}' partition {partition} unavailable after {attempts} attempts: {source}")]
    StreamUnavailable {
        stream: String,
        partition: usize,
        attempts: u32,
        #[source]
        source: LogError,
    },

    #[error("sink failure for {key} after {attempts} attempts: {source}")]
    SinkFailure {
        key: PlayKey,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("state for {key} exceeded max age of {max_age_ms}ms")]
    StateTimeout { key: PlayKey, max_age_ms: i64 },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("worker p{partition} panicked")]
    WorkerPanicked { partition: usize },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::MalformedRecord { .. } | PipelineError::LateData { .. } => {
                ErrorClass::RecoverableLocal
            }
            PipelineError::StreamUnavailable { .. }
            | PipelineError::SinkFailure { .. }
            | PipelineError::Checkpoint(_)
            | PipelineError::Config(_)
            | PipelineError::WorkerPanicked { .. } => ErrorClass::SurfacedForRetry,
            PipelineError::StateTimeout { .. } => ErrorClass::DegradedButEmitted,
        }
    }
}

/// Transient failure reading from a log partition.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("offset {offset} out of range (end {end})")]
    OffsetOutOfRange { offset: u64, end: u64 },
    #[error("commit failed: {0}")]
    Commit(String),
}

/// Failure publishing to a downstream sink.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        SinkError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorClass, LogError, PipelineError, SinkError};
    use crate::records::PlayKey;

    #[test]
    fn taxonomy_classes_match_handling_policy() {
        let key = PlayKey::new("2023_01_ARI_WAS", 55);
        let malformed = PipelineError::MalformedRecord {
            stream: "frames",
            offset: 3,
            reason: "x out of range".to_string(),
        };
        let late = PipelineError::LateData {
            key: key.clone(),
            reason: "closed".to_string(),
        };
        let stream = PipelineError::StreamUnavailable {
            stream: "plays".to_string(),
            partition: 0,
            attempts: 5,
            source: LogError::Read("io".to_string()),
        };
        let sink = PipelineError::SinkFailure {
            key: key.clone(),
            attempts: 5,
            source: SinkError::Storage("locked".to_string()),
        };
        let timeout = PipelineError::StateTimeout {
            key,
            max_age_ms: 1000,
        };
        assert_eq!(malformed.class(), ErrorClass::RecoverableLocal);
        assert_eq!(late.class(), ErrorClass::RecoverableLocal);
        assert_eq!(stream.class(), ErrorClass::SurfacedForRetry);
        assert_eq!(sink.class(), ErrorClass::SurfacedForRetry);
        assert_eq!(timeout.class(), ErrorClass::DegradedButEmitted);
    }
}
