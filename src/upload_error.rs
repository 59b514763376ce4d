//! Errors for the Data Lake upload pipeline.

use std::io;

use thiserror::Error;

use crate::{env_config::EnvError, store_front_end::FrontEndError};

/// Error type for upload parameters, metadata and segment uploads.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Configuration could not be read.
    #[error(transparent)]
    Env(#[from] EnvError),

    /// Upload parameters are unusable.
    #[error("invalid upload parameters: {0}")]
    InvalidParameters(String),

    /// Local file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Metadata could not be (de)serialized.
    #[error("metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Metadata file is inconsistent or stale.
    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),

    /// No delimiter near a segment boundary or inside an upload block.
    #[error(
        "Unable to locate a record boundary within {window_mb}MB on either side of segment {segment_number} (offset {offset}). This means the record at that offset is larger than {window_mb}MB."
    )]
    NoRecordBoundary {
        /// Half of the search window, in MiB.
        window_mb: usize,
        /// Segment being aligned or uploaded.
        segment_number: usize,
        /// File offset that was searched around.
        offset: u64,
    },

    /// Remote stream length differs from the uploaded segment length.
    #[error("segment {segment_number} has remote length {actual}, expected {expected}")]
    SegmentLengthMismatch {
        /// Segment number.
        segment_number: usize,
        /// Local segment length.
        expected: u64,
        /// Length reported by the store.
        actual: u64,
    },

    /// One or more segments failed after retries.
    #[error("upload failed for segments {0:?}")]
    SegmentsFailed(Vec<usize>),

    /// The target exists and overwrite is disabled.
    #[error("target stream '{0}' already exists and overwrite is disabled")]
    TargetExists(String),

    /// Store call failed.
    #[error(transparent)]
    FrontEnd(#[from] FrontEndError),

    /// A blocking worker panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
