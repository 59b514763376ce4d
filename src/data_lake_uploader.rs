//! End-to-end upload of a local file to a Data Lake Store stream.
//!
//! The file is split into segments which are uploaded in parallel to a
//! temporary directory next to the target, then joined into the target
//! stream. Progress is tracked in a local metadata file so an interrupted
//! upload can be resumed.

use std::{sync::Arc, time::Duration};

use crate::{
    segment_uploader::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF, MultipleSegmentUploader},
    store_front_end::FrontEndAdapter,
    upload_error::UploadError,
    upload_metadata::{UploadMetadata, canonical_metadata_path},
    upload_metadata_generator::{DEFAULT_MAX_APPEND_LENGTH, UploadMetadataGenerator},
    upload_parameters::UploadParameters,
};

/// Outcome of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    /// Id of the upload (shared by every run of a resumed upload).
    pub upload_id: String,
    /// Stream that now holds the file.
    pub target_stream_path: String,
    /// Bytes uploaded.
    pub file_length: u64,
    /// Number of segments the file was split into.
    pub segment_count: usize,
    /// Whether an earlier run's metadata was picked up.
    pub resumed: bool,
}

/// Uploads one file as described by [`UploadParameters`].
pub struct DataLakeUploader {
    parameters: UploadParameters,
    front_end: Arc<dyn FrontEndAdapter>,
    max_append_length: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl DataLakeUploader {
    /// Uploader talking to the store through `front_end`.
    #[must_use]
    pub fn new(parameters: UploadParameters, front_end: Arc<dyn FrontEndAdapter>) -> Self {
        Self {
            parameters,
            front_end,
            max_append_length: DEFAULT_MAX_APPEND_LENGTH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Set the largest single append, which is also the record search window.
    #[must_use]
    pub const fn with_max_append_length(mut self, max_append_length: usize) -> Self {
        self.max_append_length = max_append_length;
        self
    }

    /// Set retries per store call and the initial backoff.
    #[must_use]
    pub const fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Parameters of this upload.
    #[must_use]
    pub const fn parameters(&self) -> &UploadParameters {
        &self.parameters
    }

    /// Run the upload.
    ///
    /// This method will:
    /// 1. Validate the parameters
    /// 2. Refuse an existing target unless overwriting
    /// 3. Load the previous metadata when resuming, or lay out a new upload
    /// 4. Upload every incomplete segment
    /// 5. Join the segments into the target
    /// 6. Delete the local metadata file
    ///
    /// # Errors
    ///
    /// Returns the first error hit. After a segment failure the metadata file is
    /// kept so the upload can be resumed.
    pub async fn execute(&self) -> Result<UploadSummary, UploadError> {
        self.parameters.validate()?;

        let target = self.parameters.target_stream_path.as_str();
        if !self.parameters.is_overwrite && self.front_end.stream_exists(target).await? {
            return Err(UploadError::TargetExists(target.to_string()));
        }

        let (metadata, resumed) = self.prepare_metadata().await?;
        tracing::info!(
            upload_id = %metadata.upload_id,
            input = %metadata.input_file_path.display(),
            target,
            segments = metadata.segment_count,
            bytes = metadata.file_length,
            resumed,
            "starting upload"
        );

        let metadata = MultipleSegmentUploader::new(metadata, self.parameters.thread_count, Arc::clone(&self.front_end))
            .with_max_append_length(self.max_append_length)
            .with_retry(self.max_retries, self.retry_backoff)
            .upload()
            .await?;

        self.finalize(&metadata).await?;
        metadata.delete_file()?;

        tracing::info!(upload_id = %metadata.upload_id, target, "upload complete");
        Ok(UploadSummary {
            upload_id: metadata.upload_id,
            target_stream_path: metadata.target_stream_path,
            file_length: metadata.file_length,
            segment_count: metadata.segment_count,
            resumed,
        })
    }

    async fn prepare_metadata(&self) -> Result<(UploadMetadata, bool), UploadError> {
        let path = canonical_metadata_path(&self.parameters);
        let generator = UploadMetadataGenerator::with_max_append_length(self.parameters.clone(), self.max_append_length);

        if self.parameters.is_resume {
            if path.is_file() {
                let metadata = generator.get_existing_metadata(&path)?;
                return Ok((metadata, true));
            }
            tracing::warn!(path = %path.display(), "no metadata to resume from, starting a new upload");
        } else if path.is_file() {
            self.discard_stale_upload(&path).await?;
        }

        // Alignment reads the input file, keep it off the runtime threads.
        let metadata = tokio::task::spawn_blocking(move || generator.create_new_metadata(path)).await??;
        Ok((metadata, false))
    }

    async fn discard_stale_upload(&self, path: &std::path::Path) -> Result<(), UploadError> {
        match UploadMetadata::load_from(path) {
            Ok(stale) => {
                tracing::debug!(
                    upload_id = %stale.upload_id,
                    directory = %stale.segment_stream_directory,
                    "removing leftovers of an earlier upload"
                );
                if let Err(e) = self.front_end.delete_stream(&stale.segment_stream_directory, true).await {
                    tracing::warn!(error = %e, "could not delete stale segment directory");
                }
                stale.delete_file()
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "unreadable metadata file, replacing it");
                std::fs::remove_file(path)?;
                Ok(())
            }
        }
    }

    async fn finalize(&self, metadata: &UploadMetadata) -> Result<(), UploadError> {
        let target = metadata.target_stream_path.as_str();
        if self.parameters.is_overwrite && self.front_end.stream_exists(target).await? {
            tracing::debug!(target, "deleting existing target");
            self.front_end.delete_stream(target, false).await?;
        }

        if let [segment] = metadata.segments.as_slice() {
            self.front_end.rename(&segment.path, target).await?;
            self.front_end
                .delete_stream(&metadata.segment_stream_directory, true)
                .await?;
        } else {
            let inputs: Vec<String> = metadata.segments.iter().map(|s| s.path.clone()).collect();
            self.front_end.concatenate(target, &inputs).await?;
        }

        let length = self.front_end.stream_length(target).await?;
        if length != metadata.file_length {
            return Err(UploadError::InvalidMetadata(format!(
                "target '{target}' has {length} bytes after finalizing, expected {}",
                metadata.file_length
            )));
        }
        Ok(())
    }
}
