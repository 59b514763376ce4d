//! Segment uploads: one segment at a time, and many in parallel.
//!
//! A segment is streamed in blocks of at most `max_append_length` bytes. The
//! first block creates the segment stream, later blocks append to it. For text
//! uploads every block except the segment's final one is cut right after its
//! last record terminator, so no append splits a record.
//!
//! Failed calls are retried with capped exponential backoff. Before retrying,
//! the remote length is checked: a failed call whose data did land is not sent
//! again.

use std::{io::SeekFrom, path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::{Mutex, Semaphore, watch},
    task::JoinSet,
};

use crate::{
    azure_client::next_backoff,
    record_boundary::{self, TextEncoding},
    store_front_end::FrontEndAdapter,
    upload_error::UploadError,
    upload_metadata::{SegmentStatus, UploadMetadata, UploadSegmentMetadata},
    upload_metadata_generator::DEFAULT_MAX_APPEND_LENGTH,
};

/// Default number of retries per store call.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default initial retry backoff.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Snapshot of upload progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes in the input file.
    pub total_bytes: u64,
    /// Bytes in completed segments.
    pub uploaded_bytes: u64,
    /// Completed segments.
    pub segments_complete: usize,
    /// Total segments.
    pub segment_count: usize,
}

impl UploadProgress {
    /// Progress as recorded in `metadata`.
    #[must_use]
    pub fn of(metadata: &UploadMetadata) -> Self {
        Self {
            total_bytes: metadata.file_length,
            uploaded_bytes: metadata.uploaded_bytes(),
            segments_complete: metadata
                .segments
                .iter()
                .filter(|s| s.status == SegmentStatus::Complete)
                .count(),
            segment_count: metadata.segment_count,
        }
    }
}

/// Uploads one segment of the input file to its segment stream.
#[derive(Clone)]
pub struct SingleSegmentUploader {
    segment: UploadSegmentMetadata,
    input_file_path: PathBuf,
    is_binary: bool,
    encoding: TextEncoding,
    delimiter: Option<String>,
    front_end: Arc<dyn FrontEndAdapter>,
    max_append_length: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SingleSegmentUploader {
    /// Uploader for segment `segment_number` of `metadata`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetadata` if the metadata has no such segment.
    pub fn new(
        segment_number: usize,
        metadata: &UploadMetadata,
        front_end: Arc<dyn FrontEndAdapter>,
    ) -> Result<Self, UploadError> {
        let segment = metadata
            .segments
            .get(segment_number)
            .cloned()
            .ok_or_else(|| UploadError::InvalidMetadata(format!("no segment {segment_number}")))?;

        Ok(Self {
            segment,
            input_file_path: metadata.input_file_path.clone(),
            is_binary: metadata.is_binary,
            encoding: metadata.encoding,
            delimiter: metadata.delimiter.clone(),
            front_end,
            max_append_length: DEFAULT_MAX_APPEND_LENGTH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    /// Set the largest block sent in one call.
    #[must_use]
    pub const fn with_max_append_length(mut self, max_append_length: usize) -> Self {
        self.max_append_length = max_append_length;
        self
    }

    /// Set retries per call and the initial backoff.
    #[must_use]
    pub const fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Upload the segment and verify the remote length.
    ///
    /// # Errors
    ///
    /// Returns `NoRecordBoundary` for a text block without terminator, a store
    /// error once retries are exhausted, or `SegmentLengthMismatch`.
    pub async fn upload(&self) -> Result<(), UploadError> {
        let segment = &self.segment;
        tracing::debug!(
            segment = segment.segment_number,
            offset = segment.offset,
            length = segment.length,
            path = %segment.path,
            "uploading segment"
        );

        if segment.length == 0 {
            self.send_block(&[], 0, true).await?;
            return self.verify_length().await;
        }

        let mut file = tokio::fs::File::open(&self.input_file_path).await?;
        let mut buffer = vec![0u8; self.max_append_length.max(1)];
        let mut sent = 0u64;

        while sent < segment.length {
            let to_read = usize::try_from(segment.length - sent).map_or(buffer.len(), |r| r.min(buffer.len()));
            file.seek(SeekFrom::Start(segment.offset + sent)).await?;
            file.read_exact(&mut buffer[..to_read]).await?;

            let is_final = sent + to_read as u64 == segment.length;
            let block = if self.is_binary || is_final {
                &buffer[..to_read]
            } else {
                let Some(cut) =
                    record_boundary::find_last_record_end(&buffer[..to_read], self.encoding, self.delimiter.as_deref())
                else {
                    return Err(UploadError::NoRecordBoundary {
                        window_mb: self.max_append_length / 1024 / 1024,
                        segment_number: segment.segment_number,
                        offset: segment.offset + sent,
                    });
                };
                &buffer[..=cut]
            };

            self.send_block(block, sent, is_final).await?;
            sent += block.len() as u64;
        }

        self.verify_length().await
    }

    async fn send_block(&self, data: &[u8], offset: u64, is_last: bool) -> Result<(), UploadError> {
        let path = self.segment.path.as_str();
        let expected_after = offset + data.len() as u64;
        let mut attempt: u32 = 0;
        let mut backoff = self.retry_backoff;

        loop {
            attempt = attempt.saturating_add(1);
            let result = if offset == 0 {
                self.front_end.create_stream(path, true, data, is_last).await
            } else {
                self.front_end.append_to_stream(path, data, offset, is_last).await
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt > self.max_retries => return Err(e.into()),
                Err(e) => e,
            };

            tracing::warn!(
                segment = self.segment.segment_number,
                offset,
                attempt,
                error = %err,
                "block upload failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);

            match self.front_end.stream_length(path).await {
                Ok(len) if len == expected_after => {
                    tracing::debug!(segment = self.segment.segment_number, offset, "block was applied despite the error");
                    return Ok(());
                }
                Ok(len) if len == offset || offset == 0 => {}
                Ok(len) => {
                    return Err(UploadError::SegmentLengthMismatch {
                        segment_number: self.segment.segment_number,
                        expected: offset,
                        actual: len,
                    });
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(error = %e, "could not read segment stream length"),
            }
        }
    }

    async fn verify_length(&self) -> Result<(), UploadError> {
        let actual = self.front_end.stream_length(&self.segment.path).await?;
        if actual == self.segment.length {
            Ok(())
        } else {
            Err(UploadError::SegmentLengthMismatch {
                segment_number: self.segment.segment_number,
                expected: self.segment.length,
                actual,
            })
        }
    }
}

/// Uploads every incomplete segment with bounded concurrency.
///
/// The metadata is re-saved after every status change, so an interrupted run
/// can resume with the completed segments skipped.
pub struct MultipleSegmentUploader {
    metadata: Arc<Mutex<UploadMetadata>>,
    front_end: Arc<dyn FrontEndAdapter>,
    thread_count: usize,
    max_append_length: usize,
    max_retries: u32,
    retry_backoff: Duration,
    progress: Arc<watch::Sender<UploadProgress>>,
}

impl MultipleSegmentUploader {
    /// Uploader running at most `thread_count` segments at once.
    #[must_use]
    pub fn new(metadata: UploadMetadata, thread_count: usize, front_end: Arc<dyn FrontEndAdapter>) -> Self {
        let (progress, _) = watch::channel(UploadProgress::of(&metadata));
        Self {
            metadata: Arc::new(Mutex::new(metadata)),
            front_end,
            thread_count: thread_count.max(1),
            max_append_length: DEFAULT_MAX_APPEND_LENGTH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            progress: Arc::new(progress),
        }
    }

    /// Set the largest block sent in one call.
    #[must_use]
    pub const fn with_max_append_length(mut self, max_append_length: usize) -> Self {
        self.max_append_length = max_append_length;
        self
    }

    /// Set retries per call and the initial backoff.
    #[must_use]
    pub const fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Receive progress updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    /// Upload all segments that are not complete yet.
    ///
    /// Returns the final metadata.
    ///
    /// # Errors
    ///
    /// Returns `SegmentsFailed` listing the failed segments once all in-flight
    /// uploads have ended, or an error from saving the metadata.
    pub async fn upload(self) -> Result<UploadMetadata, UploadError> {
        let (pending, uploaders) = {
            let metadata = self.metadata.lock().await;
            let pending: Vec<usize> = metadata
                .segments
                .iter()
                .filter(|s| s.status != SegmentStatus::Complete)
                .map(|s| s.segment_number)
                .collect();
            let uploaders = pending
                .iter()
                .map(|&n| {
                    SingleSegmentUploader::new(n, &metadata, Arc::clone(&self.front_end)).map(|u| {
                        u.with_max_append_length(self.max_append_length)
                            .with_retry(self.max_retries, self.retry_backoff)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            (pending, uploaders)
        };

        tracing::info!(
            pending = pending.len(),
            threads = self.thread_count,
            "uploading segments"
        );

        let semaphore = Arc::new(Semaphore::new(self.thread_count));
        let mut tasks = JoinSet::new();
        for (n, uploader) in pending.into_iter().zip(uploaders) {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let metadata = Arc::clone(&self.metadata);
            let progress = Arc::clone(&self.progress);

            tasks.spawn(async move {
                let _permit = permit;
                set_status(&metadata, &progress, n, SegmentStatus::InProgress).await?;
                let result = uploader.upload().await;
                if let Err(e) = &result {
                    tracing::error!(segment = n, error = %e, "segment upload failed");
                }
                let status = if result.is_ok() {
                    SegmentStatus::Complete
                } else {
                    SegmentStatus::Failed
                };
                set_status(&metadata, &progress, n, status).await?;
                Ok::<_, UploadError>(result.is_err().then_some(n))
            });
        }

        let mut failed = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(n))) => failed.push(n),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(UploadError::Join(e));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if !failed.is_empty() {
            failed.sort_unstable();
            return Err(UploadError::SegmentsFailed(failed));
        }

        let metadata = self.metadata.lock().await.clone();
        Ok(metadata)
    }
}

async fn set_status(
    metadata: &Mutex<UploadMetadata>,
    progress: &watch::Sender<UploadProgress>,
    segment_number: usize,
    status: SegmentStatus,
) -> Result<(), UploadError> {
    let mut metadata = metadata.lock().await;
    if let Some(segment) = metadata.segments.get_mut(segment_number) {
        segment.status = status;
    }
    metadata.save()?;
    progress.send_replace(UploadProgress::of(&metadata));
    Ok(())
}
