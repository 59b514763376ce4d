//! Builds (or reloads) the metadata of an upload.

use std::{fs, path::Path};

use crate::{
    record_boundary,
    upload_error::UploadError,
    upload_metadata::UploadMetadata,
    upload_parameters::UploadParameters,
};

/// Largest single append to the store, and the record boundary search window (4 MiB).
pub const DEFAULT_MAX_APPEND_LENGTH: usize = 4 * 1024 * 1024;

/// Creates upload metadata from parameters, aligning text segments to records.
#[derive(Debug, Clone)]
pub struct UploadMetadataGenerator {
    parameters: UploadParameters,
    max_append_length: usize,
}

impl UploadMetadataGenerator {
    /// Generator with the default max append length.
    #[must_use]
    pub const fn new(parameters: UploadParameters) -> Self {
        Self::with_max_append_length(parameters, DEFAULT_MAX_APPEND_LENGTH)
    }

    /// Generator with a custom max append length.
    #[must_use]
    pub const fn with_max_append_length(parameters: UploadParameters, max_append_length: usize) -> Self {
        Self {
            parameters,
            max_append_length,
        }
    }

    /// Load metadata saved by an earlier run and check it still matches the input.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file is missing, or `InvalidMetadata` if it is
    /// inconsistent or describes another input.
    pub fn get_existing_metadata(&self, metadata_file_path: impl AsRef<Path>) -> Result<UploadMetadata, UploadError> {
        let metadata = UploadMetadata::load_from(metadata_file_path)?;
        metadata.validate_consistency()?;

        if metadata.input_file_path != self.parameters.input_file_path {
            return Err(UploadError::InvalidMetadata(format!(
                "metadata describes '{}', not '{}'",
                metadata.input_file_path.display(),
                self.parameters.input_file_path.display()
            )));
        }
        let current_length = fs::metadata(&metadata.input_file_path)?.len();
        if current_length != metadata.file_length {
            return Err(UploadError::InvalidMetadata(format!(
                "input file is {current_length} bytes, metadata expects {}",
                metadata.file_length
            )));
        }
        Ok(metadata)
    }

    /// Lay out a new upload, align it to records for text files, and save it.
    ///
    /// # Errors
    ///
    /// Returns `NoRecordBoundary` if a segment cannot be aligned, or any I/O or
    /// consistency error from saving.
    pub fn create_new_metadata(&self, metadata_file_path: impl AsRef<Path>) -> Result<UploadMetadata, UploadError> {
        let mut metadata = UploadMetadata::new(metadata_file_path.as_ref(), &self.parameters)?;

        if !self.parameters.is_binary && metadata.segment_count > 1 {
            self.align_segments_to_record_boundaries(&mut metadata)?;
        }

        metadata.save()?;
        tracing::debug!(
            upload_id = %metadata.upload_id,
            segments = metadata.segment_count,
            file_length = metadata.file_length,
            "created upload metadata"
        );
        Ok(metadata)
    }

    /// Move every segment end to just after a record terminator.
    ///
    /// Segments are walked in order with a running offset: each one is rebased
    /// onto the end of the previous one, segments that would start at or past
    /// the end of the file are dropped, and the final segment takes whatever is
    /// left.
    ///
    /// # Errors
    ///
    /// Returns `NoRecordBoundary` if a boundary has no terminator nearby.
    pub fn align_segments_to_record_boundaries(&self, metadata: &mut UploadMetadata) -> Result<(), UploadError> {
        let mut file = fs::File::open(&metadata.input_file_path)?;
        let file_length = metadata.file_length;
        let last = metadata.segments.len().saturating_sub(1);

        let mut offset = 0u64;
        let mut kept = 0usize;
        for segment in &mut metadata.segments {
            let original_end = segment.end();
            segment.offset = offset;
            segment.length = original_end.saturating_sub(offset).max(1);
            if segment.offset >= file_length {
                continue;
            }

            if segment.segment_number == last || segment.end() >= file_length {
                segment.length = file_length - offset;
            } else {
                let adjustment = record_boundary::determine_length_adjustment(
                    segment,
                    &mut file,
                    self.max_append_length,
                    metadata.encoding,
                    metadata.delimiter.as_deref(),
                )?;
                segment.length = segment
                    .length
                    .saturating_add_signed(adjustment + 1)
                    .min(file_length - offset);
            }

            offset += segment.length;
            kept += 1;
        }

        if kept < metadata.segments.len() {
            tracing::debug!(
                before = metadata.segments.len(),
                after = kept,
                "dropping segments emptied by record alignment"
            );
            metadata.segments.truncate(kept);
            metadata.segment_count = kept;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload_metadata::canonical_metadata_path;

    fn setup(contents: &[u8], max_segment: u64) -> (tempfile::TempDir, UploadParameters) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("records.txt");
        fs::write(&file, contents).unwrap();
        let params = UploadParameters::new(&file, "/lake/records.txt", "acct")
            .with_metadata_location(dir.path())
            .with_max_segment_length(max_segment);
        (dir, params)
    }

    fn lines(count: usize, width: usize) -> Vec<u8> {
        (0..count)
            .flat_map(|i| {
                let mut line = vec![b'a' + (i % 26) as u8; width - 1];
                line.push(b'\n');
                line
            })
            .collect()
    }

    #[test]
    fn text_segments_end_on_record_boundaries() {
        let contents = lines(40, 7);
        let (_dir, params) = setup(&contents, 50);
        let generator = UploadMetadataGenerator::with_max_append_length(params.clone(), 32);

        let md = generator.create_new_metadata(canonical_metadata_path(&params)).unwrap();
        md.validate_consistency().unwrap();
        assert!(md.segment_count > 1);
        for s in &md.segments {
            let end = usize::try_from(s.end()).unwrap();
            assert_eq!(contents[end - 1], b'\n', "segment {} ends mid-record", s.segment_number);
        }
    }

    #[test]
    fn custom_delimiter_is_honoured() {
        let contents = b"aaaa;bbbb;cccc;dddd;eeee;ffff;".repeat(3);
        let (_dir, params) = setup(&contents, 20);
        let generator = UploadMetadataGenerator::with_max_append_length(params.clone().with_delimiter(";"), 16);

        let md = generator.create_new_metadata(params.local_metadata_location.join("m.json")).unwrap();
        for s in &md.segments {
            let end = usize::try_from(s.end()).unwrap();
            assert_eq!(contents[end - 1], b';');
        }
    }

    #[test]
    fn binary_uploads_keep_the_plain_layout() {
        let (_dir, params) = setup(&lines(10, 5), 12);
        let generator = UploadMetadataGenerator::with_max_append_length(params.clone().with_binary(true), 8);
        let md = generator.create_new_metadata(canonical_metadata_path(&params)).unwrap();
        assert!(md.segments.iter().all(|s| s.offset % 10 == 0 && s.length == 10));
        assert_eq!(md.segment_count, 5);
    }

    #[test]
    fn alignment_drops_segments_past_the_end() {
        let (_dir, params) = setup(b"aaaaaaaaa\nb", 3);
        let generator = UploadMetadataGenerator::with_max_append_length(params.clone(), 16);
        let md = generator.create_new_metadata(canonical_metadata_path(&params)).unwrap();

        let ranges: Vec<(u64, u64)> = md.segments.iter().map(|s| (s.offset, s.length)).collect();
        assert_eq!(ranges, vec![(0, 10), (10, 1)]);
        assert_eq!(md.segment_count, 2);
    }

    #[test]
    fn oversized_record_fails_alignment() {
        let (_dir, params) = setup(&[b'z'; 64], 16);
        let generator = UploadMetadataGenerator::with_max_append_length(params.clone(), 8);
        let err = generator
            .create_new_metadata(canonical_metadata_path(&params))
            .unwrap_err();
        assert!(matches!(err, UploadError::NoRecordBoundary { segment_number: 0, .. }));
        assert!(!canonical_metadata_path(&params).exists());
    }

    #[test]
    fn existing_metadata_must_match_the_input() {
        let (_dir, params) = setup(&lines(4, 4), 1024);
        let path = canonical_metadata_path(&params);
        let generator = UploadMetadataGenerator::new(params.clone());
        let created = generator.create_new_metadata(&path).unwrap();

        let loaded = generator.get_existing_metadata(&path).unwrap();
        assert_eq!(loaded.upload_id, created.upload_id);

        fs::write(&params.input_file_path, b"changed").unwrap();
        assert!(matches!(
            generator.get_existing_metadata(&path),
            Err(UploadError::InvalidMetadata(_))
        ));
    }
}
