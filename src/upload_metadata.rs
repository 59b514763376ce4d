//! Upload metadata: how a file is cut into segments, and how far the upload got.
//!
//! The metadata is persisted as pretty JSON in a local directory so an
//! interrupted upload can resume. Writes are atomic (temp file + rename) and
//! every save validates consistency first.

use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{record_boundary::TextEncoding, upload_error::UploadError, upload_parameters::UploadParameters};

/// Version of the metadata file format.
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Upload state of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentStatus {
    /// Not started.
    #[default]
    Pending,
    /// Being uploaded.
    InProgress,
    /// Uploaded and verified.
    Complete,
    /// Gave up after retries.
    Failed,
}

/// One contiguous byte range of the input file, uploaded to its own stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSegmentMetadata {
    /// Position of the segment, from 0.
    pub segment_number: usize,
    /// First byte in the input file.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
    /// Upload state.
    pub status: SegmentStatus,
    /// Stream path the segment is uploaded to.
    pub path: String,
}

impl UploadSegmentMetadata {
    /// Offset right after the segment's last byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Persistent description of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    /// File format version.
    pub format_version: u32,
    /// Random id, also part of the segment directory name.
    pub upload_id: String,
    /// Local file being uploaded.
    pub input_file_path: PathBuf,
    /// Length of the input file when the metadata was created.
    pub file_length: u64,
    /// Final stream path.
    pub target_stream_path: String,
    /// Remote directory holding the segment streams.
    pub segment_stream_directory: String,
    /// Number of segments.
    pub segment_count: usize,
    /// Nominal segment length before record alignment.
    pub segment_length: u64,
    /// Segments in file order.
    pub segments: Vec<UploadSegmentMetadata>,
    /// Binary upload (no record alignment).
    pub is_binary: bool,
    /// Text encoding of the file.
    pub encoding: TextEncoding,
    /// Record delimiter, `None` for CR/LF/CRLF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    /// Where this metadata lives on disk.
    #[serde(skip)]
    pub metadata_file_path: PathBuf,
}

/// `max(1, ceil(file_length / max_segment_length))`.
#[must_use]
pub const fn segment_count_for(file_length: u64, max_segment_length: u64) -> usize {
    if file_length == 0 || max_segment_length == 0 {
        return 1;
    }
    file_length.div_ceil(max_segment_length) as usize
}

/// Nominal length of each segment so `segment_count` segments cover the file.
#[must_use]
pub const fn segment_length_for(file_length: u64, segment_count: usize) -> u64 {
    if segment_count == 0 {
        return file_length;
    }
    file_length.div_ceil(segment_count as u64)
}

/// Canonical metadata location: `{metadata dir}/{input file name}.upload.json`.
#[must_use]
pub fn canonical_metadata_path(parameters: &UploadParameters) -> PathBuf {
    let file_name = parameters
        .input_file_path
        .file_name()
        .map_or_else(|| "upload".into(), |n| n.to_string_lossy().into_owned());
    parameters
        .local_metadata_location
        .join(format!("{file_name}.upload.json"))
}

impl UploadMetadata {
    /// Lay out the segments of `parameters.input_file_path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the input file cannot be inspected.
    pub fn new(metadata_file_path: impl Into<PathBuf>, parameters: &UploadParameters) -> Result<Self, UploadError> {
        let file_length = fs::metadata(&parameters.input_file_path)?.len();
        let upload_id = uuid::Uuid::new_v4().to_string();
        let segment_count = segment_count_for(file_length, parameters.max_segment_length);
        let segment_length = segment_length_for(file_length, segment_count);

        let target = parameters.target_stream_path.trim_end_matches('/').to_string();
        let segment_stream_directory = format!("{target}.segments.{upload_id}");
        let file_name = parameters
            .input_file_path
            .file_name()
            .map_or_else(|| "upload".into(), |n| n.to_string_lossy().into_owned());

        let segments = (0..segment_count)
            .map(|n| {
                let offset = (n as u64).saturating_mul(segment_length).min(file_length);
                UploadSegmentMetadata {
                    segment_number: n,
                    offset,
                    length: segment_length.min(file_length - offset),
                    status: SegmentStatus::Pending,
                    path: format!("{segment_stream_directory}/{file_name}.{n}.segment"),
                }
            })
            .collect();

        Ok(Self {
            format_version: METADATA_FORMAT_VERSION,
            upload_id,
            input_file_path: parameters.input_file_path.clone(),
            file_length,
            target_stream_path: target,
            segment_stream_directory,
            segment_count,
            segment_length,
            segments,
            is_binary: parameters.is_binary,
            encoding: parameters.encoding,
            delimiter: parameters.delimiter.clone(),
            metadata_file_path: metadata_file_path.into(),
        })
    }

    /// Check that the segments tile the file exactly.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::InvalidMetadata` describing the first inconsistency.
    pub fn validate_consistency(&self) -> Result<(), UploadError> {
        let invalid = |msg: String| Err(UploadError::InvalidMetadata(msg));

        if self.format_version != METADATA_FORMAT_VERSION {
            return invalid(format!("unsupported format version {}", self.format_version));
        }
        if self.upload_id.trim().is_empty() {
            return invalid("upload id is empty".into());
        }
        if self.segments.is_empty() || self.segment_count != self.segments.len() {
            return invalid(format!(
                "segment count {} does not match {} segments",
                self.segment_count,
                self.segments.len()
            ));
        }

        let empty_file = self.file_length == 0 && self.segment_count == 1;
        let mut expected_offset = 0u64;
        let mut paths = HashSet::with_capacity(self.segments.len());
        for (i, s) in self.segments.iter().enumerate() {
            if s.segment_number != i {
                return invalid(format!("segment at position {i} is numbered {}", s.segment_number));
            }
            if s.offset != expected_offset {
                return invalid(format!(
                    "segment {i} starts at {} but the previous segment ends at {expected_offset}",
                    s.offset
                ));
            }
            if s.length == 0 && !empty_file {
                return invalid(format!("segment {i} is empty"));
            }
            if !paths.insert(s.path.as_str()) {
                return invalid(format!("segment path '{}' is used twice", s.path));
            }
            expected_offset = s.end();
        }

        if expected_offset != self.file_length {
            return invalid(format!(
                "segments cover {expected_offset} bytes, file has {}",
                self.file_length
            ));
        }
        Ok(())
    }

    /// Validate and write the metadata atomically to `metadata_file_path`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetadata` if inconsistent, or any I/O / serialization error.
    pub fn save(&self) -> Result<(), UploadError> {
        self.validate_consistency()?;

        let path = &self.metadata_file_path;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone();
        tmp.set_file_name(format!(
            ".{}.tmp",
            path.file_name().and_then(|s| s.to_str()).unwrap_or("upload.json")
        ));

        let json = serde_json::to_vec_pretty(self)?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }

        if path.exists() {
            let _ = fs::remove_file(path);
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read metadata from `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if unreadable, or `InvalidMetadata` for an unsupported
    /// format version.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let mut metadata: Self = serde_json::from_slice(&bytes)?;
        if metadata.format_version != METADATA_FORMAT_VERSION {
            return Err(UploadError::InvalidMetadata(format!(
                "unsupported format version {} in {}",
                metadata.format_version,
                path.display()
            )));
        }
        metadata.metadata_file_path = path.to_path_buf();
        Ok(metadata)
    }

    /// Remove the metadata file. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns any other I/O error.
    pub fn delete_file(&self) -> Result<(), UploadError> {
        match fs::remove_file(&self.metadata_file_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Bytes in segments already marked complete.
    #[must_use]
    pub fn uploaded_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Complete)
            .map(|s| s.length)
            .sum()
    }

    /// Whether every segment is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|s| s.status == SegmentStatus::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(contents: &[u8]) -> (tempfile::TempDir, UploadParameters) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.csv");
        fs::write(&file, contents).unwrap();
        let params = UploadParameters::new(&file, "/lake/data.csv", "acct").with_metadata_location(dir.path());
        (dir, params)
    }

    #[test]
    fn segment_math() {
        assert_eq!(segment_count_for(0, 10), 1);
        assert_eq!(segment_count_for(10, 10), 1);
        assert_eq!(segment_count_for(11, 10), 2);
        assert_eq!(segment_length_for(10, 4), 3);
        assert_eq!(segment_length_for(0, 1), 0);
    }

    #[test]
    fn new_metadata_tiles_the_file() {
        let (_dir, params) = input(&[b'x'; 10]);
        let md = UploadMetadata::new("/tmp/unused.json", &params.with_max_segment_length(3)).unwrap();

        assert_eq!(md.segment_count, 4);
        assert_eq!(md.segment_length, 3);
        let ranges: Vec<(u64, u64)> = md.segments.iter().map(|s| (s.offset, s.length)).collect();
        assert_eq!(ranges, vec![(0, 3), (3, 3), (6, 3), (9, 1)]);
        assert_eq!(
            md.segments[2].path,
            format!("/lake/data.csv.segments.{}/data.csv.2.segment", md.upload_id)
        );
        md.validate_consistency().unwrap();
    }

    #[test]
    fn empty_file_has_one_empty_segment() {
        let (_dir, params) = input(b"");
        let md = UploadMetadata::new("/tmp/unused.json", &params).unwrap();
        assert_eq!(md.segment_count, 1);
        assert_eq!(md.segments[0].length, 0);
        md.validate_consistency().unwrap();
    }

    #[test]
    fn inconsistencies_are_detected() {
        let (_dir, params) = input(&[b'x'; 10]);
        let good = UploadMetadata::new("/tmp/unused.json", &params.with_max_segment_length(5)).unwrap();

        let mut gap = good.clone();
        gap.segments[1].offset = 6;
        assert!(matches!(gap.validate_consistency(), Err(UploadError::InvalidMetadata(_))));

        let mut dup = good.clone();
        let first_path = dup.segments[0].path.clone();
        dup.segments[1].path = first_path;
        assert!(dup.validate_consistency().is_err());

        let mut short = good.clone();
        short.segments[1].length = 4;
        assert!(short.validate_consistency().is_err());

        let mut count = good;
        count.segment_count = 3;
        assert!(count.validate_consistency().is_err());
    }

    #[test]
    fn save_and_load_preserve_state() {
        let (dir, params) = input(b"a\nb\nc\n");
        let path = canonical_metadata_path(&params);
        assert_eq!(path, dir.path().join("data.csv.upload.json"));

        let mut md = UploadMetadata::new(&path, &params.with_max_segment_length(2)).unwrap();
        md.segments[0].status = SegmentStatus::Complete;
        md.save().unwrap();

        let loaded = UploadMetadata::load_from(&path).unwrap();
        assert_eq!(loaded, md);
        assert_eq!(loaded.uploaded_bytes(), 2);
        assert!(!loaded.is_complete());
        assert!(!dir.path().join(".data.csv.upload.json.tmp").exists());

        loaded.delete_file().unwrap();
        assert!(!path.exists());
        loaded.delete_file().unwrap();
    }

    #[test]
    fn save_refuses_inconsistent_metadata() {
        let (dir, params) = input(&[b'x'; 4]);
        let path = dir.path().join("bad.json");
        let mut md = UploadMetadata::new(&path, &params).unwrap();
        md.file_length = 5;
        assert!(md.save().is_err());
        assert!(!path.exists());
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let (dir, params) = input(b"abc");
        let path = dir.path().join("v.json");
        let md = UploadMetadata::new(&path, &params).unwrap();
        md.save().unwrap();

        let mut raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["formatVersion"] = 99.into();
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();
        assert!(matches!(
            UploadMetadata::load_from(&path),
            Err(UploadError::InvalidMetadata(_))
        ));
    }
}
