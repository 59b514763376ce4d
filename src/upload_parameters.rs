//! Parameters of a Data Lake Store file upload.

use std::path::PathBuf;

use crate::{
    env_config,
    record_boundary::{MAX_DELIMITER_BYTES, TextEncoding},
    upload_error::UploadError,
};

/// Default upper bound of a segment (256 MiB).
pub const DEFAULT_MAX_SEGMENT_LENGTH: u64 = 256 * 1024 * 1024;

/// Default number of concurrent segment uploads.
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// What to upload, where, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadParameters {
    /// Local file to upload.
    /// Env: `ADLS_INPUT_FILE` (required)
    pub input_file_path: PathBuf,

    /// Absolute path of the target stream in the store.
    /// Env: `ADLS_TARGET_STREAM` (required)
    pub target_stream_path: String,

    /// Data Lake Store account.
    /// Env: `ADLS_ACCOUNT_NAME` (required)
    pub account_name: String,

    /// Maximum concurrent segment uploads.
    /// Env: `ADLS_THREAD_COUNT` (default: 4)
    pub thread_count: usize,

    /// Replace an existing target.
    /// Env: `ADLS_OVERWRITE` (default: false)
    pub is_overwrite: bool,

    /// Continue a previous upload from its metadata file.
    /// Env: `ADLS_RESUME` (default: false)
    pub is_resume: bool,

    /// Treat the file as opaque bytes (no record alignment).
    /// Env: `ADLS_IS_BINARY` (default: false)
    pub is_binary: bool,

    /// Upper bound of a segment, in bytes.
    /// Env: `ADLS_MAX_SEGMENT_LENGTH` (default: 268435456)
    pub max_segment_length: u64,

    /// Directory holding the upload metadata file.
    /// Env: `ADLS_METADATA_DIR` (default: system temp dir)
    pub local_metadata_location: PathBuf,

    /// Record delimiter; `None` means CR, LF or CRLF.
    /// Env: `ADLS_DELIMITER` (`\n`, `\r`, `\t` escapes accepted)
    pub delimiter: Option<String>,

    /// Encoding of the file, used to encode the delimiter.
    /// Env: `ADLS_ENCODING` (default: utf-8)
    pub encoding: TextEncoding,
}

impl UploadParameters {
    /// Parameters with default settings.
    pub fn new(
        input_file_path: impl Into<PathBuf>,
        target_stream_path: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            input_file_path: input_file_path.into(),
            target_stream_path: target_stream_path.into(),
            account_name: account_name.into(),
            thread_count: DEFAULT_THREAD_COUNT,
            is_overwrite: false,
            is_resume: false,
            is_binary: false,
            max_segment_length: DEFAULT_MAX_SEGMENT_LENGTH,
            local_metadata_location: std::env::temp_dir(),
            delimiter: None,
            encoding: TextEncoding::Utf8,
        }
    }

    /// Load parameters from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or values are invalid.
    pub fn from_env() -> Result<Self, UploadError> {
        env_config::load_dotenv();

        let mut params = Self::new(
            env_config::must_env("ADLS_INPUT_FILE")?,
            env_config::must_env("ADLS_TARGET_STREAM")?,
            env_config::must_env("ADLS_ACCOUNT_NAME")?,
        );
        params.thread_count = env_config::parse_usize_env("ADLS_THREAD_COUNT", DEFAULT_THREAD_COUNT)?;
        params.is_overwrite = env_config::parse_bool_env("ADLS_OVERWRITE", false)?;
        params.is_resume = env_config::parse_bool_env("ADLS_RESUME", false)?;
        params.is_binary = env_config::parse_bool_env("ADLS_IS_BINARY", false)?;
        params.max_segment_length =
            env_config::parse_u64_env("ADLS_MAX_SEGMENT_LENGTH", DEFAULT_MAX_SEGMENT_LENGTH)?;
        if let Some(dir) = env_config::optional_env("ADLS_METADATA_DIR") {
            params.local_metadata_location = PathBuf::from(dir);
        }
        // Whitespace delimiters are legitimate, so no trimming here.
        params.delimiter = std::env::var("ADLS_DELIMITER")
            .ok()
            .filter(|d| !d.is_empty())
            .map(|d| unescape_delimiter(&d));
        params.encoding = env_config::string_env("ADLS_ENCODING", "utf-8").parse()?;

        Ok(params)
    }

    /// Set the number of concurrent segment uploads.
    #[must_use]
    pub const fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Allow replacing an existing target.
    #[must_use]
    pub const fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.is_overwrite = overwrite;
        self
    }

    /// Resume from existing metadata.
    #[must_use]
    pub const fn with_resume(mut self, resume: bool) -> Self {
        self.is_resume = resume;
        self
    }

    /// Upload as binary (no record alignment).
    #[must_use]
    pub const fn with_binary(mut self, binary: bool) -> Self {
        self.is_binary = binary;
        self
    }

    /// Set the maximum segment length.
    #[must_use]
    pub const fn with_max_segment_length(mut self, length: u64) -> Self {
        self.max_segment_length = length;
        self
    }

    /// Set the directory for the metadata file.
    #[must_use]
    pub fn with_metadata_location(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_metadata_location = dir.into();
        self
    }

    /// Set the record delimiter.
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into()).filter(|d| !d.is_empty());
        self
    }

    /// Set the file encoding.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Check that the parameters describe a feasible upload.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::InvalidParameters` describing the first problem found.
    pub fn validate(&self) -> Result<(), UploadError> {
        let invalid = |msg: String| Err(UploadError::InvalidParameters(msg));

        if !self.input_file_path.is_file() {
            return invalid(format!(
                "input file '{}' does not exist or is not a file",
                self.input_file_path.display()
            ));
        }
        if self.target_stream_path.trim().is_empty() {
            return invalid("target stream path is empty".into());
        }
        if !self.target_stream_path.starts_with('/') {
            return invalid(format!(
                "target stream path '{}' must be absolute",
                self.target_stream_path
            ));
        }
        if self.account_name.trim().is_empty() {
            return invalid("account name is empty".into());
        }
        if self.thread_count == 0 {
            return invalid("thread count must be at least 1".into());
        }
        if self.max_segment_length == 0 {
            return invalid("max segment length must be at least 1".into());
        }
        if let Some(d) = &self.delimiter {
            let encoded = self.encoding.encode(d).len();
            if encoded == 0 || encoded > MAX_DELIMITER_BYTES {
                return invalid(format!(
                    "delimiter must be 1 to {MAX_DELIMITER_BYTES} bytes once encoded, got {encoded}"
                ));
            }
        }
        Ok(())
    }
}

fn unescape_delimiter(raw: &str) -> String {
    raw.replace("\\r", "\r").replace("\\n", "\n").replace("\\t", "\t")
}
