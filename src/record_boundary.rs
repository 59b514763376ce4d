//! Record delimiter search around segment boundaries.
//!
//! Text uploads must not split a record across two segments. A boundary candidate
//! (the end of a segment) is moved to the closest record terminator found in a
//! window centered on it, half of the window before and half after.
//!
//! Terminators are either a configured delimiter or, by default, CR, LF and CRLF.
//! Every search result is the index of the **last byte** of the terminator, so a
//! segment ending at `index + 1` ends right after a complete record.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{upload_error::UploadError, upload_metadata::UploadSegmentMetadata};

/// Longest accepted delimiter, in encoded bytes.
pub const MAX_DELIMITER_BYTES: usize = 10;

/// Text encoding used to turn delimiters into byte patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    /// UTF-8.
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    /// 7-bit ASCII; other characters encode as `?`.
    #[serde(rename = "us-ascii")]
    Ascii,
    /// UTF-16, little endian.
    #[serde(rename = "utf-16le")]
    Utf16Le,
    /// UTF-16, big endian.
    #[serde(rename = "utf-16be")]
    Utf16Be,
    /// UTF-32, little endian.
    #[serde(rename = "utf-32le")]
    Utf32Le,
    /// UTF-32, big endian.
    #[serde(rename = "utf-32be")]
    Utf32Be,
}

impl TextEncoding {
    /// Canonical encoding name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Ascii => "us-ascii",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
            Self::Utf32Le => "utf-32le",
            Self::Utf32Be => "utf-32be",
        }
    }

    /// Encode `text` to bytes, without byte order mark.
    #[must_use]
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Ascii => text
                .chars()
                .map(|c| u8::try_from(c).ok().filter(u8::is_ascii).unwrap_or(b'?'))
                .collect(),
            Self::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Self::Utf16Be => text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            Self::Utf32Le => text.chars().flat_map(|c| u32::from(c).to_le_bytes()).collect(),
            Self::Utf32Be => text.chars().flat_map(|c| u32::from(c).to_be_bytes()).collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextEncoding {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "ascii" | "us-ascii" => Ok(Self::Ascii),
            "utf-16" | "utf-16le" | "utf16le" | "unicode" => Ok(Self::Utf16Le),
            "utf-16be" | "utf16be" => Ok(Self::Utf16Be),
            "utf-32" | "utf-32le" | "utf32le" => Ok(Self::Utf32Le),
            "utf-32be" | "utf32be" => Ok(Self::Utf32Be),
            other => Err(UploadError::InvalidParameters(format!(
                "unsupported text encoding '{other}'"
            ))),
        }
    }
}

/// Byte patterns that end a record.
struct Terminators {
    delimiter: Option<Vec<u8>>,
    cr: Vec<u8>,
    lf: Vec<u8>,
}

impl Terminators {
    fn new(encoding: TextEncoding, delimiter: Option<&str>) -> Self {
        Self {
            delimiter: delimiter.filter(|d| !d.is_empty()).map(|d| encoding.encode(d)),
            cr: encoding.encode("\r"),
            lf: encoding.encode("\n"),
        }
    }

    /// Terminator starting at `i`, as the index of its last byte.
    fn starting_at(&self, buffer: &[u8], i: usize) -> Option<usize> {
        let rest = &buffer[i..];
        if let Some(d) = &self.delimiter {
            return rest.starts_with(d).then(|| i + d.len() - 1);
        }
        if rest.starts_with(&self.lf) {
            return Some(i + self.lf.len() - 1);
        }
        if rest.starts_with(&self.cr) {
            let after_cr = i + self.cr.len();
            if buffer[after_cr..].starts_with(&self.lf) {
                return Some(after_cr + self.lf.len() - 1);
            }
            return Some(after_cr - 1);
        }
        None
    }

    /// Whether a terminator ends exactly at `i`. The CR of a CRLF pair does not
    /// end a record.
    fn ending_at(&self, buffer: &[u8], i: usize) -> bool {
        let head = &buffer[..=i];
        if let Some(d) = &self.delimiter {
            return head.ends_with(d);
        }
        head.ends_with(&self.lf) || (head.ends_with(&self.cr) && !buffer[i + 1..].starts_with(&self.lf))
    }

    fn is_lone_cr_at(&self, buffer: &[u8], i: usize) -> bool {
        self.delimiter.is_none() && buffer[..=i].ends_with(&self.cr)
    }
}

/// Find the first record terminator in `buffer`.
///
/// Scans `len` positions forward from `start`, or backward from `start` when
/// `reverse` is set, and returns the index of the terminator's last byte. A CRLF
/// pair resolves to its LF. An empty `delimiter` means the default terminators.
#[must_use]
pub fn find_newline(
    buffer: &[u8],
    start: usize,
    len: usize,
    reverse: bool,
    encoding: TextEncoding,
    delimiter: Option<&str>,
) -> Option<usize> {
    if buffer.is_empty() || len == 0 {
        return None;
    }
    let terminators = Terminators::new(encoding, delimiter);

    if reverse {
        let hi = start.min(buffer.len() - 1);
        let lo = (start + 1).saturating_sub(len);
        (lo..=hi).rev().find(|&i| terminators.ending_at(buffer, i))
    } else {
        let end = start.saturating_add(len).min(buffer.len());
        (start..end).find_map(|i| terminators.starting_at(buffer, i))
    }
}

/// Last byte of the last complete record terminator in `block`, a chunk whose
/// data continues past its end.
///
/// A CR on the final byte is not taken, since its LF may open the next chunk.
#[must_use]
pub fn find_last_record_end(block: &[u8], encoding: TextEncoding, delimiter: Option<&str>) -> Option<usize> {
    let last = block.len().checked_sub(1)?;
    let cut = find_newline(block, last, block.len(), true, encoding, delimiter)?;

    let terminators = Terminators::new(encoding, delimiter);
    if cut == last && terminators.is_lone_cr_at(block, cut) {
        let before_cr = block.len().checked_sub(terminators.cr.len() + 1)?;
        return find_newline(block, before_cr, before_cr + 1, true, encoding, delimiter);
    }
    Some(cut)
}

/// Pick the candidate closest to `center`. Missing candidates are ignored and a
/// tie goes to `after`.
#[must_use]
pub fn find_closest_to_center(before: Option<usize>, after: Option<usize>, center: usize) -> Option<usize> {
    match (before, after) {
        (Some(b), Some(a)) if a.abs_diff(center) > b.abs_diff(center) => Some(b),
        (_, Some(a)) => Some(a),
        (b, None) => b,
    }
}

/// File offset at which a window of `window_len` bytes centered on `reference_offset` starts.
#[must_use]
pub fn window_start(reference_offset: u64, window_len: usize) -> u64 {
    reference_offset.saturating_sub((window_len / 2) as u64)
}

/// Fill `buffer` with the bytes around `reference_offset`: up to half the buffer
/// before it, the rest starting at it. The window is clamped to the file, so the
/// returned count can be smaller than the buffer.
///
/// # Errors
///
/// Returns any I/O error from seeking or reading.
pub fn read_around<R: Read + Seek>(reader: &mut R, buffer: &mut [u8], reference_offset: u64) -> io::Result<usize> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let half = buffer.len() / 2;
    let start = window_start(reference_offset, buffer.len());
    let end = reference_offset
        .saturating_add((buffer.len() - half) as u64)
        .min(file_len);
    if end <= start {
        return Ok(0);
    }

    let length = usize::try_from(end - start).map_or(buffer.len(), |l| l.min(buffer.len()));
    reader.seek(SeekFrom::Start(start))?;
    reader.read_exact(&mut buffer[..length])?;
    Ok(length)
}

fn signed_offset(from: usize, to: usize) -> i64 {
    let magnitude = i64::try_from(to.abs_diff(from)).unwrap_or(i64::MAX);
    if to >= from { magnitude } else { -magnitude }
}

/// How far the end of `segment` must move to land on the last byte of the closest
/// record terminator. Negative values move it back.
///
/// The backward search never crosses the segment's first byte, so the adjusted
/// segment keeps at least one byte.
///
/// # Errors
///
/// Returns `UploadError::NoRecordBoundary` when the window holds no terminator,
/// or an I/O error from reading the file.
pub fn determine_length_adjustment<R: Read + Seek>(
    segment: &UploadSegmentMetadata,
    reader: &mut R,
    max_append_length: usize,
    encoding: TextEncoding,
    delimiter: Option<&str>,
) -> Result<i64, UploadError> {
    let reference = segment.offset + segment.length;
    let mut buffer = vec![0u8; max_append_length];
    let bytes_read = read_around(reader, &mut buffer, reference)?;
    let data = &buffer[..bytes_read];

    if !data.is_empty() {
        let start = window_start(reference, max_append_length);
        let center = usize::try_from(reference - start).unwrap_or(usize::MAX);
        let floor = usize::try_from(segment.offset.saturating_sub(start)).unwrap_or(0);

        let before = (center >= floor)
            .then(|| find_newline(data, center + 1, center + 2 - floor, true, encoding, delimiter))
            .flatten();

        let mut after = find_newline(
            data,
            center,
            data.len().saturating_sub(center),
            false,
            encoding,
            delimiter,
        );
        // A window cut short by the end of the file holds the file's last byte.
        let reaches_eof = data.len() < center + (max_append_length - max_append_length / 2);
        let terminators = Terminators::new(encoding, delimiter);
        if let Some(a) = after
            && a == data.len() - 1
            && !reaches_eof
            && before.is_some()
            && terminators.is_lone_cr_at(data, a)
        {
            // The LF of this CR may lie past the window.
            after = None;
        }

        if let Some(closest) = find_closest_to_center(before, after, center) {
            return Ok(signed_offset(center, closest));
        }
    }

    Err(UploadError::NoRecordBoundary {
        window_mb: max_append_length / 1024 / 1024 / 2,
        segment_number: segment.segment_number,
        offset: segment.offset,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::upload_metadata::SegmentStatus;

    fn segment(offset: u64, length: u64) -> UploadSegmentMetadata {
        UploadSegmentMetadata {
            segment_number: 0,
            offset,
            length,
            status: SegmentStatus::Pending,
            path: "/t.segments/x.0.segment".into(),
        }
    }

    fn fwd(buf: &[u8], start: usize, delimiter: Option<&str>) -> Option<usize> {
        find_newline(buf, start, buf.len(), false, TextEncoding::Utf8, delimiter)
    }

    fn rev(buf: &[u8], start: usize, delimiter: Option<&str>) -> Option<usize> {
        find_newline(buf, start, start + 1, true, TextEncoding::Utf8, delimiter)
    }

    #[test]
    fn forward_search_finds_lf_cr_and_crlf() {
        assert_eq!(fwd(b"abc\ndef", 0, None), Some(3));
        assert_eq!(fwd(b"abc\rdef", 0, None), Some(3));
        assert_eq!(fwd(b"abc\r\ndef", 0, None), Some(4));
        assert_eq!(fwd(b"abcdef", 0, None), None);
        assert_eq!(fwd(b"a\nbc\nd", 2, None), Some(4));
    }

    #[test]
    fn reverse_search_skips_cr_of_a_crlf_pair() {
        assert_eq!(rev(b"ab\ncd\ref", 7, None), Some(5));
        assert_eq!(rev(b"ab\ncd\r\nef", 5, None), Some(2));
        assert_eq!(rev(b"ab\ncd\r\nef", 6, None), Some(6));
        assert_eq!(rev(b"abcdef", 5, None), None);
    }

    #[test]
    fn custom_delimiter_reports_its_last_byte() {
        assert_eq!(fwd(b"a||b||c", 0, Some("||")), Some(2));
        assert_eq!(rev(b"a||b||c", 6, Some("||")), Some(5));
        assert_eq!(fwd(b"a\nb", 0, Some("||")), None);
        assert_eq!(fwd(b"a\nb", 0, Some("")), Some(1));
    }

    #[test]
    fn search_respects_len() {
        assert_eq!(find_newline(b"abc\nd", 0, 3, false, TextEncoding::Utf8, None), None);
        assert_eq!(find_newline(b"a\nbcd", 4, 2, true, TextEncoding::Utf8, None), None);
        assert_eq!(find_newline(b"", 0, 5, false, TextEncoding::Utf8, None), None);
    }

    #[test]
    fn utf16_terminators_are_two_bytes() {
        let buf = TextEncoding::Utf16Le.encode("ab\r\ncd");
        assert_eq!(
            find_newline(&buf, 0, buf.len(), false, TextEncoding::Utf16Le, None),
            Some(7)
        );
        let be = TextEncoding::Utf16Be.encode("x;y");
        assert_eq!(
            find_newline(&be, 0, be.len(), false, TextEncoding::Utf16Be, Some(";")),
            Some(3)
        );
    }

    #[test]
    fn encodings_parse_and_encode() {
        assert_eq!("UTF-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("unicode".parse::<TextEncoding>().unwrap(), TextEncoding::Utf16Le);
        assert!("ebcdic".parse::<TextEncoding>().is_err());
        assert_eq!(TextEncoding::Ascii.encode("é\n"), b"?\n".to_vec());
        assert_eq!(TextEncoding::Utf32Be.encode("\n"), vec![0, 0, 0, 10]);
    }

    #[test]
    fn last_record_end_skips_a_trailing_cr() {
        let end = |b: &[u8], d| find_last_record_end(b, TextEncoding::Utf8, d);
        assert_eq!(end(b"a\r\nbbbb\r", None), Some(2));
        assert_eq!(end(b"ab\ncd\r\n", None), Some(6));
        assert_eq!(end(b"ab\rcd", None), Some(2));
        assert_eq!(end(b"abcdef\r", None), None);
        assert_eq!(end(b"a;bc\r", Some(";")), Some(1));
        assert_eq!(end(b"", None), None);

        let wide = TextEncoding::Utf16Le.encode("a\nbc\r");
        assert_eq!(find_last_record_end(&wide, TextEncoding::Utf16Le, None), Some(3));
    }

    #[test]
    fn closest_candidate_wins_and_ties_go_after() {
        assert_eq!(find_closest_to_center(Some(8), Some(13), 10), Some(8));
        assert_eq!(find_closest_to_center(Some(5), Some(12), 10), Some(12));
        assert_eq!(find_closest_to_center(Some(8), Some(12), 10), Some(12));
        assert_eq!(find_closest_to_center(None, Some(12), 10), Some(12));
        assert_eq!(find_closest_to_center(Some(3), None, 10), Some(3));
        assert_eq!(find_closest_to_center(None, None, 10), None);
    }

    #[test]
    fn read_around_is_clamped_to_the_file() {
        let mut file = Cursor::new(b"0123456789".to_vec());
        let mut buf = [0u8; 6];

        assert_eq!(read_around(&mut file, &mut buf, 5).unwrap(), 6);
        assert_eq!(&buf, b"234567");

        assert_eq!(read_around(&mut file, &mut buf, 1).unwrap(), 4);
        assert_eq!(&buf[..4], b"0123");

        assert_eq!(read_around(&mut file, &mut buf, 9).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");

        assert_eq!(read_around(&mut file, &mut buf, 20).unwrap(), 0);
    }

    #[test]
    fn adjustment_moves_to_the_nearest_newline() {
        let mut file = Cursor::new(b"aaaa\nbbbb\ncccc\n".to_vec());
        let adj = determine_length_adjustment(&segment(0, 7), &mut file, 8, TextEncoding::Utf8, None).unwrap();
        assert_eq!(adj, 2);

        let adj = determine_length_adjustment(&segment(0, 6), &mut file, 8, TextEncoding::Utf8, None).unwrap();
        assert_eq!(adj, -2);
    }

    #[test]
    fn adjustment_near_file_start_uses_the_true_center() {
        let mut file = Cursor::new(b"ab\ncdefghijklmnop".to_vec());
        let adj = determine_length_adjustment(&segment(0, 2), &mut file, 16, TextEncoding::Utf8, None).unwrap();
        assert_eq!(adj, 0);
    }

    #[test]
    fn backward_search_stays_inside_the_segment() {
        let mut file = Cursor::new(b"a\nbcdefgh\nij".to_vec());
        let seg = segment(2, 3);
        let adj = determine_length_adjustment(&seg, &mut file, 12, TextEncoding::Utf8, None).unwrap();
        assert_eq!(adj, 4);
    }

    #[test]
    fn missing_boundary_is_reported() {
        let mut file = Cursor::new(b"abcdefghij".to_vec());
        let err = determine_length_adjustment(&segment(0, 5), &mut file, 4, TextEncoding::Utf8, None).unwrap_err();
        assert!(matches!(
            err,
            UploadError::NoRecordBoundary { segment_number: 0, offset: 0, .. }
        ));
        assert!(err.to_string().starts_with("Unable to locate a record boundary"));
    }

    #[test]
    fn cr_closing_the_window_loses_to_an_earlier_newline() {
        // Window is bytes 2..10; its last byte is the CR of a CRLF at 9..11.
        let mut file = Cursor::new(b"abc\ndefgh\r\ni".to_vec());
        let adj = determine_length_adjustment(&segment(0, 6), &mut file, 8, TextEncoding::Utf8, None).unwrap();
        assert_eq!(adj, -3);
    }

    #[test]
    fn cr_ending_the_file_is_a_record_end() {
        let mut file = Cursor::new(b"abc\ndefg\r".to_vec());
        let adj = determine_length_adjustment(&segment(0, 6), &mut file, 8, TextEncoding::Utf8, None).unwrap();
        assert_eq!(adj, 2);
    }
}
