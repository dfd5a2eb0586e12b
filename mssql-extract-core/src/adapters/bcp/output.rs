//! Post-processing of bcp output files.
//!
//! These functions do blocking file I/O and run on the blocking pool.

use crate::error::{ExtractorError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// What a valid bcp output file contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSummary {
    pub row_count: u64,
    /// Fields of the last record, unquoted
    pub last_row: Option<Vec<String>>,
}

/// Checks that every record has `expected_columns` fields.
///
/// The csv reader skips empty lines, but bcp writes one for every row of a
/// single-column export whose value is NULL or empty. Those lines are
/// counted here as records with one empty field.
///
/// # Errors
/// Returns a bulk-copy error naming the 1-based line number and the raw
/// text of the first bad record, followed by bcp's stderr
pub fn validate_output(path: &Path, expected_columns: usize, stderr: &str) -> Result<OutputSummary> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| ExtractorError::csv(format!("open bcp output {}", path.display()), e))?;
    let mut raw = File::open(path)
        .map_err(|e| ExtractorError::io(format!("open {}", path.display()), e))?;

    let mismatch = |line: u64, fields: usize, raw_line: &str| {
        ExtractorError::bulk_copy(format!(
            "line {line} has {fields} fields, expected {expected_columns}: {raw_line}\nbcp stderr: {}",
            stderr.trim()
        ))
    };

    let mut record = csv::ByteRecord::new();
    let mut row_count = 0u64;
    let mut last_row = None;

    loop {
        // position of the reader before the skipped empty lines
        let before = reader.position().clone();
        let more = reader
            .read_byte_record(&mut record)
            .map_err(|e| ExtractorError::csv(format!("read bcp output {}", path.display()), e))?;
        let after = reader.position().byte();

        let blank = leading_empty_lines(&mut raw, path, before.byte(), after)?;
        if blank > 0 {
            if expected_columns != 1 {
                return Err(mismatch(before.line(), 1, ""));
            }
            row_count += blank;
            last_row = Some(vec![String::new()]);
        }
        if !more {
            break;
        }

        if record.len() != expected_columns {
            let raw_line = read_raw_line(path, before.byte() + blank)?;
            return Err(mismatch(before.line() + blank, record.len(), &raw_line));
        }

        row_count += 1;
        last_row = Some(record.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect());
    }

    Ok(OutputSummary {
        row_count,
        last_row,
    })
}

/// Number of `\n` bytes at the start of `from..to`: the empty lines the csv
/// reader skipped before the next record.
fn leading_empty_lines(raw: &mut File, path: &Path, from: u64, to: u64) -> Result<u64> {
    if to <= from {
        return Ok(0);
    }
    raw.seek(SeekFrom::Start(from))
        .map_err(|e| ExtractorError::io(format!("seek in {}", path.display()), e))?;
    let mut count = 0u64;
    for byte in BufReader::new(std::io::Read::by_ref(raw).take(to - from)).bytes() {
        let byte = byte.map_err(|e| ExtractorError::io(format!("read {}", path.display()), e))?;
        if byte != b'\n' {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// Physical line starting at `offset`, without its terminator.
fn read_raw_line(path: &Path, offset: u64) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| ExtractorError::io(format!("open {}", path.display()), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| ExtractorError::io(format!("seek in {}", path.display()), e))?;
    let mut line = Vec::new();
    BufReader::new(file)
        .read_until(b'\n', &mut line)
        .map_err(|e| ExtractorError::io(format!("read {}", path.display()), e))?;
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn is_field_boundary(byte: u8) -> bool {
    matches!(byte, b',' | b'\n' | b'\r')
}

/// Removes NUL bytes that touch a delimiter, a line end or the file edges.
///
/// bcp character mode writes an empty string as a single NUL. NULs inside a
/// value are kept. The file is rewritten in place through a sibling
/// temporary file. Returns the number of bytes removed.
///
/// # Errors
/// Returns an I/O error if the file cannot be read or replaced
pub fn strip_delimiter_nuls(path: &Path) -> Result<u64> {
    let io_error = |action: &str, e: std::io::Error| {
        ExtractorError::io(format!("{action} {}", path.display()), e)
    };

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".nul-strip");
    let temp_path = std::path::PathBuf::from(temp_name);

    let input = BufReader::new(File::open(path).map_err(|e| io_error("open", e))?);
    let mut output =
        BufWriter::new(File::create(&temp_path).map_err(|e| io_error("create temp file for", e))?);

    let mut previous: Option<u8> = None;
    let mut pending_nuls = 0u64;
    let mut removed = 0u64;

    for byte in input.bytes() {
        let byte = byte.map_err(|e| io_error("read", e))?;
        if byte == 0 {
            pending_nuls += 1;
            continue;
        }
        if pending_nuls > 0 {
            let at_boundary = previous.is_none_or(is_field_boundary) || is_field_boundary(byte);
            if at_boundary {
                removed += pending_nuls;
            } else {
                for _ in 0..pending_nuls {
                    output.write_all(&[0]).map_err(|e| io_error("write", e))?;
                }
            }
            pending_nuls = 0;
        }
        output.write_all(&[byte]).map_err(|e| io_error("write", e))?;
        previous = Some(byte);
    }
    // trailing NULs touch the end of the file
    removed += pending_nuls;

    output.flush().map_err(|e| io_error("flush", e))?;
    drop(output);
    std::fs::rename(&temp_path, path).map_err(|e| io_error("replace", e))?;

    if removed > 0 {
        tracing::debug!("Removed {} NUL bytes from {}", removed, path.display());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_valid_output() {
        let file = write_file(b"1,\"a\"\n2,\"b, c\"\n3,\"multi\nline\"\n");
        let summary = validate_output(file.path(), 2, "").unwrap();
        assert_eq!(summary.row_count, 3);
        assert_eq!(
            summary.last_row,
            Some(vec!["3".to_string(), "multi\nline".to_string()])
        );
    }

    #[test]
    fn test_empty_output() {
        let file = write_file(b"");
        let summary = validate_output(file.path(), 3, "").unwrap();
        assert_eq!(summary.row_count, 0);
        assert_eq!(summary.last_row, None);
    }

    #[test]
    fn test_mismatched_row_reports_line_and_stderr() {
        let file = write_file(b"1,\"a\"\n2,\"b\",extra\n3,\"c\"\n");
        let err = validate_output(file.path(), 2, "Warning: truncation\n").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("line 2 "), "{message}");
        assert!(message.contains("2,\"b\",extra"), "{message}");
        assert!(message.contains("Warning: truncation"), "{message}");
    }

    #[test]
    fn test_single_column_empty_lines_are_rows() {
        let file = write_file(b"1\n\n3\n\n");
        let summary = validate_output(file.path(), 1, "").unwrap();
        assert_eq!(summary.row_count, 4);
        assert_eq!(summary.last_row, Some(vec![String::new()]));

        let file = write_file(b"\n\n7\n");
        let summary = validate_output(file.path(), 1, "").unwrap();
        assert_eq!(summary.row_count, 3);
        assert_eq!(summary.last_row, Some(vec!["7".to_string()]));
    }

    #[test]
    fn test_empty_line_in_multi_column_output_is_reported() {
        let file = write_file(b"1,\"a\"\n\n3,\"c\"\n");
        let message = validate_output(file.path(), 2, "").unwrap_err().to_string();
        assert!(message.contains("line 2 has 1 fields, expected 2"), "{message}");
    }

    #[test]
    fn test_strip_nuls_at_boundaries() {
        let file = write_file(b"\0,a\0b,\0\n1,\0\0,x\0");
        let removed = strip_delimiter_nuls(file.path()).unwrap();
        assert_eq!(removed, 5);
        assert_eq!(std::fs::read(file.path()).unwrap(), b",a\0b,\n1,,x");
    }

    #[test]
    fn test_strip_nuls_without_nuls_is_identity() {
        let content = b"1,\"plain\"\n2,\"text\"\n";
        let file = write_file(content);
        assert_eq!(strip_delimiter_nuls(file.path()).unwrap(), 0);
        assert_eq!(std::fs::read(file.path()).unwrap(), content);
    }
}
