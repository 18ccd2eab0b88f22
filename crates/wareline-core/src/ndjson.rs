//! Newline-delimited JSON: the persisted intermediate format
//!
//! One JSON object per line, UTF-8. Used for archived raw pages, canonical
//! output and as load input. Files ending in `.gz` are read through gzip.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::SourceError;
use crate::normalize::{CanonicalRecord, RawRecord};

/// Parse one NDJSON line into a raw record. `line_no` is 1-based.
pub fn parse_line(line: &str, line_no: usize) -> Result<RawRecord, SourceError> {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(SourceError::Decode {
            message: format!("line {line_no}: expected object, found {other}"),
        }),
        Err(e) => Err(SourceError::Decode {
            message: format!("line {line_no}: {e}"),
        }),
    }
}

/// Buffered line reader; transparently decompresses `.gz` files.
pub fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read every record of an NDJSON file, skipping blank lines.
pub fn read_records(path: &Path) -> Result<Vec<RawRecord>, SourceError> {
    let reader = open_reader(path)?;
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(parse_line(&line, i + 1)?);
    }
    Ok(records)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `lines` to `path` atomically (tmp → rename) and return the bytes written.
fn write_atomic(
    path: &Path,
    lines: impl Iterator<Item = serde_json::Value>,
) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for value in lines {
        serde_json::to_writer(&mut buf, &value).map_err(io::Error::other)?;
        buf.push(b'\n');
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(&buf)?;
        w.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(buf)
}

/// Write raw records as NDJSON. Returns the written bytes (for hashing).
pub fn write_raw(path: &Path, records: &[RawRecord]) -> io::Result<Vec<u8>> {
    write_atomic(
        path,
        records.iter().map(|r| serde_json::Value::Object(r.clone())),
    )
}

/// Write canonical records as NDJSON with schema field names.
pub fn write_canonical(path: &Path, records: &[CanonicalRecord]) -> io::Result<()> {
    write_atomic(path, records.iter().map(CanonicalRecord::to_json)).map(|_| ())
}

/// Remove stale `.tmp` files left behind by an interrupted write.
pub fn cleanup_tmp_files(dir: &Path) -> io::Result<()> {
    let pattern = dir.join("*.tmp");
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    for path in entries.filter_map(Result::ok) {
        log::warn!("Removing stale tmp file: {}", path.display());
        fs::remove_file(&path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    #[test]
    fn parse_line_rejects_non_objects() {
        assert!(parse_line(r#"{"a": 1}"#, 1).is_ok());
        let err = parse_line("[1, 2]", 7).unwrap_err();
        assert!(err.to_string().contains("line 7"));
        assert!(matches!(parse_line("{oops", 2), Err(SourceError::Decode { .. })));
    }

    #[test]
    fn canonical_written_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/tracks.ndjson");
        let mut rec = CanonicalRecord::default();
        rec.insert("track_id", Value::String("t1".into()));
        rec.insert("duration_sec", Value::Float(1.5));
        write_canonical(&path, &[rec]).unwrap();

        assert!(!dir.path().join("out/tracks.ndjson.tmp").exists());
        let back = read_records(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0]["track_id"], "t1");
        assert_eq!(back[0]["duration_sec"], 1.5);
    }

    #[test]
    fn reads_gzip_and_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feed.ndjson.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        enc.finish().unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["a"], 2);
    }

    #[test]
    fn cleanup_tmp_files_removes_only_tmp() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"stale").unwrap();
        std::fs::write(dir.path().join("b.ndjson"), b"keep").unwrap();

        cleanup_tmp_files(dir.path()).unwrap();

        assert!(!dir.path().join("a.tmp").exists());
        assert!(dir.path().join("b.ndjson").exists());
    }
}
