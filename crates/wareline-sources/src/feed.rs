//! Local NDJSON feed source (plain or `.gz`)
//!
//! The cursor is the number of physical lines already consumed, so a page
//! can be re-read after a failure or resumed from an archived cursor.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use wareline_core::ndjson::{open_reader, parse_line};
use wareline_core::{Cursor, Page, RawRecord, Source, SourceError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub page_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { page_size: 500 }
    }
}

pub struct FeedSource {
    path: PathBuf,
    name: String,
    page_size: usize,
    reader: Box<dyn BufRead + Send>,
    /// Lines consumed from `reader`
    offset: usize,
}

impl FeedSource {
    pub fn open(path: &Path, page_size: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(page_size > 0, "feed page size must be positive");
        let reader =
            open_reader(path).with_context(|| format!("Cannot open feed {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            name: format!("feed:{}", path.display()),
            page_size,
            reader,
            offset: 0,
        })
    }

    /// Reopen and skip to `offset`; used when the requested cursor is not
    /// where the reader stopped.
    fn seek(&mut self, offset: usize) -> Result<(), SourceError> {
        self.reader = open_reader(&self.path)?;
        self.offset = 0;
        let mut line = String::new();
        while self.offset < offset {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                break;
            }
            self.offset += 1;
        }
        Ok(())
    }
}

impl Source for FeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        let start = match cursor {
            Some(c) => c.as_str().parse().map_err(|_| SourceError::Decode {
                message: format!("malformed feed cursor {c:?}"),
            })?,
            None => 0,
        };
        if start != self.offset {
            self.seek(start)?;
        }

        let mut records = Vec::with_capacity(self.page_size);
        let mut line = String::new();
        while records.len() < self.page_size {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(Page {
                    records,
                    next: None,
                });
            }
            self.offset += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            records.push(unwrap_feature(parse_line(trimmed, self.offset)?));
        }
        Ok(Page {
            records,
            next: Some(Cursor::new(self.offset.to_string())),
        })
    }
}

/// Some producers wrap each record as `{fetched_at, feature: {...}}`; lift
/// the feature to the top level and carry `fetched_at` along.
fn unwrap_feature(mut record: RawRecord) -> RawRecord {
    match record.remove("feature") {
        Some(serde_json::Value::Object(mut feature)) => {
            if let Some(fetched_at) = record.remove("fetched_at") {
                feature.entry("fetched_at").or_insert(fetched_at);
            }
            feature
        }
        Some(other) => {
            record.insert("feature".into(), other);
            record
        }
        None => record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_feed(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    fn ids(page: &Page) -> Vec<String> {
        page.records
            .iter()
            .map(|r| r["measurement_id"].as_str().unwrap().to_string())
            .collect()
    }

    const LINES: [&str; 5] = [
        r#"{"measurement_id": "m1", "location": "Cairo - Maadi"}"#,
        r#"{"measurement_id": "m2", "location": "Cairo - Maadi"}"#,
        "",
        r#"{"measurement_id": "m3", "location": "Cairo - Heliopolis"}"#,
        r#"{"measurement_id": "m4", "location": "Cairo - Nasr City"}"#,
    ];

    #[test]
    fn pages_by_line_offset() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_feed(dir.path(), "feed.ndjson", &LINES);
        let mut source = FeedSource::open(&path, 2).unwrap();

        let first = source.fetch_page(None).unwrap();
        assert_eq!(ids(&first), ["m1", "m2"]);
        assert_eq!(first.next.as_ref().unwrap().as_str(), "2");

        let second = source.fetch_page(first.next.as_ref()).unwrap();
        assert_eq!(ids(&second), ["m3", "m4"]);
        assert_eq!(second.next.as_ref().unwrap().as_str(), "5");

        let last = source.fetch_page(second.next.as_ref()).unwrap();
        assert!(last.records.is_empty());
        assert!(last.next.is_none());
    }

    #[test]
    fn refetch_of_earlier_cursor_rereads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_feed(dir.path(), "feed.ndjson", &LINES);
        let mut source = FeedSource::open(&path, 2).unwrap();

        let first = source.fetch_page(None).unwrap();
        source.fetch_page(first.next.as_ref()).unwrap();
        let again = source.fetch_page(first.next.as_ref()).unwrap();
        assert_eq!(ids(&again), ["m3", "m4"]);
    }

    #[test]
    fn reads_gzip_feed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("feed.ndjson.gz");
        let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        for line in LINES {
            writeln!(enc, "{line}").unwrap();
        }
        enc.finish().unwrap();

        let mut source = FeedSource::open(&path, 10).unwrap();
        let page = source.fetch_page(None).unwrap();
        assert_eq!(ids(&page), ["m1", "m2", "m3", "m4"]);
        assert!(page.next.is_none());
    }

    #[test]
    fn wrapped_feature_is_lifted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_feed(
            dir.path(),
            "wrapped.ndjson",
            &[r#"{"fetched_at": "2024-05-01T00:00:00Z", "feature": {"measurement_id": "m9"}}"#],
        );
        let mut source = FeedSource::open(&path, 10).unwrap();
        let page = source.fetch_page(None).unwrap();
        assert_eq!(page.records[0]["measurement_id"], "m9");
        assert_eq!(page.records[0]["fetched_at"], "2024-05-01T00:00:00Z");
    }

    #[test]
    fn bad_line_reports_line_number() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_feed(dir.path(), "bad.ndjson", &[LINES[0], "{oops"]);
        let mut source = FeedSource::open(&path, 10).unwrap();
        let err = source.fetch_page(None).unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn missing_file_is_error() {
        assert!(FeedSource::open(Path::new("/nonexistent/feed.ndjson"), 10).is_err());
    }
}
