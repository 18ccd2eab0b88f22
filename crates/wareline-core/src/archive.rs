//! Raw page archive: makes extraction replayable without the source
//!
//! Layout of one archived run:
//!
//! ```text
//! <root>/<run_id>/
//!   page_00000.ndjson
//!   page_00001.ndjson
//!   manifest.json
//! ```
//!
//! The manifest is rewritten after every page, so an interrupted run still
//! leaves a consistent (shorter) archive behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::fetch::{Cursor, FetchedPage, Page, Source};
use crate::ndjson;
use crate::schema::Schema;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedPage {
    pub file: String,
    pub cursor: Option<Cursor>,
    pub next: Option<Cursor>,
    pub records: usize,
    /// Blake3 hash of the page file (hex)
    pub blake3: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub source: String,
    pub schema: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub pages: Vec<ArchivedPage>,
}

impl ArchiveManifest {
    pub fn read_from(dir: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(dir.join(MANIFEST))?;
        serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write_to(&self, dir: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = dir.join(format!("{MANIFEST}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, dir.join(MANIFEST))
    }

    /// Combined hash over all page hashes, in page order.
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for page in &self.pages {
            hasher.update(page.blake3.as_bytes());
        }
        hasher.finalize()
    }
}

/// Writer for one run's archive directory.
#[derive(Debug)]
pub struct PageArchive {
    dir: PathBuf,
    manifest: ArchiveManifest,
}

impl PageArchive {
    pub fn create(root: &Path, run_id: &str, source: &str, schema: &Schema) -> io::Result<Self> {
        let dir = root.join(run_id);
        fs::create_dir_all(&dir)?;
        ndjson::cleanup_tmp_files(&dir)?;
        let manifest = ArchiveManifest {
            source: source.to_string(),
            schema: schema.name.clone(),
            schema_version: schema.version,
            created_at: Utc::now(),
            pages: Vec::new(),
        };
        manifest.write_to(&dir)?;
        log::info!("Archiving raw pages to {}", dir.display());
        Ok(Self { dir, manifest })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }

    pub fn write_page(&mut self, page: &FetchedPage) -> io::Result<()> {
        let file = format!("page_{:05}.ndjson", page.index);
        let bytes = ndjson::write_raw(&self.dir.join(&file), &page.records)?;
        self.manifest.pages.push(ArchivedPage {
            file,
            cursor: page.cursor.clone(),
            next: page.next.clone(),
            records: page.records.len(),
            blake3: blake3::hash(&bytes).to_hex().to_string(),
        });
        self.manifest.write_to(&self.dir)
    }
}

/// Replays an archived run page by page, verifying page hashes.
///
/// The cursor is the index of the next archived page.
#[derive(Debug)]
pub struct ArchiveSource {
    dir: PathBuf,
    name: String,
    manifest: ArchiveManifest,
}

impl ArchiveSource {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let manifest = ArchiveManifest::read_from(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name: format!("archive:{}", manifest.source),
            manifest,
        })
    }

    pub fn manifest(&self) -> &ArchiveManifest {
        &self.manifest
    }
}

impl Source for ArchiveSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        let index = match cursor {
            None => 0,
            Some(c) => c.as_str().parse::<usize>().map_err(|_| SourceError::Decode {
                message: format!("invalid archive cursor '{c}'"),
            })?,
        };
        let Some(entry) = self.manifest.pages.get(index) else {
            return Ok(Page::default());
        };

        let path = self.dir.join(&entry.file);
        let bytes = fs::read(&path)?;
        let actual = blake3::hash(&bytes).to_hex().to_string();
        if actual != entry.blake3 {
            return Err(SourceError::Decode {
                message: format!(
                    "{}: hash mismatch (manifest {}, file {actual})",
                    entry.file, entry.blake3
                ),
            });
        }

        let text = String::from_utf8(bytes).map_err(|e| SourceError::Decode {
            message: format!("{}: {e}", entry.file),
        })?;
        let records = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| ndjson::parse_line(line, i + 1))
            .collect::<Result<Vec<_>, _>>()?;

        let next =
            (index + 1 < self.manifest.pages.len()).then(|| Cursor::new((index + 1).to_string()));
        Ok(Page { records, next })
    }
}
