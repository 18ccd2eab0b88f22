//! Pipeline orchestration: extract → normalize → split → load for one run
//!
//! Extraction runs to completion before anything is written, so a source
//! failure on page N never leaves pages 0..N half-loaded. Every run ends
//! with a [`PipelineRun`] record, whatever the outcome.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::PageArchive;
use crate::cancel::CancelToken;
use crate::error::{IntegrityError, PipelineError, Stage};
use crate::fetch::{Cursor, PageFetcher, Source};
use crate::graph::DependencyGraph;
use crate::layout::{BoundLayout, EntityKind, EntityLayout};
use crate::load::{BatchLoader, EntityLoad, TransactionScope, DEFAULT_BATCH_SIZE};
use crate::ndjson;
use crate::normalize::{CanonicalRecord, RecordNormalizer, ValidationError};
use crate::progress::{fmt_num, ProgressContext, SharedProgress};
use crate::retry::RetryPolicy;
use crate::schema::Schema;
use crate::sink::Sink;
use crate::split::EntitySplitter;

/// Rejections kept verbatim in the run record; the rest are only counted.
pub const REJECTION_SAMPLE: usize = 100;

/// Per-run settings, fixed at runner construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub transaction_scope: TransactionScope,
    /// Extra load-order edges: entity → entities it must load after
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub start_cursor: Option<Cursor>,
    pub archive_dir: Option<PathBuf>,
    pub audit_dir: Option<PathBuf>,
    pub canonical_out: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            transaction_scope: TransactionScope::default(),
            dependencies: BTreeMap::new(),
            start_cursor: None,
            archive_dir: None,
            audit_dir: None,
            canonical_out: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    /// A load-stage failure: some entity sets may be loaded, others not
    Partial,
    /// Aborted before load; nothing from this run was written
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub pages: usize,
    pub extracted: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub duplicate_facts: usize,
    pub duplicate_dimensions: usize,
    pub flagged_facts: usize,
}

/// Audit record of one pipeline execution.
#[derive(Debug, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub source: String,
    pub schema: String,
    pub schema_version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: StageCounts,
    pub entities: Vec<EntityLoad>,
    /// First rejections, up to [`REJECTION_SAMPLE`]
    pub rejections: Vec<ValidationError>,
    pub error: Option<String>,
    #[serde(skip)]
    pub cause: Option<PipelineError>,
}

impl PipelineRun {
    fn new(source: &str, schema: &Schema, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id(source, started_at),
            source: source.to_string(),
            schema: schema.name.clone(),
            schema_version: schema.version,
            started_at,
            finished_at: None,
            status: RunStatus::Failed,
            counts: StageCounts::default(),
            entities: Vec::new(),
            rejections: Vec::new(),
            error: None,
            cause: None,
        }
    }

    fn finish(&mut self, result: Result<(), PipelineError>) {
        self.finished_at = Some(Utc::now());
        match result {
            Ok(()) => self.status = RunStatus::Success,
            Err(e) => {
                self.status = if e.is_load_failure() {
                    RunStatus::Partial
                } else {
                    RunStatus::Failed
                };
                self.error = Some(e.to_string());
                self.cause = Some(e);
            }
        }
    }

    fn reject(&mut self, rejections: Vec<ValidationError>) {
        for r in rejections {
            self.counts.rejected += 1;
            if self.rejections.len() < REJECTION_SAMPLE {
                log::warn!("Rejected {r}");
                self.rejections.push(r);
            } else {
                log::debug!("Rejected {r}");
            }
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityLoad> {
        self.entities.iter().find(|e| e.entity == name)
    }

    /// Rows newly inserted across all entity sets.
    pub fn inserted(&self) -> usize {
        self.entities.iter().map(|e| e.inserted).sum()
    }

    pub fn loaded(&self, kind: EntityKind) -> usize {
        self.entities
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.inserted)
            .sum()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause.as_ref().is_some_and(PipelineError::is_cancelled)
    }

    /// Write this record as `<dir>/<run_id>.json`.
    pub fn write_audit(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// `<source>-<UTC timestamp>`, with the source reduced to file-name-safe characters.
fn run_id(source: &str, at: DateTime<Utc>) -> String {
    let safe: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{safe}-{}", at.format("%Y%m%dT%H%M%S%3fZ"))
}

pub struct PipelineRunner {
    config: PipelineConfig,
    schema: Arc<Schema>,
    layout: BoundLayout,
    graph: DependencyGraph,
    progress: SharedProgress,
}

impl PipelineRunner {
    /// Validate the schema, bind the layout and check the load order.
    pub fn new(
        config: PipelineConfig,
        schema: Schema,
        layout: &EntityLayout,
    ) -> Result<Self, IntegrityError> {
        schema.validate()?;
        let bound = layout.bind(&schema)?;
        let graph = DependencyGraph::from_layout(&bound, &config.dependencies)?;
        let order = graph.load_order()?;
        log::debug!("Load order for {}: {}", schema.name, order.join(" → "));
        Ok(Self {
            config,
            schema: Arc::new(schema),
            layout: bound,
            graph,
            progress: Arc::new(ProgressContext::hidden()),
        })
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn layout(&self) -> &BoundLayout {
        &self.layout
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run. Never panics on pipeline failures; the outcome is in
    /// the returned record's `status`.
    pub fn run(
        &self,
        source: &mut dyn Source,
        sink: &mut dyn Sink,
        cancel: &CancelToken,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(source.name(), &self.schema, Utc::now());
        log::info!(
            "Run {}: {} → {} v{}",
            run.run_id,
            run.source,
            self.schema.name,
            self.schema.version
        );

        let result = self.execute(&mut run, source, sink, cancel);
        run.finish(result);

        match &run.error {
            None => log::info!(
                "Run {} succeeded: {} new rows",
                run.run_id,
                fmt_num(run.inserted())
            ),
            Some(e) => log::error!("Run {} {}: {e}", run.run_id, run.status.as_str()),
        }

        if let Some(dir) = &self.config.audit_dir {
            match run.write_audit(dir) {
                Ok(path) => log::info!("Audit record written to {}", path.display()),
                Err(e) => log::error!("Failed to write audit record: {e}"),
            }
        }
        run
    }

    fn execute(
        &self,
        run: &mut PipelineRun,
        source: &mut dyn Source,
        sink: &mut dyn Sink,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        let (records, indices) = self.extract(run, source, cancel)?;

        if let Some(path) = &self.config.canonical_out {
            ndjson::write_canonical(path, &records).map_err(PipelineError::Io)?;
            log::info!(
                "Wrote {} canonical records to {}",
                fmt_num(records.len()),
                path.display()
            );
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Stage::Split });
        }

        let pb = self.progress.stage_line("split");
        let mut splitter = EntitySplitter::new(&self.layout);
        for (record, &index) in records.iter().zip(&indices) {
            splitter.push(index, record);
        }
        let split = splitter.finish();
        run.counts.duplicate_facts = split.stats.duplicate_facts;
        run.counts.duplicate_dimensions = split.stats.duplicate_dimensions;
        run.counts.flagged_facts = split.stats.flagged_facts;
        run.reject(split.rejections);
        if split.stats.flagged_facts > 0 {
            log::warn!(
                "{} facts reference a dimension with a null key; their references were cleared",
                fmt_num(split.stats.flagged_facts)
            );
        }
        split.sets.verify_references(&self.layout)?;
        pb.finish_with_message(format!(
            "{} entity sets, {} duplicate facts dropped",
            self.layout.entities.len(),
            fmt_num(split.stats.duplicate_facts)
        ));

        let pb = self.progress.stage_line("load");
        let on_batch = |entity: &str, rows: usize| {
            pb.inc(rows as u64);
            pb.set_message(format!("{entity}: {} rows written", fmt_num(pb.position() as usize)));
        };
        let report = BatchLoader::new(
            sink,
            self.config.batch_size,
            self.config.transaction_scope,
        )
        .with_cancel(cancel)
        .on_batch(&on_batch)
        .load(&self.layout, &self.graph, &split.sets)?;
        pb.finish_and_clear();

        run.entities = report.entities;
        match report.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetch every page and normalize it. Returns surviving records with
    /// their run-wide indices.
    fn extract(
        &self,
        run: &mut PipelineRun,
        source: &mut dyn Source,
        cancel: &CancelToken,
    ) -> Result<(Vec<CanonicalRecord>, Vec<usize>), PipelineError> {
        let normalizer = RecordNormalizer::new(Arc::clone(&self.schema), run.started_at);
        let mut archive = match &self.config.archive_dir {
            Some(dir) => Some(
                PageArchive::create(dir, &run.run_id, &run.source, &self.schema)
                    .map_err(PipelineError::Io)?,
            ),
            None => None,
        };

        let pb = self.progress.stage_line("extract");
        let mut fetcher =
            PageFetcher::new(source, self.config.retry, self.config.start_cursor.clone())
                .with_cancel(cancel);
        if let Some(archive) = archive.as_mut() {
            fetcher = fetcher.with_archive(archive);
        }

        let mut records = Vec::new();
        let mut indices = Vec::new();
        for page in fetcher {
            let page = page?;
            if page.attempts > 1 {
                log::info!("Page {} fetched after {} attempts", page.index, page.attempts);
            }
            let first = run.counts.extracted;
            run.counts.pages += 1;
            run.counts.extracted += page.records.len();

            let normalized = normalizer.normalize_page(first, &page.records);
            run.counts.normalized += normalized.records.len();
            run.reject(normalized.rejections);
            records.extend(normalized.records);
            indices.extend(normalized.indices);

            pb.set_message(format!(
                "{} pages, {} records",
                run.counts.pages,
                fmt_num(run.counts.extracted)
            ));
        }
        pb.finish_and_clear();

        log::info!(
            "Extracted {} records in {} pages ({} normalized, {} rejected)",
            fmt_num(run.counts.extracted),
            run.counts.pages,
            fmt_num(run.counts.normalized),
            fmt_num(run.counts.rejected)
        );
        Ok((records, indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::fetch::tests::{page, ScriptedSource};
    use crate::layout::EntitySpec;
    use crate::schema::{FieldSpec, FieldType};
    use crate::sink::MemorySink;

    fn runner(config: PipelineConfig) -> PipelineRunner {
        let schema = Schema::new("ids", 1).field(FieldSpec::required("id", "id", FieldType::String));
        let layout = EntityLayout::new().entity(EntitySpec::fact("items").key(&["id"]));
        PipelineRunner::new(config, schema, &layout).unwrap()
    }

    #[test]
    fn run_id_is_file_safe() {
        let at = DateTime::parse_from_rfc3339("2024-02-03T04:05:06.789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(run_id("archive:catalog", at), "archive-catalog-20240203T040506789Z");
    }

    #[test]
    fn success_loads_everything() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a", "b"], Some("2"))),
            Ok(page(&["b", "c"], None)),
        ]);
        let mut sink = MemorySink::new();
        let run = runner(PipelineConfig::default()).run(&mut src, &mut sink, &CancelToken::new());
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.counts.pages, 2);
        assert_eq!(run.counts.extracted, 4);
        assert_eq!(run.counts.duplicate_facts, 1);
        assert_eq!(run.entity("items").unwrap().inserted, 3);
        assert_eq!(sink.row_count("items"), 3);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn permanent_source_error_fails_without_loading() {
        let mut src = ScriptedSource::new(vec![
            Ok(page(&["a"], Some("2"))),
            Err(SourceError::Http {
                status: Some(403),
                message: "forbidden".into(),
            }),
        ]);
        let mut sink = MemorySink::new();
        let run = runner(PipelineConfig::default()).run(&mut src, &mut sink, &CancelToken::new());
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("403"));
        assert_eq!(run.counts.pages, 1);
        assert!(sink.writes().is_empty());
    }

    #[test]
    fn cancelled_before_start() {
        let mut src = ScriptedSource::new(vec![Ok(page(&["a"], None))]);
        let mut sink = MemorySink::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = runner(PipelineConfig::default()).run(&mut src, &mut sink, &cancel);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.is_cancelled());
        assert!(src.requested.is_empty());
    }

    #[test]
    fn audit_and_canonical_outputs_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = PipelineConfig {
            audit_dir: Some(dir.path().join("audit")),
            canonical_out: Some(dir.path().join("canonical.ndjson")),
            archive_dir: Some(dir.path().join("archive")),
            ..PipelineConfig::default()
        };
        let mut src = ScriptedSource::new(vec![Ok(page(&["a", "b"], None))]);
        let mut sink = MemorySink::new();
        let run = runner(config).run(&mut src, &mut sink, &CancelToken::new());
        assert_eq!(run.status, RunStatus::Success);

        let audit = dir.path().join("audit").join(format!("{}.json", run.run_id));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(audit).unwrap()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["counts"]["normalized"], 2);
        assert_eq!(json["entities"][0]["status"], "loaded");

        let canonical = ndjson::read_records(&dir.path().join("canonical.ndjson")).unwrap();
        assert_eq!(canonical.len(), 2);

        let manifest = crate::archive::ArchiveManifest::read_from(
            &dir.path().join("archive").join(&run.run_id),
        )
        .unwrap();
        assert_eq!(manifest.pages.len(), 1);
    }

    #[test]
    fn rejection_sample_is_capped() {
        let raws: Vec<_> = (0..REJECTION_SAMPLE + 20).map(|_| "").collect();
        let mut src = ScriptedSource::new(vec![Ok(page(&raws, None))]);
        let mut sink = MemorySink::new();
        let run = runner(PipelineConfig::default()).run(&mut src, &mut sink, &CancelToken::new());
        assert_eq!(run.counts.rejected, REJECTION_SAMPLE + 20);
        assert_eq!(run.rejections.len(), REJECTION_SAMPLE);
        assert_eq!(run.status, RunStatus::Success);
    }

    #[test]
    fn cyclic_dependencies_rejected_at_construction() {
        let schema = Schema::new("s", 1)
            .field(FieldSpec::required("id", "id", FieldType::String))
            .field(FieldSpec::required("d", "d", FieldType::String));
        let layout = EntityLayout::new()
            .entity(EntitySpec::fact("f").key(&["id"]).column("d").references(&["d"], "dim"))
            .entity(EntitySpec::dimension("dim").key(&["d"]));
        let config = PipelineConfig {
            dependencies: [("dim".to_string(), vec!["f".to_string()])].into(),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            PipelineRunner::new(config, schema, &layout),
            Err(IntegrityError::Cycle { .. })
        ));
    }
}
