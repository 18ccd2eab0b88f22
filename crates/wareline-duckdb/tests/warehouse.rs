use serde_json::json;
use wareline_core::{
    CancelToken, Coercion, Cursor, EntityLayout, EntityOutcome, EntitySpec, FieldDefault,
    FieldSpec, FieldType, Page, PipelineConfig, PipelineRunner, RawRecord, RetryPolicy, RunStatus,
    Schema, Sink, Source, SourceError, TransactionScope,
};
use wareline_duckdb::DuckDbSink;

/// Serves its records as a single page.
struct OnePage(Vec<RawRecord>);

impl Source for OnePage {
    fn name(&self) -> &str {
        "one-page"
    }

    fn fetch_page(&mut self, cursor: Option<&Cursor>) -> Result<Page, SourceError> {
        Ok(match cursor {
            None => Page {
                records: self.0.clone(),
                next: None,
            },
            Some(_) => Page::default(),
        })
    }
}

fn schema() -> Schema {
    Schema::new("tracks", 1)
        .field(FieldSpec::required("track_id", "id", FieldType::String))
        .field(FieldSpec::required("track_name", "name", FieldType::String))
        .field(FieldSpec::optional("artist_id", "artist.id", FieldType::String))
        .field(FieldSpec::optional("artist_name", "artist.name", FieldType::String))
        .field(FieldSpec::optional("popularity", "popularity", FieldType::Integer))
        .field(
            FieldSpec::optional("duration_sec", "duration_ms", FieldType::Float)
                .with_coercion(Coercion::Divide(1000.0)),
        )
        .field(
            FieldSpec::required("extracted_at", "extracted_at", FieldType::Timestamp)
                .with_default(FieldDefault::RunStarted),
        )
}

fn layout() -> EntityLayout {
    EntityLayout::new()
        .entity(
            EntitySpec::dimension("artists")
                .key(&["artist_id"])
                .column("artist_name"),
        )
        .entity(
            EntitySpec::fact("tracks")
                .key(&["track_id"])
                .column("track_name")
                .column("artist_id")
                .column("popularity")
                .column("duration_sec")
                .column("extracted_at")
                .references(&["artist_id"], "artists"),
        )
}

fn records() -> OnePage {
    let raw = [
        json!({"id": "t1", "name": "One", "artist": {"id": "a1", "name": "Band"}, "popularity": 40, "duration_ms": 200000}),
        json!({"id": "t2", "name": "Two", "artist": {"id": "a1", "name": "Band"}, "popularity": 55, "duration_ms": 181500}),
        json!({"id": "t3", "artist": {"id": "a2", "name": "Other"}}),
    ];
    OnePage(
        raw.into_iter()
            .map(|v| match v {
                serde_json::Value::Object(m) => m,
                _ => unreachable!(),
            })
            .collect(),
    )
}

fn runner(scope: TransactionScope) -> PipelineRunner {
    let config = PipelineConfig {
        retry: RetryPolicy::no_delay(1),
        transaction_scope: scope,
        batch_size: 1,
        ..PipelineConfig::default()
    };
    PipelineRunner::new(config, schema(), &layout()).unwrap()
}

#[test]
fn rerun_leaves_warehouse_unchanged() {
    let mut sink = DuckDbSink::open_in_memory().unwrap();
    let runner = runner(TransactionScope::EntitySet);

    let first = runner.run(&mut records(), &mut sink, &CancelToken::new());
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.counts.rejected, 1);
    assert_eq!(first.entity("tracks").unwrap().inserted, 2);
    assert_eq!(first.entity("artists").unwrap().inserted, 1);

    let second = runner.run(&mut records(), &mut sink, &CancelToken::new());
    assert_eq!(second.status, RunStatus::Success);
    let tracks = second.entity("tracks").unwrap();
    assert_eq!((tracks.inserted, tracks.already_present), (0, 2));
    let artists = second.entity("artists").unwrap();
    assert_eq!((artists.inserted, artists.already_present), (0, 1));

    assert_eq!(sink.row_count("tracks").unwrap(), 2);
    assert_eq!(sink.row_count("artists").unwrap(), 1);
}

#[test]
fn values_are_stored_typed() {
    let mut sink = DuckDbSink::open_in_memory().unwrap();
    runner(TransactionScope::Batch).run(&mut records(), &mut sink, &CancelToken::new());

    let (popularity, duration): (i64, f64) = sink
        .connection()
        .query_row(
            "SELECT popularity, duration_sec FROM tracks WHERE track_id = 't2'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(popularity, 55);
    assert_eq!(duration, 181.5);

    let missing_ts: i64 = sink
        .connection()
        .query_row(
            "SELECT count(*) FROM tracks WHERE extracted_at IS NULL",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(missing_ts, 0);
}

#[test]
fn drifted_table_fails_entity_and_skips_dependents() {
    let mut sink = DuckDbSink::open_in_memory().unwrap();
    sink.connection()
        .execute_batch("CREATE TABLE artists (artist_id VARCHAR PRIMARY KEY, followers BIGINT)")
        .unwrap();

    let run = runner(TransactionScope::EntitySet).run(&mut records(), &mut sink, &CancelToken::new());
    assert_eq!(run.status, RunStatus::Partial);
    assert!(run.error.as_deref().unwrap().contains("drifted"));
    assert!(matches!(
        run.entity("artists").unwrap().outcome,
        EntityOutcome::Failed { .. }
    ));
    assert!(matches!(
        run.entity("tracks").unwrap().outcome,
        EntityOutcome::Skipped { .. }
    ));
}

#[test]
fn rollback_discards_batch() {
    let schema = schema();
    let bound = layout().bind(&schema).unwrap();
    let artists = bound.entity("artists").unwrap();
    let out = wareline_core::split_records(
        &bound,
        &wareline_core::RecordNormalizer::new(std::sync::Arc::new(schema.clone()), chrono::Utc::now())
            .normalize_page(0, &records().0)
            .records,
    );
    let rows = out.sets.get("artists").unwrap().rows();

    let mut sink = DuckDbSink::open_in_memory().unwrap();
    sink.begin(artists).unwrap();
    assert_eq!(sink.upsert_batch(artists, rows).unwrap(), 1);
    sink.rollback(artists).unwrap();
    assert_eq!(sink.row_count("artists").unwrap(), 0);

    sink.begin(artists).unwrap();
    assert_eq!(sink.upsert_batch(artists, rows).unwrap(), 1);
    assert_eq!(sink.upsert_batch(artists, rows).unwrap(), 0);
    sink.commit(artists).unwrap();
    assert_eq!(sink.row_count("artists").unwrap(), 1);
}

#[test]
fn warehouse_file_persists_between_runs() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("warehouse.duckdb");

    {
        let mut sink = DuckDbSink::open(&path).unwrap();
        let schema = schema();
        sink.ensure_tables(&layout().bind(&schema).unwrap()).unwrap();
        runner(TransactionScope::EntitySet).run(&mut records(), &mut sink, &CancelToken::new());
    }

    let mut sink = DuckDbSink::open(&path).unwrap();
    let run = runner(TransactionScope::EntitySet).run(&mut records(), &mut sink, &CancelToken::new());
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.inserted(), 0);
    assert_eq!(sink.row_count("tracks").unwrap(), 2);
}
