pub mod load;
pub mod replay;
pub mod run;

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use wareline_core::{
    fmt_num, CancelToken, EntityOutcome, MemorySink, PipelineConfig, PipelineRun, PipelineRunner,
    RunStatus, Schema, SharedProgress, Sink, Source,
};
use wareline_duckdb::DuckDbSink;
use wareline_sources::Dataset;

use crate::config::Config;

/// Everything a subcommand needs besides its own arguments.
pub struct Context {
    pub config: Config,
    pub progress: SharedProgress,
    pub cancel: CancelToken,
}

/// Run one pipeline into the warehouse (or a memory sink for dry runs),
/// print the summary and map the outcome to an exit code.
pub fn execute(
    ctx: &Context,
    dataset: Dataset,
    schema: Schema,
    pipeline: PipelineConfig,
    source: &mut dyn Source,
    dry_run: bool,
) -> Result<ExitCode> {
    let runner = PipelineRunner::new(pipeline, schema, &dataset.layout())
        .with_context(|| format!("Invalid pipeline definition for {dataset}"))?
        .with_progress(ctx.progress.clone());

    let mut sink: Box<dyn Sink> = if dry_run {
        log::info!("Dry run: loading into memory");
        Box::new(MemorySink::new())
    } else {
        let path = &ctx.config.warehouse.path;
        let mut db = DuckDbSink::open(path)?;
        // Drift is reported per entity by the run itself
        if let Err(e) = db.ensure_tables(runner.layout()) {
            log::warn!("Warehouse {}: {e}", path.display());
        }
        Box::new(db)
    };

    let run = runner.run(source, sink.as_mut(), &ctx.cancel);
    print_run_summary(&run);
    Ok(ExitCode::from(exit_status(run.status, run.is_cancelled())))
}

/// 0 success, 2 partial, 1 failed, 130 cancelled.
pub fn exit_status(status: RunStatus, cancelled: bool) -> u8 {
    if cancelled {
        return 130;
    }
    match status {
        RunStatus::Success => 0,
        RunStatus::Partial => 2,
        RunStatus::Failed => 1,
    }
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    table
}

fn outcome_cell(outcome: &EntityOutcome) -> Cell {
    match outcome {
        EntityOutcome::Loaded => Cell::new("loaded").fg(Color::Green),
        EntityOutcome::Failed { error } => Cell::new(format!("failed: {error}")).fg(Color::Red),
        EntityOutcome::Skipped { blocked_by } => {
            Cell::new(format!("skipped ({blocked_by} failed)")).fg(Color::Yellow)
        }
        EntityOutcome::Cancelled => Cell::new("cancelled").fg(Color::Yellow),
    }
}

fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Success => Color::Green,
        RunStatus::Partial => Color::Yellow,
        RunStatus::Failed => Color::Red,
    };
    Cell::new(status.as_str().to_uppercase()).fg(color)
}

/// Print run counts and per-entity load results on stderr
pub fn print_run_summary(run: &PipelineRun) {
    let mut table = new_table(&["Run", "Value"]);
    table.add_row(vec![Cell::new("Run ID"), Cell::new(&run.run_id)]);
    table.add_row(vec![
        Cell::new("Source"),
        Cell::new(format!("{} → {} v{}", run.source, run.schema, run.schema_version)),
    ]);
    table.add_row(vec![Cell::new("Status"), status_cell(run.status)]);
    let c = &run.counts;
    for (label, n) in [
        ("Pages", c.pages),
        ("Extracted", c.extracted),
        ("Normalized", c.normalized),
        ("Rejected", c.rejected),
        ("Duplicate facts", c.duplicate_facts),
        ("Duplicate dimensions", c.duplicate_dimensions),
        ("Facts with missing references", c.flagged_facts),
    ] {
        table.add_row(vec![Cell::new(label), Cell::new(fmt_num(n))]);
    }
    if let Some(error) = &run.error {
        table.add_row(vec![Cell::new("Error"), Cell::new(error).fg(Color::Red)]);
    }
    eprintln!("\n{table}");

    if run.entities.is_empty() {
        return;
    }
    let mut table = new_table(&[
        "Entity", "Kind", "Submitted", "Inserted", "Present", "Batches", "Outcome",
    ]);
    for e in &run.entities {
        table.add_row(vec![
            Cell::new(&e.entity),
            Cell::new(format!("{:?}", e.kind).to_lowercase()),
            Cell::new(fmt_num(e.submitted)),
            Cell::new(fmt_num(e.inserted)),
            Cell::new(fmt_num(e.already_present)),
            Cell::new(e.batches),
            outcome_cell(&e.outcome),
        ]);
    }
    eprintln!("{table}");
}

/// `wareline config`
pub fn print_config(config: &Config) {
    let mut table = new_table(&["Setting", "Value"]);
    let p = &config.pipeline;
    let path_or_off = |path: &std::path::Path| {
        if path.as_os_str().is_empty() {
            "disabled".to_string()
        } else {
            path.display().to_string()
        }
    };

    table.add_row(vec!["Warehouse".to_string(), config.warehouse.path.display().to_string()]);
    table.add_row(vec!["Batch size".to_string(), p.batch_size.to_string()]);
    table.add_row(vec![
        "Retry".to_string(),
        format!(
            "{} attempts, {:?} → {:?}",
            p.retry.max_attempts, p.retry.base_delay, p.retry.max_delay
        ),
    ]);
    table.add_row(vec![
        "Transaction scope".to_string(),
        format!("{:?}", p.transaction_scope),
    ]);
    table.add_row(vec!["Archive dir".to_string(), path_or_off(&p.archive_dir)]);
    table.add_row(vec!["Audit dir".to_string(), path_or_off(&p.audit_dir)]);
    for (entity, deps) in &p.dependencies {
        table.add_row(vec![
            format!("Depends: {entity}"),
            deps.join(", "),
        ]);
    }
    table.add_row(vec!["Catalog API".to_string(), config.catalog.api_url.clone()]);
    table.add_row(vec![
        "Catalog credentials".to_string(),
        if config.catalog.client_id.is_empty() || config.catalog.client_secret.is_empty() {
            "not set".to_string()
        } else {
            "configured".to_string()
        },
    ]);
    table.add_row(vec![
        "Catalog playlist".to_string(),
        config.catalog.playlist_id.clone(),
    ]);
    table.add_row(vec!["Stats API".to_string(), config.stats.base_url.clone()]);
    table.add_row(vec![
        "Stats scope".to_string(),
        format!(
            "{} indicators × {} countries, {}",
            config.stats.indicators.len(),
            config.stats.countries.len(),
            config.stats.date_range
        ),
    ]);
    table.add_row(vec!["Feed page size".to_string(), config.feed.page_size.to_string()]);

    eprintln!("\n{table}");
}
