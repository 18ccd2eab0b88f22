//! `wareline replay` - re-run the pipeline over an archived run

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Args;
use wareline_core::ArchiveSource;
use wareline_sources::Dataset;

use super::Context;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Archived run directory (contains manifest.json)
    pub archive: PathBuf,

    /// Dataset to load as (default: the schema recorded in the manifest)
    #[arg(short, long)]
    pub dataset: Option<String>,

    /// Load into memory instead of the warehouse
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: ReplayArgs, ctx: &Context) -> Result<ExitCode> {
    let mut source = ArchiveSource::open(&args.archive)
        .with_context(|| format!("Cannot open archive {}", args.archive.display()))?;
    let manifest = source.manifest();

    let name = args.dataset.as_deref().unwrap_or(&manifest.schema);
    let dataset =
        Dataset::from_name(name).with_context(|| format!("Unknown dataset: {name}"))?;
    let schema = dataset.schema();
    if schema.version != manifest.schema_version {
        log::warn!(
            "Archive was written with {} v{}, replaying as v{}",
            manifest.schema,
            manifest.schema_version,
            schema.version
        );
    }
    log::info!(
        "Replaying {} pages from {} ({})",
        manifest.pages.len(),
        args.archive.display(),
        manifest.source
    );

    let pipeline = ctx.config.pipeline_config(false);
    super::execute(ctx, dataset, schema, pipeline, &mut source, args.dry_run)
}
