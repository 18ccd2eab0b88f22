//! `wareline load` - load canonical NDJSON without touching the source

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Args;
use wareline_sources::{Dataset, FeedSource};

use super::Context;

#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Canonical NDJSON file (optionally .gz)
    pub input: PathBuf,

    /// Dataset the records were normalized as
    #[arg(short, long)]
    pub dataset: String,

    /// Load into memory instead of the warehouse
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: LoadArgs, ctx: &Context) -> Result<ExitCode> {
    let dataset = Dataset::from_name(&args.dataset)
        .with_context(|| format!("Unknown dataset: {}", args.dataset))?;
    let mut source = FeedSource::open(&args.input, ctx.config.feed.page_size)?;

    log::info!("Loading {} as {dataset}", args.input.display());
    let pipeline = ctx.config.pipeline_config(false);
    super::execute(
        ctx,
        dataset,
        dataset.schema().replay(),
        pipeline,
        &mut source,
        args.dry_run,
    )
}
