//! `wareline run` - extract from a source and load

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Args, ValueEnum};
use wareline_core::Source;
use wareline_sources::{CatalogSource, Dataset, FeedSource, StatsSource};

use super::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Music catalog playlist tracks
    Catalog,
    /// Development indicators per country
    Stats,
    /// Local NDJSON measurement feed
    Feed,
}

impl SourceKind {
    pub fn dataset(self) -> Dataset {
        match self {
            Self::Catalog => Dataset::Tracks,
            Self::Stats => Dataset::Indicators,
            Self::Feed => Dataset::Measurements,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub source: SourceKind,

    /// Feed file (NDJSON, optionally .gz); required for `feed`
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Load into memory instead of the warehouse
    #[arg(long)]
    pub dry_run: bool,

    /// Also write normalized records here as NDJSON
    #[arg(long)]
    pub canonical_out: Option<PathBuf>,

    /// Skip archiving raw pages
    #[arg(long)]
    pub no_archive: bool,
}

pub fn run(args: RunArgs, ctx: &Context) -> Result<ExitCode> {
    let config = &ctx.config;
    let dataset = args.source.dataset();

    // Feed input is already on disk; only network pages are archived
    let archive = !args.no_archive && args.source != SourceKind::Feed;
    let mut pipeline = config.pipeline_config(archive);
    pipeline.canonical_out = args.canonical_out;

    let mut source: Box<dyn Source> = match args.source {
        SourceKind::Catalog => Box::new(CatalogSource::new(config.catalog.clone())?),
        SourceKind::Stats => Box::new(StatsSource::new(config.stats.clone())?),
        SourceKind::Feed => {
            let input = args
                .input
                .context("`wareline run feed` requires --input <FILE>")?;
            Box::new(FeedSource::open(&input, config.feed.page_size)?)
        }
    };

    log::info!("Running {} → {dataset}", source.name());
    super::execute(
        ctx,
        dataset,
        dataset.schema(),
        pipeline,
        source.as_mut(),
        args.dry_run,
    )
}
