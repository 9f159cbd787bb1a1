// src/cli/handlers/run.rs

//! `pbox <family> run`: dry run of a pipeline on an executable.

use super::HandlerContext;
use crate::{
    core::pipeline::{Pipeline, PipelineOptions},
    models::Target,
    system::binary::MemoryParser,
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Dry-runs the selected items on an executable (in-memory binary, nothing written)."
)]
struct RunArgs {
    /// The executable to run on.
    path: PathBuf,

    /// Executable format of the target (PE32, ELF64, ...).
    #[arg(long, short)]
    format: String,

    /// Items to apply instead of those with `apply: true`.
    #[arg(long, short, value_delimiter = ',')]
    select: Vec<String>,

    /// Drop unknown selected items with a warning.
    #[arg(long)]
    lenient: bool,
}

/// Applies the selected items to an in-memory copy of an executable.
pub fn handle(args: Vec<String>, ctx: &mut HandlerContext<'_>) -> Result<()> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let family = ctx.family;
    let lenient = run_args.lenient || ctx.settings.lenient;
    let registry = ctx
        .catalog
        .registry(family)
        .with_context(|| format!("Failed to build the {} registry", family))?;

    let target = Target::from_path(&run_args.format, &run_args.path)
        .with_context(|| format!("Cannot read '{}'", run_args.path.display()))?;
    let mut options = PipelineOptions::default().lenient(lenient);
    if !run_args.select.is_empty() {
        options = options.select(run_args.select);
    }

    let parser = MemoryParser::default();
    let report = Pipeline::new(registry, &parser).run(Some(&target), &options)?;
    for name in &report.applied {
        println!("  {} {}", "✓".green(), name);
    }
    for (name, cause) in &report.failures {
        println!("  {} {} {}", "✗".red(), name, cause.dimmed());
    }
    println!("{} ({})", target.filename().bold(), report.state);
    Ok(())
}
