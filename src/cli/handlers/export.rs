// src/cli/handlers/export.rs

//! `pbox <family> export`: selected entries to CSV, JSON or YAML.

use super::HandlerContext;
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Exports items as CSV, JSON or YAML records.")]
struct ExportArgs {
    /// Output file, or just `csv`/`json`/`yml` for `<family>s-export.<ext>`.
    #[arg(long, short, default_value = "csv")]
    output: String,

    /// Filter over item fields, e.g. "status == 'ok'".
    #[arg(long, short)]
    query: Option<String>,

    /// Executable format, format group or `All`.
    #[arg(long, short, default_value = "All")]
    format: String,

    /// Fields to export (the name is always exported first).
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,
}

/// Writes the selected entries to a file.
pub fn handle(args: Vec<String>, ctx: &mut HandlerContext<'_>) -> Result<()> {
    let export_args = ExportArgs::try_parse_from(&args)?;
    let family = ctx.family;
    let registry = ctx
        .catalog
        .registry(family)
        .with_context(|| format!("Failed to build the {} registry", family))?;

    let output = match export_args.output.as_str() {
        ext @ ("csv" | "json" | "yml" | "yaml") => PathBuf::from(format!("{}-export.{}", family.config_key(), ext)),
        path => PathBuf::from(shellexpand::tilde(path).into_owned()),
    };
    let selection = registry.select(&export_args.format, export_args.query.as_deref(), &export_args.fields)?;
    selection.export(&output)?;
    println!(
        "{} {} {}s to '{}'",
        "Exported".green(),
        selection.len(),
        family,
        output.display()
    );
    Ok(())
}
