// src/cli/handlers/select.rs

//! `pbox <family> select`: filtered entries as a new configuration file.

use super::HandlerContext;
use anyhow::{Context, Result};
use clap::Parser;
use std::{fs, path::PathBuf};

#[derive(Parser, Debug, Default)]
#[command(
    no_binary_name = true,
    about = "Selects items with a query and prints (or writes) them as configuration."
)]
struct SelectArgs {
    /// Filter over item fields, e.g. "status == 'ok'".
    #[arg(long, short)]
    query: Option<String>,

    /// Executable format, format group or `All`.
    #[arg(long, short, default_value = "All")]
    format: String,

    /// Write to this file instead of printing.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

/// Writes the selected entries as a new configuration file.
pub fn handle(args: Vec<String>, ctx: &mut HandlerContext<'_>) -> Result<()> {
    let select_args = SelectArgs::try_parse_from(&args)?;
    let family = ctx.family;
    let registry = ctx
        .catalog
        .registry(family)
        .with_context(|| format!("Failed to build the {} registry", family))?;

    if let Some(output) = &select_args.output
        && dunce::canonicalize(output).ok().as_deref() == Some(registry.source())
    {
        log::warn!("Destination is identical to source ; aborting...");
        return Ok(());
    }

    let selection = registry.select(&select_args.format, select_args.query.as_deref(), &[])?;
    if selection.is_empty() {
        return Ok(());
    }
    let yaml = selection.to_yaml()?;
    match &select_args.output {
        Some(output) => fs::write(output, yaml).with_context(|| format!("Failed to write '{}'", output.display()))?,
        None => println!("{}", yaml.trim_end()),
    }
    Ok(())
}
