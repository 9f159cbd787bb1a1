// src/cli/handlers/list.rs

//! `pbox <family> list`: items of a category with their status.

use super::HandlerContext;
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Lists the items available for a format.")]
struct ListArgs {
    /// Executable format, format group or `All`.
    #[arg(default_value = "All")]
    format: String,

    /// Hide variants.
    #[arg(long)]
    no_variants: bool,
}

/// Prints the items of a category.
pub fn handle(args: Vec<String>, ctx: &mut HandlerContext<'_>) -> Result<()> {
    let list_args = ListArgs::try_parse_from(&args)?;
    let family = ctx.family;
    let registry = ctx
        .catalog
        .registry(family)
        .with_context(|| format!("Failed to build the {} registry", family))?;

    let names = registry.names(&list_args.format);
    if names.is_empty() {
        println!("No {} defined for '{}'.", family, list_args.format);
        return Ok(());
    }
    println!("\n--- {}s ({}) ---", family.name().yellow().bold(), list_args.format.cyan());
    for name in names {
        let Some(item) = registry.get(&name) else {
            continue;
        };
        if list_args.no_variants && item.is_variant() {
            continue;
        }
        let status = match item.status.as_deref() {
            Some("ok") => "ok".green(),
            Some(other) => other.red(),
            None => "".normal(),
        };
        let label = if item.is_variant() { name.dimmed() } else { name.normal() };
        println!("  {:<32} {}", label, status);
    }
    Ok(())
}
