// src/cli/handlers/show.rs

//! `pbox <family> show`: help and fields of one item.

use super::HandlerContext;
use crate::models::ConfigValue;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colored::Colorize;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true, about = "Shows the help and the configuration of one item.")]
struct ShowArgs {
    /// Item name (case-insensitive; `_`, `.` and spaces match `-`).
    name: String,
}

/// Prints one item's help and fields.
pub fn handle(args: Vec<String>, ctx: &mut HandlerContext<'_>) -> Result<()> {
    let show_args = ShowArgs::try_parse_from(&args)?;
    let family = ctx.family;
    let registry = ctx
        .catalog
        .registry(family)
        .with_context(|| format!("Failed to build the {} registry", family))?;
    let item = registry
        .get(&show_args.name)
        .ok_or_else(|| anyhow!("No {} named '{}'", family, show_args.name))?;

    println!("\n--- {} '{}' ---", family.name().blue(), item.name.yellow());
    if let Some(parent) = &item.parent {
        println!("  {:<12} {}", "variant of".blue(), parent);
    }
    println!("  {:<12} {}", "result".blue(), item.result);
    println!("  {:<12} {}", "apply".blue(), item.apply);
    if let Some(rounds) = item.loop_count {
        println!("  {:<12} {}", "loop".blue(), rounds);
    }
    let help = item.help();
    if !help.is_empty() {
        println!("\n{}", help);
    }
    let fields = serde_yaml::to_string(&ConfigValue::Map(item.fields.clone()))
        .context("Failed to render the item's fields")?;
    println!("\n{}", fields.trim_end().dimmed());
    Ok(())
}
