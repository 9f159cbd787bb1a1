// src/cli/mod.rs

//! Command-line surface of the `pbox` binary.

use clap::Parser;

pub mod handlers;

/// pbox: query the item registries (packers, detectors, modifiers, ...).
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
/// Command line: `pbox <family> [action] [args...]`.
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// Item family (analyzers, detectors, modifiers, packers, unpackers).
    pub family: String,

    /// Action: list, show, select or export. Defaults to `list`.
    pub action: Option<String>,

    /// Arguments of the action.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
