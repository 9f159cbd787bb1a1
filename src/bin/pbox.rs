// src/bin/pbox.rs

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use colored::*;
use pbox::{
    cli::{
        Cli,
        handlers::{self, Handler, HandlerContext},
    },
    core::settings::Settings,
    models::Family,
};

// --- Action Definition and Registry ---

/// An action, its aliases, and its handler.
struct ActionDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: Handler,
}

static ACTION_REGISTRY: &[ActionDefinition] = &[
    ActionDefinition {
        name: "export",
        aliases: &[],
        handler: handlers::export::handle,
    },
    ActionDefinition {
        name: "list",
        aliases: &["ls"],
        handler: handlers::list::handle,
    },
    ActionDefinition {
        name: "run",
        aliases: &["test"],
        handler: handlers::run::handle,
    },
    ActionDefinition {
        name: "select",
        aliases: &[],
        handler: handlers::select::handle,
    },
    ActionDefinition {
        name: "show",
        aliases: &["info"],
        handler: handlers::show::handle,
    },
];

fn find_action(name: &str) -> Option<&'static ActionDefinition> {
    ACTION_REGISTRY
        .iter()
        .find(|a| a.name == name || a.aliases.contains(&name))
}

fn main() {
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse()) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let family: Family = cli.family.parse().map_err(|e: String| anyhow!(e))?;
    let settings = Settings::load().context("Failed to load settings")?;
    let mut catalog = settings.catalog()?;

    let action_name = cli.action.unwrap_or_else(|| "list".to_string());
    let action = find_action(&action_name).ok_or_else(|| {
        let known: Vec<&str> = ACTION_REGISTRY.iter().map(|a| a.name).collect();
        anyhow!("Unknown action '{}' (expected one of: {})", action_name, known.join(", "))
    })?;

    let mut ctx = HandlerContext {
        family,
        catalog: &mut catalog,
        settings: &settings,
    };
    (action.handler)(cli.args, &mut ctx)
}
