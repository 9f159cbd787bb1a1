// src/cli/handlers/mod.rs

//! One handler per action; each parses its own arguments.

use crate::{core::registry::Catalog, core::settings::Settings, models::Family};
use anyhow::Result;

pub mod export;
pub mod list;
pub mod run;
pub mod select;
pub mod show;

/// What every action handler receives.
#[derive(Debug)]
pub struct HandlerContext<'a> {
    /// Family given on the command line.
    pub family: Family,
    /// Registries, built on first use.
    pub catalog: &'a mut Catalog,
    /// User settings.
    pub settings: &'a Settings,
}

/// Signature shared by every action handler.
pub type Handler = fn(Vec<String>, &mut HandlerContext<'_>) -> Result<()>;
