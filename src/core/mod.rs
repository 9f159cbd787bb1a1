// src/core/mod.rs

//! Configuration loading, registries, pipelines and queries.

pub mod config_loader;
pub mod formats;
pub mod item;
pub mod modifiers;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod settings;
