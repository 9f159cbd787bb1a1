// src/lib.rs

//! # pbox
//!
//! Declarative item registry and sandboxed rule engine for packing and
//! obfuscation research on executables.
//!
//! Items (packers, detectors, modifiers, ...) are declared in YAML or TOML
//! trees with cascading defaults, built into per-family [`core::registry::Registry`]
//! values, and applied to executables by the [`core::pipeline::Pipeline`]
//! through sandboxed [`expression`]s.

pub mod cli;
pub mod constants;
pub mod core;
pub mod expression;
pub mod models;
pub mod system;
