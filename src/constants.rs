// src/constants.rs

//! Reserved keys, file names and evaluation limits.

/// The name of the per-user directory holding pbox configuration (inside the system config dir).
pub const PBOX_DIR: &str = "pbox";

/// The name of the settings file (inside the pbox configuration directory).
pub const SETTINGS_FILENAME: &str = "config.toml";

/// The name of the per-directory (and per-file) defaults node.
pub const DEFAULTS_KEY: &str = "defaults";

/// File stems recognised as per-directory defaults files.
pub const DEFAULTS_STEM: &str = "defaults";

/// Extensions of configuration files picked up when loading a directory tree.
pub const CONFIG_EXTENSIONS: &[&str] = &["yml", "yaml", "toml"];

/// Default keys that are never allowed when building an item registry.
pub const REGISTRY_FORBIDDEN_DEFAULTS: &[&str] = &["base", "install", "steps", "variants"];

/// Fields that `base` never copies from another family's item.
pub const BASE_EXCLUDED_FIELDS: &[&str] = &["steps", "status"];

/// Sentinel spliced with the parent's list when found in a variant's list field.
pub const FROM_PARENT: &str = "<from-parent>";

/// Name of the template entry inside a `variants` block.
pub const TEMPLATE_KEY: &str = "_template";

/// The universal category every format belongs to.
pub const ALL_FORMATS: &str = "All";

/// Upper bound for distinct random bytes (one per byte value).
pub const MAX_UNIQUE_BYTES: usize = 256;

/// Nesting limit for expressions, protecting the recursive-descent parser.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

/// Upper bound for `range(...)` materialization and string repetition in expressions.
pub const MAX_SEQUENCE_LENGTH: usize = 1 << 20;
