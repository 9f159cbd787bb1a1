// src/core/settings.rs

//! User settings: where each family's configuration lives.
//!
//! Read from `~/.config/pbox/config.toml`:
//!
//! ```toml
//! lenient = false
//!
//! [sources]
//! packers = "~/pbox/conf/packers.yml"
//! modifiers = "~/pbox/conf/modifiers"
//! ```
//!
//! `PBOX_PACKERS`, `PBOX_MODIFIERS`, ... override the file.

use crate::{
    constants::{PBOX_DIR, SETTINGS_FILENAME},
    core::registry::Catalog,
    models::Family,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Errors raised while locating or reading the settings file.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The platform has no config directory.
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    /// The settings file exists but could not be read.
    #[error("Failed to read settings '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid TOML, or has unknown keys.
    #[error("Failed to parse settings '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// A `[sources]` key names no item family.
    #[error("Unknown item family '{0}' in [sources].")]
    UnknownFamily(String),
}

/// Contents of `config.toml`, after environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Source path per family, keyed by the plural family name.
    pub sources: BTreeMap<String, String>,
    /// Drop unknown selected items instead of failing.
    pub lenient: bool,
}

/// `~/.config/pbox`
pub fn config_dir() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join(PBOX_DIR))
        .ok_or(SettingsError::ConfigDirNotFound)
}

impl Settings {
    /// Reads the user settings (if any), then applies the environment.
    pub fn load() -> Result<Self, SettingsError> {
        let path = config_dir()?.join(SETTINGS_FILENAME);
        let settings = if path.is_file() {
            Self::from_file(&path)?
        } else {
            log::debug!("No settings at '{}', using defaults", path.display());
            Self::default()
        };
        Ok(settings.with_env(|key| std::env::var(key).ok()))
    }

    /// Reads settings from an explicit file.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides sources with `PBOX_<FAMILY>S` variables found through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for family in Family::ALL {
            let key = family.config_key();
            let var = format!("PBOX_{}", key.to_uppercase());
            if let Some(value) = lookup(&var).filter(|v| !v.trim().is_empty()) {
                log::trace!("{} overrides the {} source", var, family);
                self.sources.insert(key, value);
            }
        }
        self
    }

    /// Source configured for a family.
    pub fn source(&self, family: Family) -> Option<&str> {
        self.sources.get(&family.config_key()).map(String::as_str)
    }

    /// A catalog pointing every configured family to its source.
    pub fn catalog(&self) -> Result<Catalog, SettingsError> {
        let mut catalog = Catalog::new();
        for (key, path) in &self.sources {
            let family: Family = key.parse().map_err(|_| SettingsError::UnknownFamily(key.clone()))?;
            catalog.set_source(family, path);
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_from_file_and_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "lenient = true\n[sources]\npackers = \"/a/packers\"\ndetectors = \"/a/detectors\"\n").unwrap();

        let env: HashMap<&str, &str> = [("PBOX_PACKERS", "/b/packers"), ("PBOX_MODIFIERS", "")].into();
        let settings = Settings::from_file(&path)
            .unwrap()
            .with_env(|k| env.get(k).map(|v| v.to_string()));
        assert!(settings.lenient);
        assert_eq!(settings.source(Family::Packer), Some("/b/packers"));
        assert_eq!(settings.source(Family::Detector), Some("/a/detectors"));
        assert_eq!(settings.source(Family::Modifier), None);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SETTINGS_FILENAME);
        fs::write(&path, "verbose = 1\n").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn test_catalog_uses_configured_sources() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("modifiers.yml");
        fs::write(&source, "A:\n  result: '1'\n").unwrap();

        let mut settings = Settings::default();
        settings.sources.insert("modifiers".into(), source.display().to_string());
        let mut catalog = settings.catalog().unwrap();
        assert!(catalog.registry(Family::Modifier).unwrap().get("a").is_some());

        settings.sources.insert("compressors".into(), "/x".into());
        assert!(matches!(settings.catalog(), Err(SettingsError::UnknownFamily(_))));
    }
}
