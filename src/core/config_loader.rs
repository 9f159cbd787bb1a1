// src/core/config_loader.rs

//! # Config Loader
//!
//! This module turns a configuration source (a single YAML/TOML file, or a
//! directory tree of them) into one flattened, insertion-ordered mapping from
//! item name to item parameters.
//!
//! Directory trees cascade their defaults: a `defaults.yml` found in a folder
//! applies to every file of that folder and of its sub-folders, and a
//! `defaults` key inside a file applies on top of it for that file only.
//! Entries coming from different files are deep-merged by name.
use crate::{
    constants::{CONFIG_EXTENSIONS, DEFAULTS_KEY, DEFAULTS_STEM},
    models::{ConfigMap, ConfigValue},
};
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Errors raised while loading configuration or building a registry from it.
/// All of them are fatal for the source being processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A file or folder could not be read.
    #[error("Filesystem Error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The configured source path does not exist.
    #[error("Configuration source '{0}' does not exist.")]
    SourceNotFound(PathBuf),
    /// A YAML file is malformed.
    #[error("Error parsing YAML in '{path}': {source}")]
    YamlParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    /// A TOML file is malformed.
    #[error("Error parsing TOML in '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// A file does not hold a mapping at its top level.
    #[error("'{path}' must contain a mapping at its top level.")]
    NotAMapping { path: PathBuf },
    /// A `defaults` node sets a key that may not be defaulted.
    #[error("Default value for parameter '{key}' is not allowed (in '{path}').")]
    ForbiddenDefault { key: String, path: PathBuf },
    /// A pattern default carries an invalid regular expression.
    #[error("Invalid pattern '{pattern}' for default '{key}' in '{path}': {source}")]
    BadPattern {
        key: String,
        pattern: String,
        path: PathBuf,
        #[source]
        source: regex::Error,
    },
    /// `base` does not name a detector, packer or unpacker.
    #[error("'base' set to '{base}' for '{item}' discarded (bad format).")]
    BadBase { item: String, base: String },
    /// An item uses its own family as `base`.
    #[error("'{item}' cannot use itself as its base.")]
    SelfReference { item: String },
    /// A family was requested before any source was set for it.
    #[error("No source configured for the '{0}' family.")]
    NoSource(String),
    /// The family named by `base` has no source.
    #[error("No source configured for the '{family}' family (needed by 'base' of '{item}').")]
    MissingBaseSource { family: String, item: String },
    /// `result` is empty.
    #[error("'{item}': 'result' shall be defined.")]
    UndefinedResult { item: String },
    /// A known field has the wrong type.
    #[error("'{item}': field '{field}' must be {expected}.")]
    BadField {
        item: String,
        field: String,
        expected: &'static str,
    },
    /// Two entries register the same name for the same category.
    #[error("Item '{name}' is defined more than once for category '{category}'.")]
    DuplicateItem { name: String, category: String },
    /// An item lists a category that is neither a format nor a group.
    #[error("Unknown category '{category}' used by '{item}'.")]
    UnknownCategory { item: String, category: String },
}

type ConfigResult<T> = Result<T, ConfigError>;

/// Tunes how a configuration source is loaded.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Default keys that may not be declared anywhere in the source.
    pub forbidden_defaults: Vec<String>,
    /// When set, values already present in the merged tree are never overwritten.
    pub keep: bool,
    /// When unset, `defaults` nodes are treated as plain entries.
    pub parse_defaults: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            forbidden_defaults: Vec::new(),
            keep: false,
            parse_defaults: true,
        }
    }
}

impl LoadOptions {
    /// Adds keys that no `defaults` node may set.
    pub fn forbid(mut self, keys: &[&str]) -> Self {
        self.forbidden_defaults.extend(keys.iter().map(|k| k.to_string()));
        self
    }

    /// Sets the `keep` merge policy.
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }
}

/// The fully merged configuration: item names mapped to their parameters,
/// in discovery order (earlier entries have priority in later stages).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    entries: ConfigMap,
}

impl ConfigTree {
    /// Parameters of one entry.
    pub fn get(&self, name: &str) -> Option<&ConfigValue> {
        self.entries.get(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry was found.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry names, in discovery order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Entries with their parameters, in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.entries.iter()
    }
}

impl From<ConfigMap> for ConfigTree {
    fn from(entries: ConfigMap) -> Self {
        Self { entries }
    }
}

impl IntoIterator for ConfigTree {
    type Item = (String, ConfigValue);
    type IntoIter = indexmap::map::IntoIter<String, ConfigValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

// --- PUBLIC API ---

/// Loads a configuration source, either a single file or a directory tree.
///
/// Directory rules:
/// 1. A `defaults` file in a folder updates the defaults inherited from the
///    parent folder, key by key.
/// 2. Every other file gets its own `defaults` key merged on top of those,
///    then each of its entries is filled with the missing default keys.
/// 3. Entries are deep-merged into the result by name; sub-folders are
///    visited after the files of their parent, in sorted order.
pub fn load_config(source: &Path, options: &LoadOptions) -> ConfigResult<ConfigTree> {
    if !source.exists() {
        return Err(ConfigError::SourceNotFound(source.to_path_buf()));
    }
    log::debug!("Loading configuration from '{}'", source.display());

    let mut entries = ConfigMap::new();
    if source.is_dir() {
        load_directory(&mut entries, source, &ConfigMap::new(), options)?;
    } else {
        let mut config = read_document(source)?;
        apply_defaults(&mut config, &ConfigMap::new(), options, source)?;
        entries = config;
    }

    log::trace!("{} entries loaded from '{}'", entries.len(), source.display());
    Ok(ConfigTree { entries })
}

/// Deep-merges `value` into `base[key]`.
///
/// Mappings merge recursively, lists take the incoming elements they do not
/// already hold, and anything else is replaced unless `keep` is set and the
/// existing leaf is already set.
pub fn merge_entry(base: &mut ConfigMap, key: String, value: ConfigValue, keep: bool) {
    match base.get_mut(&key) {
        None => {
            base.insert(key, value);
        }
        Some(existing) => merge_value(existing, value, keep),
    }
}

fn merge_value(existing: &mut ConfigValue, incoming: ConfigValue, keep: bool) {
    match (existing, incoming) {
        (ConfigValue::Map(current), ConfigValue::Map(incoming)) => {
            for (k, v) in incoming {
                merge_entry(current, k, v, keep);
            }
        }
        (ConfigValue::List(current), ConfigValue::List(incoming)) => {
            for v in incoming {
                if !current.contains(&v) {
                    current.push(v);
                }
            }
        }
        (ConfigValue::List(current), scalar) => {
            if !current.contains(&scalar) {
                current.push(scalar);
            }
        }
        (slot, incoming) => {
            if !keep || slot.is_null() {
                *slot = incoming;
            }
        }
    }
}

// --- DIRECTORY TRAVERSAL ---

fn load_directory(
    base: &mut ConfigMap,
    folder: &Path,
    inherited: &ConfigMap,
    options: &LoadOptions,
) -> ConfigResult<()> {
    let mut defaults = inherited.clone();
    let (files, folders) = list_folder(folder)?;

    if options.parse_defaults
        && let Some(path) = files.iter().find(|p| is_defaults_file(p))
    {
        let folder_defaults = read_document(path)?;
        check_forbidden(&folder_defaults, options, path)?;
        log::trace!("Folder defaults from '{}': {:?}", path.display(), folder_defaults.keys());
        defaults.extend(folder_defaults);
    }

    for path in files.iter().filter(|p| !options.parse_defaults || !is_defaults_file(p)) {
        log::trace!("Reading configuration file '{}'", path.display());
        let mut config = read_document(path)?;
        apply_defaults(&mut config, &defaults, options, path)?;
        for (key, value) in config {
            merge_entry(base, key, value, options.keep);
        }
    }

    for sub_folder in &folders {
        load_directory(base, sub_folder, &defaults, options)?;
    }
    Ok(())
}

/// Lists configuration files and sub-folders of `folder`, sorted by name.
fn list_folder(folder: &Path) -> ConfigResult<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut folders = Vec::new();
    let walker = walkdir::WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| ConfigError::Io {
            path: folder.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path().to_path_buf();
        if entry.file_type().is_dir() {
            folders.push(path);
        } else if has_config_extension(&path) {
            files.push(path);
        }
    }
    Ok((files, folders))
}

fn has_config_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| CONFIG_EXTENSIONS.contains(&e))
}

fn is_defaults_file(path: &Path) -> bool {
    path.file_stem().and_then(|s| s.to_str()) == Some(DEFAULTS_STEM)
}

/// Reads one YAML or TOML document as a mapping. Empty documents are empty mappings.
fn read_document(path: &Path) -> ConfigResult<ConfigMap> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let value = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let table: toml::Table = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        ConfigValue::from(toml::Value::Table(table))
    } else {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
                path: path.to_path_buf(),
                source: e,
            })?;
        ConfigValue::from(yaml)
    };

    match value {
        ConfigValue::Map(map) => Ok(map),
        ConfigValue::Null => Ok(ConfigMap::new()),
        _ => Err(ConfigError::NotAMapping {
            path: path.to_path_buf(),
        }),
    }
}

// --- DEFAULTS EXPANSION ---

fn check_forbidden(defaults: &ConfigMap, options: &LoadOptions, path: &Path) -> ConfigResult<()> {
    match defaults
        .keys()
        .find(|k| options.forbidden_defaults.iter().any(|f| f == *k))
    {
        Some(key) => Err(ConfigError::ForbiddenDefault {
            key: key.clone(),
            path: path.to_path_buf(),
        }),
        None => Ok(()),
    }
}

/// Fills every entry of `config` with the defaults it does not define itself.
///
/// A default shaped like `{match: [regex, ...], value: v}` only applies to
/// entries whose name matches one of the patterns; when `v` is a boolean,
/// the other entries receive `!v`.
fn apply_defaults(
    config: &mut ConfigMap,
    inherited: &ConfigMap,
    options: &LoadOptions,
    path: &Path,
) -> ConfigResult<()> {
    if !options.parse_defaults {
        return Ok(());
    }
    let mut defaults = inherited.clone();
    if let Some(ConfigValue::Map(local)) = config.shift_remove(DEFAULTS_KEY) {
        defaults.extend(local);
    }
    check_forbidden(&defaults, options, path)?;

    // `name:` with nothing under it is an entry without parameters.
    for params in config.values_mut().filter(|v| v.is_null()) {
        *params = ConfigValue::Map(ConfigMap::new());
    }
    let names: Vec<String> = config.keys().cloned().collect();
    for (key, value) in &defaults {
        match pattern_default(key, value, path)? {
            Some((patterns, v)) => {
                for name in &names {
                    let matched = patterns.iter().any(|re| re.is_match(name));
                    let Some(params) = config.get_mut(name).and_then(ConfigValue::as_map_mut) else {
                        continue;
                    };
                    match v {
                        ConfigValue::Bool(b) => {
                            let assigned = if matched { *b } else { !*b };
                            params.entry(key.clone()).or_insert(ConfigValue::Bool(assigned));
                        }
                        other if matched => {
                            params.entry(key.clone()).or_insert_with(|| other.clone());
                        }
                        _ => {}
                    }
                }
            }
            None => {
                for name in &names {
                    if let Some(params) = config.get_mut(name).and_then(ConfigValue::as_map_mut) {
                        params.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Recognises the `{match, value}` default form (an optional `comment` key is ignored).
fn pattern_default<'v>(
    key: &str,
    value: &'v ConfigValue,
    path: &Path,
) -> ConfigResult<Option<(Vec<Regex>, &'v ConfigValue)>> {
    let Some(map) = value.as_map() else {
        return Ok(None);
    };
    let meaningful: Vec<&String> = map.keys().filter(|k| k.as_str() != "comment").collect();
    if meaningful.len() != 2 || !map.contains_key("match") || !map.contains_key("value") {
        return Ok(None);
    }
    let (Some(patterns), Some(v)) = (map.get("match"), map.get("value")) else {
        return Ok(None);
    };

    let compiled = patterns
        .to_items()
        .iter()
        .map(|p| {
            let pattern = p.to_string();
            Regex::new(&pattern).map_err(|e| ConfigError::BadPattern {
                key: key.to_string(),
                pattern,
                path: path.to_path_buf(),
                source: e,
            })
        })
        .collect::<ConfigResult<Vec<_>>>()?;
    Ok(Some((compiled, v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn field<'a>(tree: &'a ConfigTree, item: &str, key: &str) -> Option<&'a ConfigValue> {
        tree.get(item).and_then(|v| v.as_map()).and_then(|m| m.get(key))
    }

    #[test]
    fn test_single_file_applies_intra_file_defaults() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "items.yml",
            "defaults:\n  apply: false\n  loop: 2\nA:\n  result: x + 1\nB:\n  result: y\n  apply: true\n",
        );
        let tree = load_config(&dir.path().join("items.yml"), &LoadOptions::default()).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.get("defaults").is_none());
        assert_eq!(field(&tree, "A", "apply"), Some(&ConfigValue::Bool(false)));
        assert_eq!(field(&tree, "B", "apply"), Some(&ConfigValue::Bool(true)));
        assert_eq!(field(&tree, "B", "loop"), Some(&ConfigValue::Int(2)));
    }

    #[test]
    fn test_nearest_defaults_win_in_directory_tree() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "defaults.yml", "status: ok\ncomment: root\n");
        write(dir.path(), "a.yml", "top:\n  result: '1'\n");
        write(dir.path(), "sub/defaults.yml", "status: broken\n");
        write(dir.path(), "sub/b.yml", "inner:\n  result: '2'\nown:\n  result: '3'\n  status: custom\n");

        let tree = load_config(dir.path(), &LoadOptions::default()).unwrap();
        let names: Vec<_> = tree.names().cloned().collect();
        assert_eq!(names, vec!["top", "inner", "own"]);
        assert_eq!(field(&tree, "top", "status"), Some(&ConfigValue::from("ok")));
        assert_eq!(field(&tree, "inner", "status"), Some(&ConfigValue::from("broken")));
        assert_eq!(field(&tree, "inner", "comment"), Some(&ConfigValue::from("root")));
        assert_eq!(field(&tree, "own", "status"), Some(&ConfigValue::from("custom")));
    }

    #[test]
    fn test_file_defaults_override_folder_defaults() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "defaults.yml", "apply: true\n");
        write(dir.path(), "a.yml", "defaults:\n  apply: false\nX:\n  result: '0'\n");
        write(dir.path(), "b.yml", "Y:\n  result: '0'\n");
        let tree = load_config(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(field(&tree, "X", "apply"), Some(&ConfigValue::Bool(false)));
        assert_eq!(field(&tree, "Y", "apply"), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn test_boolean_pattern_default_assigns_complement() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "features.yml",
            "defaults:\n  keep:\n    comment: do not keep entropy or boolean features\n    match:\n      - ^entropy\n      - ^is_\n    value: false\n\
             entropy_text:\n  result: '0'\nis_packed:\n  result: '0'\nsize:\n  result: '0'\nforced:\n  result: '0'\n  keep: true\n",
        );
        let tree = load_config(&dir.path().join("features.yml"), &LoadOptions::default()).unwrap();
        assert_eq!(field(&tree, "entropy_text", "keep"), Some(&ConfigValue::Bool(false)));
        assert_eq!(field(&tree, "is_packed", "keep"), Some(&ConfigValue::Bool(false)));
        assert_eq!(field(&tree, "size", "keep"), Some(&ConfigValue::Bool(true)));
        assert_eq!(field(&tree, "forced", "keep"), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn test_non_boolean_pattern_default_only_hits_matches() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "m.yml",
            "defaults:\n  grid:\n    match: ^rename\n    value: [1, 2]\nrename_text:\n  result: '0'\nadd_section:\n  result: '0'\n",
        );
        let tree = load_config(&dir.path().join("m.yml"), &LoadOptions::default()).unwrap();
        assert!(field(&tree, "rename_text", "grid").is_some());
        assert!(field(&tree, "add_section", "grid").is_none());
    }

    #[test]
    fn test_forbidden_default_fails() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "p.yml", "defaults:\n  base: Packer[upx]\nA:\n  result: '0'\n");
        let options = LoadOptions::default().forbid(&["base", "steps"]);
        let err = load_config(&dir.path().join("p.yml"), &options).unwrap_err();
        assert!(matches!(err, ConfigError::ForbiddenDefault { ref key, .. } if key == "base"));
    }

    #[test]
    fn test_entries_from_several_files_deep_merge() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yml", "X:\n  formats: [PE]\n  meta:\n    author: a\n  result: '1'\n");
        write(dir.path(), "b.yml", "X:\n  formats: [ELF, PE]\n  meta:\n    year: 2020\n  result: '2'\n");
        let tree = load_config(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(
            field(&tree, "X", "formats"),
            Some(&ConfigValue::List(vec!["PE".into(), "ELF".into()]))
        );
        let meta = field(&tree, "X", "meta").unwrap().as_map().unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(field(&tree, "X", "result"), Some(&ConfigValue::from("2")));
    }

    #[test]
    fn test_keep_policy_never_overwrites_leaves() {
        let mut base = ConfigMap::new();
        merge_entry(&mut base, "a".into(), ConfigValue::Int(1), true);
        merge_entry(&mut base, "a".into(), ConfigValue::Int(2), true);
        assert_eq!(base.get("a"), Some(&ConfigValue::Int(1)));

        let mut nested = ConfigMap::new();
        nested.insert("k".into(), ConfigValue::from("old"));
        base.insert("m".into(), ConfigValue::Map(nested.clone()));
        nested.insert("k".into(), ConfigValue::from("new"));
        nested.insert("j".into(), ConfigValue::from("added"));
        merge_entry(&mut base, "m".into(), ConfigValue::Map(nested), true);
        let m = base.get("m").unwrap().as_map().unwrap();
        assert_eq!(m.get("k"), Some(&ConfigValue::from("old")));
        assert_eq!(m.get("j"), Some(&ConfigValue::from("added")));
    }

    #[test]
    fn test_toml_sources_are_accepted() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "defaults.toml", "apply = false\n");
        write(dir.path(), "items.toml", "[upx]\nresult = \"x\"\n");
        let tree = load_config(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(field(&tree, "upx", "apply"), Some(&ConfigValue::Bool(false)));
    }

    #[test]
    fn test_missing_source_and_bad_yaml() {
        let dir = TempDir::new().unwrap();
        let missing = load_config(&dir.path().join("nope.yml"), &LoadOptions::default());
        assert!(matches!(missing, Err(ConfigError::SourceNotFound(_))));

        write(dir.path(), "bad.yml", "A: [unclosed\n");
        let bad = load_config(&dir.path().join("bad.yml"), &LoadOptions::default());
        assert!(matches!(bad, Err(ConfigError::YamlParse { .. })));
    }

    #[test]
    fn test_loading_twice_is_identical() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "defaults.yml", "apply: true\n");
        write(dir.path(), "a.yml", "A:\n  result: '1'\n");
        write(dir.path(), "z/b.yml", "B:\n  result: '2'\n");
        let first = load_config(dir.path(), &LoadOptions::default()).unwrap();
        let second = load_config(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(first, second);
    }
}
