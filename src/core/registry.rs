// src/core/registry.rs

//! # Registry
//!
//! Turns a loaded configuration tree into a [`Registry`]: for one item family,
//! every leaf executable format mapped to the ordered items applying to it.
//!
//! Building happens in two phases. The [`RegistryBuilder`] resolves `base`
//! references, expands `variants` templates and assigns categories; the
//! resulting [`Registry`] is read-only. A [`Catalog`] owns one lazily built
//! registry per family and rebuilds it only when its source path changes.

use crate::{
    constants::{ALL_FORMATS, BASE_EXCLUDED_FIELDS, FROM_PARENT, REGISTRY_FORBIDDEN_DEFAULTS, TEMPLATE_KEY},
    core::{
        config_loader::{self, ConfigError, ConfigTree, LoadOptions},
        formats,
        item::ItemDefinition,
    },
    models::{ConfigMap, ConfigValue, Family},
};
use indexmap::IndexMap;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    path::{Path, PathBuf},
    sync::Arc,
};

lazy_static! {
    // `Family` or `Family[item]`, case-insensitive.
    static ref BASE_RE: Regex =
        Regex::new(r"(?i)^(detector|packer|unpacker)(?:\[(.*?)\])?$").expect("valid base pattern");
}

/// Keys never copied through `base`, on top of the family-specific ones.
const STRUCTURAL_FIELDS: &[&str] = &["base", "variants"];

type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration sources of the families `base` may point to.
pub type BaseSources = HashMap<Family, PathBuf>;

/// Items of one category, in registration order.
pub type CategoryItems = IndexMap<String, Arc<ItemDefinition>>;

/// A read-only, built registry for one family.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    family: Family,
    source: PathBuf,
    categories: IndexMap<String, CategoryItems>,
    /// First definition registered under each name.
    definitions: IndexMap<String, Arc<ItemDefinition>>,
}

impl Registry {
    /// Family the registry was built for.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Configuration source the registry was built from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Number of distinct item names (variants included).
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether no item was registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Leaf categories holding at least one item.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    /// Items registered for one leaf format, in execution order.
    pub fn category(&self, format: &str) -> Option<&CategoryItems> {
        let leaf = formats::canonical_category(format)?;
        self.categories.get(leaf)
    }

    /// Items of every leaf a category expands to, first occurrence of each name kept.
    pub fn items(&self, category: &str) -> Vec<Arc<ItemDefinition>> {
        let mut seen = HashSet::new();
        formats::expand_formats(category)
            .into_iter()
            .filter_map(|leaf| self.categories.get(leaf))
            .flat_map(|items| items.values())
            .filter(|item| seen.insert(item.name.clone()))
            .cloned()
            .collect()
    }

    /// Sorted, de-duplicated item names over the expanded category.
    pub fn names(&self, category: &str) -> Vec<String> {
        formats::expand_formats(category)
            .into_iter()
            .filter_map(|leaf| self.categories.get(leaf))
            .flat_map(|items| items.keys().cloned())
            .sorted()
            .dedup()
            .collect()
    }

    /// Case-insensitive lookup; `_`, `.` and spaces match `-`.
    pub fn get(&self, name: &str) -> Option<Arc<ItemDefinition>> {
        let wanted = formats::normalize_name(name);
        self.definitions
            .iter()
            .find(|(n, _)| formats::normalize_name(n) == wanted)
            .map(|(_, item)| Arc::clone(item))
    }

    /// Every distinct definition, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ItemDefinition>> {
        self.definitions.values()
    }
}

/// Builds registries for one family.
#[derive(Debug, Clone, Copy)]
pub struct RegistryBuilder {
    family: Family,
}

impl RegistryBuilder {
    /// A builder for one family.
    pub fn new(family: Family) -> Self {
        Self { family }
    }

    /// Loads `source` (forbidding the structural keys as defaults) and builds
    /// the registry from it.
    pub fn build(&self, source: &Path, bases: &BaseSources) -> ConfigResult<Registry> {
        let options = LoadOptions::default().forbid(REGISTRY_FORBIDDEN_DEFAULTS);
        let tree = config_loader::load_config(source, &options)?;
        self.build_from_tree(source, tree, bases)
    }

    /// Builds the registry from an already loaded tree.
    pub fn build_from_tree(&self, source: &Path, tree: ConfigTree, bases: &BaseSources) -> ConfigResult<Registry> {
        let mut build = Build {
            family: self.family,
            bases,
            base_cache: HashMap::new(),
            registry: Registry {
                family: self.family,
                source: source.to_path_buf(),
                categories: IndexMap::new(),
                definitions: IndexMap::new(),
            },
            claims: HashMap::new(),
            next_entry: 0,
        };
        // `base` may point to another item of the same family.
        build.base_cache.insert(self.family, tree.clone());

        let (mut items, mut variants) = (0usize, 0usize);
        for (name, params) in tree {
            variants += build.add_entry(&name, params)?;
            items += 1;
        }
        log::debug!("{} {}s loaded ({} variants)", items, self.family, variants);
        Ok(build.registry)
    }
}

/// State of one registry build.
struct Build<'a> {
    family: Family,
    bases: &'a BaseSources,
    base_cache: HashMap<Family, ConfigTree>,
    registry: Registry,
    /// (leaf, name) -> id of the configuration entry that registered it.
    claims: HashMap<(String, String), usize>,
    next_entry: usize,
}

impl Build<'_> {
    /// Registers one configured item and its variants; returns the number of variants.
    fn add_entry(&mut self, name: &str, params: ConfigValue) -> ConfigResult<usize> {
        let mut data = match params {
            ConfigValue::Map(map) => map,
            ConfigValue::Null => ConfigMap::new(),
            _ => return Err(bad_field(name, name, "a mapping")),
        };

        let mut fields = self.resolve_base(name, &mut data)?;
        let declared_variants = data.shift_remove("variants");
        for (key, value) in data {
            fields.insert(key, value);
        }
        let variants = self.expand_variants(name, declared_variants)?;

        self.register(name, &fields, None)?;
        let count = variants.len();
        for (variant, own) in variants {
            let variant_fields = derive_variant(&fields, own);
            self.register(&variant, &variant_fields, Some(name))?;
        }
        Ok(count)
    }

    /// Pops `base` from `data` and returns the fields copied from the referenced item.
    fn resolve_base(&mut self, name: &str, data: &mut ConfigMap) -> ConfigResult<ConfigMap> {
        let Some(ConfigValue::Str(base)) = data.get("base") else {
            return Ok(ConfigMap::new());
        };
        let base = base.clone();
        let bad_base = || ConfigError::BadBase {
            item: name.to_string(),
            base: base.clone(),
        };
        let captures = BASE_RE.captures(base.trim()).ok_or_else(bad_base)?;
        let family: Family = captures
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .parse::<Family>()
            .ok()
            .filter(|f| f.is_base_target())
            .ok_or_else(bad_base)?;
        let target = captures
            .get(2)
            .map(|m| m.as_str().trim())
            .filter(|t| !t.is_empty())
            .unwrap_or(name)
            .to_string();
        data.shift_remove("base");

        if family == self.family && target == name {
            return Err(ConfigError::SelfReference { item: name.to_string() });
        }

        let tree = self.base_tree(family, name)?;
        let Some(entry) = tree.get(&target).and_then(ConfigValue::as_map) else {
            log::warn!("{}: base item '{}' is not defined among {}s", name, target, family);
            return Ok(ConfigMap::new());
        };
        Ok(entry
            .iter()
            .filter(|(k, _)| !BASE_EXCLUDED_FIELDS.contains(&k.as_str()) && !STRUCTURAL_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// The raw configuration of another family, loaded at most once per build.
    fn base_tree(&mut self, family: Family, item: &str) -> ConfigResult<&ConfigTree> {
        match self.base_cache.entry(family) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let source = self.bases.get(&family).ok_or_else(|| ConfigError::MissingBaseSource {
                    family: family.to_string(),
                    item: item.to_string(),
                })?;
                log::trace!("Loading {}s from '{}' for base references", family, source.display());
                let tree = config_loader::load_config(source, &LoadOptions::default())?;
                Ok(e.insert(tree))
            }
        }
    }

    /// Explicit variants first, then one variant per point of the template's
    /// cross product (named `item-v1-v2...`).
    fn expand_variants(&self, item: &str, declared: Option<ConfigValue>) -> ConfigResult<IndexMap<String, ConfigMap>> {
        let mut variants = IndexMap::new();
        let mut declared = match declared {
            None | Some(ConfigValue::Null) => return Ok(variants),
            Some(ConfigValue::Map(map)) => map,
            Some(_) => return Err(bad_field(item, "variants", "a mapping")),
        };
        let template = match declared.shift_remove(TEMPLATE_KEY) {
            None | Some(ConfigValue::Null) => ConfigMap::new(),
            Some(ConfigValue::Map(map)) => map,
            Some(_) => return Err(bad_field(item, TEMPLATE_KEY, "a mapping")),
        };
        for (name, own) in declared {
            let own = match own {
                ConfigValue::Map(map) => map,
                ConfigValue::Null => ConfigMap::new(),
                _ => return Err(bad_field(&name, "variants", "a mapping")),
            };
            variants.insert(name, own);
        }

        let (attributes, shared): (Vec<_>, Vec<_>) = template.into_iter().partition(|(k, _)| k.starts_with('_'));
        if attributes.is_empty() {
            if !shared.is_empty() {
                log::warn!("{}: variant template declares no '_' attribute", item);
            }
            return Ok(variants);
        }
        let names: Vec<String> = attributes
            .iter()
            .map(|(k, _)| k.get(1..).unwrap_or_default().to_string())
            .collect();
        let axes: Vec<Vec<ConfigValue>> = attributes.iter().map(|(_, v)| v.to_items()).collect();

        let mut synthesized = HashSet::new();
        for point in axes.into_iter().map(Vec::into_iter).multi_cartesian_product() {
            let name = std::iter::once(item.to_string())
                .chain(point.iter().map(ConfigValue::to_string))
                .join("-");
            if !synthesized.insert(name.clone()) {
                return Err(ConfigError::DuplicateItem {
                    name,
                    category: self.family.config_key(),
                });
            }
            let entry = variants
                .entry(name)
                .or_insert_with(|| shared.iter().cloned().collect());
            for (key, value) in names.iter().cloned().zip(point).chain(shared.iter().cloned()) {
                entry.entry(key).or_insert(value);
            }
        }
        Ok(variants)
    }

    /// Builds the definition(s) of one entry and registers them under every
    /// leaf they apply to, the most specific category first.
    fn register(&mut self, name: &str, fields: &ConfigMap, parent: Option<&str>) -> ConfigResult<()> {
        let entry = self.next_entry;
        self.next_entry += 1;

        let per_category = match fields.get("result") {
            Some(ConfigValue::Map(results)) => Some(category_results(name, results)?),
            _ => None,
        };
        let declared = declared_formats(name, fields)?;

        let mut shared: Option<Arc<ItemDefinition>> = None;
        let mut first: Option<Arc<ItemDefinition>> = None;
        for tier in formats::precedence_tiers() {
            for category in tier {
                let definition = match &per_category {
                    Some(results) => match results.get(category) {
                        Some(result) => Arc::new(ItemDefinition::from_fields(
                            self.family,
                            name,
                            fields,
                            Some(result),
                            parent,
                        )?),
                        None => continue,
                    },
                    None if declared.contains(&category) => match &shared {
                        Some(definition) => Arc::clone(definition),
                        None => {
                            let definition = Arc::new(ItemDefinition::from_fields(self.family, name, fields, None, parent)?);
                            shared = Some(Arc::clone(&definition));
                            definition
                        }
                    },
                    None => continue,
                };
                for leaf in formats::expand_formats(category) {
                    self.claim(leaf, name, entry, &definition)?;
                }
                first.get_or_insert(definition);
            }
        }

        match first {
            Some(definition) => {
                self.registry.definitions.entry(name.to_string()).or_insert(definition);
            }
            None => log::warn!("{}: no category to register under", name),
        }
        Ok(())
    }

    fn claim(&mut self, leaf: &str, name: &str, entry: usize, definition: &Arc<ItemDefinition>) -> ConfigResult<()> {
        let key = (leaf.to_string(), name.to_string());
        match self.claims.get(&key) {
            // a more specific category of the same entry got there first
            Some(owner) if *owner == entry => Ok(()),
            Some(_) => Err(ConfigError::DuplicateItem {
                name: name.to_string(),
                category: leaf.to_string(),
            }),
            None => {
                self.claims.insert(key, entry);
                self.registry
                    .categories
                    .entry(leaf.to_string())
                    .or_default()
                    .insert(name.to_string(), Arc::clone(definition));
                Ok(())
            }
        }
    }
}

fn bad_field(item: &str, field: &str, expected: &'static str) -> ConfigError {
    ConfigError::BadField {
        item: item.to_string(),
        field: field.to_string(),
        expected,
    }
}

/// Parent fields, then the variant's own; `<from-parent>` in a list splices
/// in the parent's list for that field.
fn derive_variant(parent: &ConfigMap, own: ConfigMap) -> ConfigMap {
    let mut fields = parent.clone();
    for (key, value) in own {
        let value = match value {
            ConfigValue::List(items) if items.iter().any(|v| v.as_str() == Some(FROM_PARENT)) => {
                let inherited = parent.get(&key).map(ConfigValue::to_items).unwrap_or_default();
                ConfigValue::List(
                    items
                        .into_iter()
                        .flat_map(|v| {
                            if v.as_str() == Some(FROM_PARENT) {
                                inherited.clone()
                            } else {
                                vec![v]
                            }
                        })
                        .collect(),
                )
            }
            other => other,
        };
        fields.insert(key, value);
    }
    fields
}

fn category_results(item: &str, results: &ConfigMap) -> ConfigResult<HashMap<&'static str, ConfigValue>> {
    results
        .iter()
        .map(|(category, result)| {
            formats::canonical_category(category)
                .map(|c| (c, result.clone()))
                .ok_or_else(|| ConfigError::UnknownCategory {
                    item: item.to_string(),
                    category: category.clone(),
                })
        })
        .collect()
}

fn declared_formats(item: &str, fields: &ConfigMap) -> ConfigResult<Vec<&'static str>> {
    let Some(declared) = fields.get("formats").filter(|v| !v.is_null()) else {
        return Ok(vec![ALL_FORMATS]);
    };
    declared
        .to_items()
        .iter()
        .map(|value| {
            let category = value.as_str().ok_or_else(|| bad_field(item, "formats", "a list of format names"))?;
            formats::canonical_category(category).ok_or_else(|| ConfigError::UnknownCategory {
                item: item.to_string(),
                category: category.to_string(),
            })
        })
        .collect()
}

// --- CATALOG ---

/// Owns the registries of every family, each built lazily from its source.
#[derive(Debug, Default)]
pub struct Catalog {
    sources: BaseSources,
    registries: HashMap<Family, Registry>,
}

impl Catalog {
    /// An empty catalog: no source, no registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current source of a family, if any.
    pub fn source(&self, family: Family) -> Option<&Path> {
        self.sources.get(&family).map(PathBuf::as_path)
    }

    /// Points a family to a new source. The family's registry is dropped only
    /// when the (expanded, canonical) path actually changes.
    pub fn set_source(&mut self, family: Family, path: impl AsRef<Path>) -> bool {
        let path = normalize_source(path.as_ref());
        if self.sources.get(&family) == Some(&path) {
            log::trace!("Source of {}s unchanged", family);
            return false;
        }
        log::debug!("Source of {}s set to '{}'", family, path.display());
        self.sources.insert(family, path);
        self.invalidate(family);
        true
    }

    /// Drops the built registry of a family; the next access rebuilds it.
    pub fn invalidate(&mut self, family: Family) {
        self.registries.remove(&family);
    }

    /// Whether the registry of a family is currently cached.
    pub fn is_built(&self, family: Family) -> bool {
        self.registries.contains_key(&family)
    }

    /// The registry of a family, built on first access.
    pub fn registry(&mut self, family: Family) -> ConfigResult<&Registry> {
        match self.registries.entry(family) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let source = self
                    .sources
                    .get(&family)
                    .ok_or_else(|| ConfigError::NoSource(family.to_string()))?;
                let registry = RegistryBuilder::new(family).build(source, &self.sources)?;
                Ok(e.insert(registry))
            }
        }
    }
}

fn normalize_source(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let expanded = PathBuf::from(shellexpand::tilde(&raw).into_owned());
    dunce::canonicalize(&expanded).unwrap_or(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn build(family: Family, source: &Path) -> ConfigResult<Registry> {
        RegistryBuilder::new(family).build(source, &BaseSources::new())
    }

    #[test]
    fn test_template_variants_are_named_from_the_product() {
        let dir = TempDir::new().unwrap();
        let source = write(
            dir.path(),
            "modifiers.yml",
            "T:\n  result: x\n  status: ok\n  variants:\n    _template:\n      _n: [1, 2]\n      _c: [x, y]\n",
        );
        let registry = build(Family::Modifier, &source).unwrap();
        let names: Vec<_> = registry.category("PE32").unwrap().keys().cloned().collect();
        assert_eq!(names, vec!["T", "T-1-x", "T-1-y", "T-2-x", "T-2-y"]);

        let variant = registry.get("T-2-y").unwrap();
        assert_eq!(variant.parent.as_deref(), Some("T"));
        assert_eq!(variant.fields.get("n"), Some(&ConfigValue::Int(2)));
        assert_eq!(variant.fields.get("c"), Some(&ConfigValue::from("y")));
        // variants inherit the status of their parent
        assert_eq!(variant.status.as_deref(), Some("ok"));
    }

    #[test]
    fn test_explicit_variants_and_from_parent_splicing() {
        let dir = TempDir::new().unwrap();
        let source = write(
            dir.path(),
            "packers.yml",
            "upx:\n  steps: [download, build]\n  variants:\n    upx-lzma:\n      steps: [\"<from-parent>\", compress]\n      description: LZMA flavour\n",
        );
        let registry = build(Family::Packer, &source).unwrap();
        let variant = registry.get("upx-lzma").unwrap();
        assert_eq!(
            variant.fields.get("steps"),
            Some(&ConfigValue::List(vec!["download".into(), "build".into(), "compress".into()]))
        );
        assert_eq!(variant.description, "LZMA flavour");
        assert!(registry.get("upx").unwrap().parent.is_none());
    }

    #[test]
    fn test_base_copies_fields_from_other_family() {
        let dir = TempDir::new().unwrap();
        let packers = write(
            dir.path(),
            "packers.yml",
            "D:\n  description: desc\n  status: broken\n  steps: [a]\n  link: https://example.org\n",
        );
        let detectors = write(
            dir.path(),
            "detectors.yml",
            "C:\n  base: Packer[D]\nE:\n  base: packer[D]\n  description: own\n",
        );
        let mut bases = BaseSources::new();
        bases.insert(Family::Packer, packers);
        let registry = RegistryBuilder::new(Family::Detector).build(&detectors, &bases).unwrap();

        let c = registry.get("C").unwrap();
        assert_eq!(c.description, "desc");
        assert_eq!(c.fields.get("link"), Some(&ConfigValue::from("https://example.org")));
        assert!(c.status.is_none());
        assert!(!c.fields.contains_key("steps"));
        assert!(!c.fields.contains_key("base"));
        assert_eq!(registry.get("E").unwrap().description, "own");
    }

    #[test]
    fn test_base_errors() {
        let dir = TempDir::new().unwrap();
        let own = write(dir.path(), "self.yml", "X:\n  base: Detector\n");
        assert!(matches!(build(Family::Detector, &own), Err(ConfigError::SelfReference { .. })));

        let bad = write(dir.path(), "bad.yml", "X:\n  base: Compressor[zip]\n");
        assert!(matches!(build(Family::Detector, &bad), Err(ConfigError::BadBase { .. })));

        let missing = write(dir.path(), "missing.yml", "X:\n  base: Packer[upx]\n");
        assert!(matches!(build(Family::Detector, &missing), Err(ConfigError::MissingBaseSource { .. })));
    }

    #[test]
    fn test_structural_defaults_are_forbidden() {
        let dir = TempDir::new().unwrap();
        let source = write(dir.path(), "p.yml", "defaults:\n  variants: {}\nA:\n  result: '1'\n");
        assert!(matches!(build(Family::Packer, &source), Err(ConfigError::ForbiddenDefault { .. })));
    }

    #[test]
    fn test_most_specific_category_wins() {
        let dir = TempDir::new().unwrap();
        let source = write(
            dir.path(),
            "modifiers.yml",
            "A:\n  result:\n    All: all\n    PE: group\n    PE32: leaf\nB:\n  formats: [ELF]\n",
        );
        let registry = build(Family::Modifier, &source).unwrap();
        let result = |format: &str| registry.category(format).unwrap().get("A").unwrap().result.to_string();
        assert_eq!(result("PE32"), "leaf");
        assert_eq!(result("PE64"), "group");
        assert_eq!(result("ELF64"), "all");
        assert!(registry.category("ELF32").unwrap().contains_key("B"));
        assert!(!registry.category("PE32").unwrap().contains_key("B"));
    }

    #[test]
    fn test_one_definition_is_shared_across_categories() {
        let dir = TempDir::new().unwrap();
        let source = write(dir.path(), "m.yml", "A:\n  result: x\n");
        let registry = build(Family::Modifier, &source).unwrap();
        let pe = registry.category("PE32").unwrap().get("A").unwrap();
        let elf = registry.category("ELF64").unwrap().get("A").unwrap();
        assert!(Arc::ptr_eq(pe, elf));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let source = write(
            dir.path(),
            "m.yml",
            "X-1:\n  result: a\nX:\n  variants:\n    _template:\n      _n: [1]\n",
        );
        assert!(matches!(build(Family::Modifier, &source), Err(ConfigError::DuplicateItem { .. })));

        let twice = write(dir.path(), "t.yml", "Y:\n  variants:\n    _template:\n      _n: [1, 1]\n");
        assert!(matches!(build(Family::Modifier, &twice), Err(ConfigError::DuplicateItem { .. })));
    }

    #[test]
    fn test_unknown_category_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let source = write(dir.path(), "m.yml", "A:\n  formats: [COFF]\n");
        assert!(matches!(build(Family::Modifier, &source), Err(ConfigError::UnknownCategory { .. })));
    }

    #[test]
    fn test_names_and_lookup() {
        let dir = TempDir::new().unwrap();
        let source = write(dir.path(), "p.yml", "UPX_Packer:\n  formats: [PE]\nalpha:\n  formats: [ELF]\n");
        let registry = build(Family::Packer, &source).unwrap();
        assert_eq!(registry.names("All"), vec!["UPX_Packer", "alpha"]);
        assert_eq!(registry.names("ELF"), vec!["alpha"]);
        assert_eq!(registry.get("upx-packer").unwrap().name, "UPX_Packer");
        assert!(registry.get("nothing").is_none());
    }

    #[test]
    fn test_rebuilding_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "defaults.yml", "apply: false\n");
        write(dir.path(), "a.yml", "A:\n  result: x\n  variants:\n    _template:\n      _k: [1, 2]\n");
        write(dir.path(), "sub/b.yml", "B:\n  result:\n    PE: y\n");
        let first = build(Family::Modifier, dir.path()).unwrap();
        let second = build(Family::Modifier, dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_catalog_rebuilds_only_on_source_change() {
        let dir = TempDir::new().unwrap();
        let first = write(dir.path(), "one.yml", "A:\n  result: x\n");
        let second = write(dir.path(), "two.yml", "B:\n  result: y\n");

        let mut catalog = Catalog::new();
        assert!(matches!(catalog.registry(Family::Modifier), Err(ConfigError::NoSource(_))));
        assert!(catalog.set_source(Family::Modifier, &first));
        assert!(catalog.registry(Family::Modifier).unwrap().get("A").is_some());
        assert!(catalog.is_built(Family::Modifier));

        assert!(!catalog.set_source(Family::Modifier, &first));
        assert!(catalog.is_built(Family::Modifier));

        assert!(catalog.set_source(Family::Modifier, &second));
        assert!(!catalog.is_built(Family::Modifier));
        assert!(catalog.registry(Family::Modifier).unwrap().get("B").is_some());

        catalog.invalidate(Family::Modifier);
        assert!(!catalog.is_built(Family::Modifier));
    }

    proptest! {
        #[test]
        fn prop_variant_count_is_the_product_of_axes(lengths in proptest::collection::vec(1usize..4, 1..4)) {
            let mut template = ConfigMap::new();
            for (axis, len) in lengths.iter().enumerate() {
                let values = (0..*len).map(|v| ConfigValue::Int(i64::try_from(v).unwrap())).collect();
                template.insert(format!("_a{}", axis), ConfigValue::List(values));
            }
            let mut variants = ConfigMap::new();
            variants.insert(TEMPLATE_KEY.to_string(), ConfigValue::Map(template));
            let mut params = ConfigMap::new();
            params.insert("variants".to_string(), ConfigValue::Map(variants));
            let mut entries = ConfigMap::new();
            entries.insert("T".to_string(), ConfigValue::Map(params));

            let registry = RegistryBuilder::new(Family::Modifier)
                .build_from_tree(Path::new("memory"), ConfigTree::from(entries), &BaseSources::new())
                .unwrap();
            let expected: usize = lengths.iter().product();
            prop_assert_eq!(registry.len(), expected + 1);
            prop_assert_eq!(registry.names("PE32").len(), expected + 1);
        }
    }
}
