// src/models.rs

//! Data model shared across the crate: configuration values, item families and pipeline targets.

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// --- CONFIGURATION VALUES ---
// Every configuration source (YAML or TOML) is converted into this single,
// order-preserving representation before any merge takes place.

/// An insertion-ordered mapping of configuration keys to values.
pub type ConfigMap = IndexMap<String, ConfigValue>;

/// A single node of a configuration tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConfigValue {
    /// An explicit `null`/`~`, or a missing value.
    #[default]
    Null,
    /// A boolean scalar.
    Bool(bool),
    /// An integer scalar.
    Int(i64),
    /// A floating-point scalar.
    Float(f64),
    /// A string scalar.
    Str(String),
    /// A sequence of values.
    List(Vec<ConfigValue>),
    /// A nested mapping.
    Map(ConfigMap),
}

impl ConfigValue {
    /// The string, if this is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean, if this is a boolean scalar.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer, if this is an integer scalar.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The items, if this is a sequence.
    pub fn as_list(&self) -> Option<&Vec<ConfigValue>> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// The mapping, if this is one.
    pub fn as_map(&self) -> Option<&ConfigMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable access to the mapping, if this is one.
    pub fn as_map_mut(&mut self) -> Option<&mut ConfigMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Whether the value was left empty (`~`, `null`).
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as a list of items; scalars become a one-element list.
    pub fn to_items(&self) -> Vec<ConfigValue> {
        match self {
            Self::List(l) => l.clone(),
            Self::Null => Vec::new(),
            other => vec![other.clone()],
        }
    }
}

/// Python-flavoured rendering (`True`, `None`, ...), used when variant names
/// are synthesized from template values.
impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{:.1}", x),
            Self::Float(x) => write!(f, "{}", x),
            Self::Str(s) => write!(f, "{}", s),
            Self::List(l) => {
                let parts: Vec<String> = l.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Self::Map(m) => {
                let parts: Vec<String> = m.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(l) => l.serialize(serializer),
            Self::Map(m) => m.serialize(serializer),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

// --- Conversions FROM parsed documents ---

fn yaml_key_to_string(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => ConfigValue::from(other).to_string(),
    }
}

impl From<serde_yaml::Value> for ConfigValue {
    fn from(value: serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => Self::Null,
            serde_yaml::Value::Bool(b) => Self::Bool(b),
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_yaml::Value::String(s) => Self::Str(s),
            serde_yaml::Value::Sequence(seq) => Self::List(seq.into_iter().map(Self::from).collect()),
            serde_yaml::Value::Mapping(mapping) => Self::Map(
                mapping
                    .into_iter()
                    .map(|(k, v)| (yaml_key_to_string(k), Self::from(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Self::from(tagged.value),
        }
    }
}

impl From<toml::Value> for ConfigValue {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::Str(s),
            toml::Value::Integer(i) => Self::Int(i),
            toml::Value::Float(x) => Self::Float(x),
            toml::Value::Boolean(b) => Self::Bool(b),
            toml::Value::Datetime(dt) => Self::Str(dt.to_string()),
            toml::Value::Array(a) => Self::List(a.into_iter().map(Self::from).collect()),
            toml::Value::Table(t) => Self::Map(t.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

// --- ITEM FAMILIES ---

/// The kind of item a registry holds. A single record type is used for every
/// item; the family is only a discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    /// Feature-extraction analyzers.
    Analyzer,
    /// Packer detectors.
    Detector,
    /// Executable modifiers (alterations).
    Modifier,
    /// Packers.
    Packer,
    /// Unpackers.
    Unpacker,
}

impl Family {
    /// Every family, in a stable order.
    pub const ALL: [Family; 5] = [
        Family::Analyzer,
        Family::Detector,
        Family::Modifier,
        Family::Packer,
        Family::Unpacker,
    ];

    /// The lowercase singular name (`packer`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Analyzer => "analyzer",
            Self::Detector => "detector",
            Self::Modifier => "modifier",
            Self::Packer => "packer",
            Self::Unpacker => "unpacker",
        }
    }

    /// The plural key used for configuration sources (`packers`).
    pub fn config_key(self) -> String {
        format!("{}s", self.name())
    }

    /// Families an item may point to through `base: Family[name]`.
    pub fn is_base_target(self) -> bool {
        matches!(self, Self::Detector | Self::Packer | Self::Unpacker)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        Self::ALL
            .into_iter()
            .find(|f| f.name() == singular)
            .ok_or_else(|| format!("unknown item family '{}'", s))
    }
}

// --- PIPELINE TARGET ---

/// The executable a pipeline run operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The category key (leaf executable format, e.g. `PE32`).
    pub format: String,
    /// The path that is parsed on the first applied item and built at the end.
    pub destination: PathBuf,
    /// Size of the executable in bytes.
    pub size: u64,
}

impl Target {
    /// A target whose size is already known.
    pub fn new(format: impl Into<String>, destination: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            format: format.into(),
            destination: destination.into(),
            size,
        }
    }

    /// Builds a target from an existing file, reading its size from metadata.
    pub fn from_path(format: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self::new(format, path, size))
    }

    /// Last component of the destination path.
    pub fn filename(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_mapping_keeps_declaration_order() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("zeta: 1\nalpha: 2\nmid: 3\n").unwrap();
        let value = ConfigValue::from(yaml);
        let keys: Vec<_> = value.as_map().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_display_is_python_flavoured() {
        assert_eq!(ConfigValue::Bool(true).to_string(), "True");
        assert_eq!(ConfigValue::Null.to_string(), "None");
        assert_eq!(ConfigValue::Float(2.0).to_string(), "2.0");
        assert_eq!(ConfigValue::Int(7).to_string(), "7");
    }

    #[test]
    fn test_family_parsing_accepts_plural_and_case() {
        assert_eq!("Packers".parse::<Family>().unwrap(), Family::Packer);
        assert_eq!("detector".parse::<Family>().unwrap(), Family::Detector);
        assert!("compressor".parse::<Family>().is_err());
    }

    #[test]
    fn test_toml_table_converts_to_map() {
        let table: toml::Table = toml::from_str("a = 1\nb = [true, \"x\"]\n").unwrap();
        let value = ConfigValue::from(toml::Value::Table(table));
        let map = value.as_map().unwrap();
        assert_eq!(map.get("a"), Some(&ConfigValue::Int(1)));
        assert_eq!(
            map.get("b"),
            Some(&ConfigValue::List(vec![ConfigValue::Bool(true), ConfigValue::from("x")]))
        );
    }
}
