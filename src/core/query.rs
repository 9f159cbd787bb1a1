// src/core/query.rs

//! # Query & Export
//!
//! Filters the items of a registry with an expression over their fields and
//! renders the result as YAML (with the shared attributes factored into a
//! `defaults` block) or exports it as CSV, JSON or YAML records.

use crate::{
    core::registry::Registry,
    expression::{self, Context, EvalError, Value},
    models::{ConfigMap, ConfigValue, Family},
};
use indexmap::IndexMap;
use std::{fs, path::Path};
use thiserror::Error;

/// Errors raised while selecting or exporting entries.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query used a forbidden construct.
    #[error("Forbidden query: {0}")]
    Forbidden(#[source] EvalError),
    /// The export format is not one of csv, json, yml or yaml.
    #[error("Unsupported export format '{0}' (expected csv, json, yml or yaml).")]
    UnsupportedFormat(String),
    /// The export file could not be written.
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The selection could not be serialized.
    #[error("Failed to serialize the selection: {0}")]
    Serialize(String),
}

type QueryResult<T> = Result<T, QueryError>;

/// The column every record is keyed by.
const INDEX: &str = "name";

/// Items kept by a query, each with its selected fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    family: Family,
    columns: Vec<String>,
    entries: IndexMap<String, ConfigMap>,
}

impl Registry {
    /// Items of `category` whose `query` holds, restricted to `fields` (all
    /// fields when empty).
    ///
    /// The query sees every field name, bound to `None` for items lacking it.
    /// A query that does not evaluate is reported and filters nothing.
    pub fn select(&self, category: &str, query: Option<&str>, fields: &[String]) -> QueryResult<Selection> {
        let mut records: IndexMap<String, ConfigMap> = IndexMap::new();
        let mut columns: Vec<String> = Vec::new();
        for item in self.items(category) {
            for key in item.fields.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
            records.insert(item.name.clone(), item.fields.clone());
        }

        let query = query.map(str::trim).filter(|q| !q.is_empty() && !q.eq_ignore_ascii_case("all"));
        if let Some(query) = query {
            records = filter(records, &columns, query)?;
        }
        if records.is_empty() {
            log::warn!("No data");
        }

        if !fields.is_empty() {
            columns = fields.iter().filter(|f| f.as_str() != INDEX).cloned().collect();
            for record in records.values_mut() {
                *record = columns
                    .iter()
                    .map(|c| (c.clone(), record.get(c).cloned().unwrap_or_default()))
                    .collect();
            }
        }
        Ok(Selection {
            family: self.family(),
            columns,
            entries: records,
        })
    }
}

fn filter(records: IndexMap<String, ConfigMap>, columns: &[String], query: &str) -> QueryResult<IndexMap<String, ConfigMap>> {
    let expression = match expression::compile(query) {
        Ok(expression) => expression,
        Err(e) if e.is_forbidden() => return Err(QueryError::Forbidden(e)),
        Err(e) => {
            log::error!("Bad query expression: {}", e);
            log::warn!("No entry filtered");
            return Ok(records);
        }
    };

    let mut kept = IndexMap::new();
    for (name, record) in &records {
        let mut context = Context::with_safe_functions();
        for column in columns {
            context.bind(column.as_str(), record.get(column).map(Value::from).unwrap_or_default());
        }
        context.bind(INDEX, name.as_str());
        match expression.evaluate(&context) {
            Ok(value) if value.truthy() => {
                kept.insert(name.clone(), record.clone());
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Bad query expression: {}", e);
                log::warn!("No entry filtered");
                return Ok(records);
            }
        }
    }
    log::debug!("Query '{}' kept {}/{} entries", query, kept.len(), records.len());
    Ok(kept)
}

impl Selection {
    /// Family the entries were selected from.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Number of selected entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the query kept nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Selected names, in registry order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Selected entries with their projected fields.
    pub fn entries(&self) -> &IndexMap<String, ConfigMap> {
        &self.entries
    }

    /// Moves every attribute set to one same value on all entries into a
    /// `defaults` block. A single entry keeps its attributes.
    pub fn factor_defaults(&self) -> (ConfigMap, IndexMap<String, ConfigMap>) {
        let mut entries = self.entries.clone();
        let mut defaults = ConfigMap::new();
        if entries.len() < 2 {
            return (defaults, entries);
        }
        for column in &self.columns {
            let mut values = entries.values().map(|record| record.get(column));
            let Some(Some(first)) = values.next() else {
                continue;
            };
            if values.all(|v| v == Some(first)) {
                defaults.insert(column.clone(), first.clone());
            }
        }
        for record in entries.values_mut() {
            record.retain(|k, _| !defaults.contains_key(k));
        }
        (defaults, entries)
    }

    /// YAML in configuration layout: the factored `defaults` first, then one
    /// block per entry separated by blank lines.
    pub fn to_yaml(&self) -> QueryResult<String> {
        let (defaults, entries) = self.factor_defaults();
        let mut blocks = Vec::new();
        if !defaults.is_empty() {
            blocks.push(yaml_block(crate::constants::DEFAULTS_KEY, ConfigValue::Map(defaults))?);
        }
        for (name, record) in entries {
            let value = if record.is_empty() {
                ConfigValue::Null
            } else {
                ConfigValue::Map(record)
            };
            blocks.push(yaml_block(&name, value)?);
        }
        Ok(blocks.join("\n"))
    }

    /// Writes the selection as records, the format following the extension.
    pub fn export(&self, path: &Path) -> QueryResult<()> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let content = match extension.as_str() {
            "csv" => self.to_csv(),
            "json" => serde_json::to_string_pretty(&self.records()).map_err(|e| QueryError::Serialize(e.to_string()))?,
            "yml" | "yaml" => serde_yaml::to_string(&self.records()).map_err(|e| QueryError::Serialize(e.to_string()))?,
            _ => return Err(QueryError::UnsupportedFormat(path.display().to_string())),
        };
        fs::write(path, content).map_err(|source| QueryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        log::info!("{} {}s exported to '{}'", self.len(), self.family, path.display());
        Ok(())
    }

    /// One flat record per entry, keyed by `name` first, missing fields as null.
    fn records(&self) -> Vec<ConfigValue> {
        self.entries
            .iter()
            .map(|(name, record)| {
                let mut flat = ConfigMap::new();
                flat.insert(INDEX.to_string(), ConfigValue::from(name.as_str()));
                for column in &self.columns {
                    flat.insert(column.clone(), record.get(column).cloned().unwrap_or_default());
                }
                ConfigValue::Map(flat)
            })
            .collect()
    }

    fn to_csv(&self) -> String {
        let header = std::iter::once(INDEX).chain(self.columns.iter().map(String::as_str));
        let mut lines = vec![header.map(csv_field).collect::<Vec<_>>().join(";")];
        for (name, record) in &self.entries {
            let mut row = vec![csv_field(name)];
            for column in &self.columns {
                let cell = match record.get(column) {
                    None | Some(ConfigValue::Null) => String::new(),
                    Some(value) => csv_field(&value.to_string()),
                };
                row.push(cell);
            }
            lines.push(row.join(";"));
        }
        lines.join("\n") + "\n"
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([';', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn yaml_block(key: &str, value: ConfigValue) -> QueryResult<String> {
    let mut block = ConfigMap::new();
    block.insert(key.to_string(), value);
    serde_yaml::to_string(&ConfigValue::Map(block)).map_err(|e| QueryError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        config_loader::ConfigTree,
        registry::{BaseSources, RegistryBuilder},
    };
    use tempfile::TempDir;

    fn registry() -> Registry {
        let yaml = "upx:\n  status: ok\n  author: a\n  formats: [PE]\n  description: \"fast; small\"\nmew:\n  status: broken\n  author: a\n  formats: [PE]\nelfy:\n  status: ok\n  author: a\n  formats: [ELF]\n";
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let entries = ConfigValue::from(value).as_map().cloned().unwrap();
        RegistryBuilder::new(Family::Packer)
            .build_from_tree(Path::new("memory"), ConfigTree::from(entries), &BaseSources::new())
            .unwrap()
    }

    #[test]
    fn test_query_filters_on_fields() {
        let selection = registry().select("All", Some("status == 'ok'"), &[]).unwrap();
        assert_eq!(selection.names().collect::<Vec<_>>(), vec!["elfy", "upx"]);

        let pe = registry().select("PE", Some("description is not None"), &[]).unwrap();
        assert_eq!(pe.names().collect::<Vec<_>>(), vec!["upx"]);

        let by_name = registry().select("All", Some("name.startswith('m')"), &[]).unwrap();
        assert_eq!(by_name.len(), 1);
    }

    #[test]
    fn test_all_or_none_selects_everything() {
        assert_eq!(registry().select("All", None, &[]).unwrap().len(), 3);
        assert_eq!(registry().select("All", Some("ALL"), &[]).unwrap().len(), 3);
    }

    #[test]
    fn test_bad_query_filters_nothing() {
        assert_eq!(registry().select("All", Some("status =="), &[]).unwrap().len(), 3);
        assert_eq!(registry().select("All", Some("status + 1"), &[]).unwrap().len(), 3);
        assert!(matches!(
            registry().select("All", Some("__import__('os')"), &[]),
            Err(QueryError::Forbidden(_))
        ));
    }

    #[test]
    fn test_fields_projection() {
        let selection = registry().select("ELF", None, &["status".to_string()]).unwrap();
        let record = selection.entries().get("elfy").unwrap();
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["status"]);
    }

    #[test]
    fn test_defaults_are_factored() {
        let selection = registry().select("PE", None, &[]).unwrap();
        let (defaults, entries) = selection.factor_defaults();
        assert_eq!(defaults.get("author"), Some(&ConfigValue::from("a")));
        assert!(defaults.contains_key("formats"));
        assert!(!defaults.contains_key("status"));
        assert!(!entries.get("mew").unwrap().contains_key("author"));

        let yaml = selection.to_yaml().unwrap();
        assert!(yaml.starts_with("defaults:\n"));
        assert!(yaml.contains("\nupx:\n"));
        assert!(yaml.contains("\n\nmew:\n"));
    }

    #[test]
    fn test_export_formats() {
        let dir = TempDir::new().unwrap();
        let selection = registry().select("PE", None, &["status".into(), "description".into()]).unwrap();

        let csv = dir.path().join("out.csv");
        selection.export(&csv).unwrap();
        let text = fs::read_to_string(&csv).unwrap();
        assert_eq!(text, "name;status;description\nupx;ok;\"fast; small\"\nmew;broken;\n");

        let json = dir.path().join("out.json");
        selection.export(&json).unwrap();
        let records: serde_json::Value = serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(records[1]["name"], "mew");
        assert!(records[1]["description"].is_null());

        let yml = dir.path().join("out.yml");
        selection.export(&yml).unwrap();
        assert!(fs::read_to_string(&yml).unwrap().contains("name: upx"));

        assert!(matches!(
            selection.export(&dir.path().join("out.xlsx")),
            Err(QueryError::UnsupportedFormat(_))
        ));
    }
}
