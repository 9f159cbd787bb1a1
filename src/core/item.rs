// src/core/item.rs

//! # Item
//!
//! A single record type for every configured item, whatever its family.
//! An item is "callable": invoking it evaluates its `result` expression(s)
//! against a caller-built [`Context`] and, when keyword parameters are
//! around and the outcome is a function, calls that function with them.

use crate::{
    core::config_loader::ConfigError,
    expression::{self, Args, Context, EvalError, Value},
    models::{ConfigMap, ConfigValue, Family},
};
use indexmap::IndexMap;
use std::fmt;

/// What an item evaluates: one expression or an ordered chain of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSpec {
    /// A single expression.
    Expr(String),
    /// Expressions evaluated in order; the item yields a tuple.
    Chain(Vec<String>),
}

impl ResultSpec {
    /// Reads a `result` value. `None` means the field was not configured.
    pub fn from_config(item: &str, value: Option<&ConfigValue>) -> Result<Self, ConfigError> {
        let undefined = || ConfigError::UndefinedResult { item: item.to_string() };
        let bad = || ConfigError::BadField {
            item: item.to_string(),
            field: "result".to_string(),
            expected: "a string or a list of strings",
        };
        match value {
            None | Some(ConfigValue::Null) => Ok(Self::Expr(item.to_string())),
            Some(ConfigValue::Str(s)) if s.trim().is_empty() => Err(undefined()),
            Some(ConfigValue::Str(s)) => Ok(Self::Expr(s.clone())),
            Some(ConfigValue::Int(_) | ConfigValue::Float(_) | ConfigValue::Bool(_)) => {
                Ok(Self::Expr(value.map(ConfigValue::to_string).unwrap_or_default()))
            }
            Some(ConfigValue::List(list)) if list.is_empty() => Err(undefined()),
            Some(ConfigValue::List(list)) => {
                let chain = list
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).ok_or_else(bad))
                    .collect::<Result<Vec<_>, _>>()?;
                if chain.iter().any(|e| e.trim().is_empty()) {
                    return Err(undefined());
                }
                Ok(Self::Chain(chain))
            }
            Some(ConfigValue::Map(_)) => Err(bad()),
        }
    }

    /// The expression sources, in evaluation order.
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            Self::Expr(e) => vec![e.as_str()],
            Self::Chain(chain) => chain.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for ResultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expr(e) => f.write_str(e),
            Self::Chain(chain) => write!(f, "[{}]", chain.join(", ")),
        }
    }
}

/// One named, configured item. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDefinition {
    /// Item name, as configured (variants carry their derived name).
    pub name: String,
    /// The family the item was loaded for.
    pub family: Family,
    /// Free-form description; empty when not configured.
    pub description: String,
    /// What the item evaluates.
    pub result: ResultSpec,
    /// Runs when no explicit selection is given.
    pub apply: bool,
    /// Repeat count; each round receives the previous outcome as `parser`.
    pub loop_count: Option<u32>,
    /// Opaque search-grid metadata.
    pub grid: ConfigValue,
    /// Extra keyword arguments passed on invocation.
    pub parameters: ConfigMap,
    /// Maturity status shown by `list` (`ok`, `broken`, ...).
    pub status: Option<String>,
    /// Name of the item a variant was derived from.
    pub parent: Option<String>,
    /// Every configured field, as declared (after base and defaults).
    pub fields: ConfigMap,
}

fn bad_field(item: &str, field: &str, expected: &'static str) -> ConfigError {
    ConfigError::BadField {
        item: item.to_string(),
        field: field.to_string(),
        expected,
    }
}

impl ItemDefinition {
    /// Builds a definition from its merged configuration fields.
    ///
    /// `result` overrides the configured `result` field; the registry uses it
    /// for per-category expressions.
    pub fn from_fields(
        family: Family,
        name: &str,
        fields: &ConfigMap,
        result: Option<&ConfigValue>,
        parent: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let result = ResultSpec::from_config(name, result.or_else(|| fields.get("result")))?;

        let apply = match fields.get("apply") {
            None | Some(ConfigValue::Null) => true,
            Some(ConfigValue::Bool(b)) => *b,
            Some(_) => return Err(bad_field(name, "apply", "a boolean")),
        };
        let loop_count = match fields.get("loop") {
            None | Some(ConfigValue::Null) => None,
            Some(ConfigValue::Int(n)) => u32::try_from(*n).ok().filter(|n| *n > 0),
            Some(_) => return Err(bad_field(name, "loop", "an integer or null")),
        };
        let parameters = match fields.get("parameters") {
            None | Some(ConfigValue::Null) => ConfigMap::new(),
            Some(ConfigValue::Map(m)) => m.clone(),
            Some(_) => return Err(bad_field(name, "parameters", "a mapping")),
        };
        let text = |key: &str| fields.get(key).and_then(ConfigValue::as_str).map(str::to_string);

        Ok(Self {
            name: name.to_string(),
            family,
            description: text("description").unwrap_or_default(),
            result,
            apply,
            loop_count,
            grid: fields.get("grid").cloned().unwrap_or_default(),
            parameters,
            status: text("status"),
            parent: parent.map(str::to_string),
            fields: fields.clone(),
        })
    }

    /// Whether the item was expanded from another one.
    pub fn is_variant(&self) -> bool {
        self.parent.is_some()
    }

    /// Invokes the item, repeating it `loop` times when configured.
    ///
    /// `kwargs` are merged with the item's own `parameters` (which win).
    pub fn call(&self, context: &Context, silent: bool, kwargs: IndexMap<String, Value>) -> Result<Value, EvalError> {
        let Some(rounds) = self.loop_count else {
            return self.invoke(context, silent, kwargs);
        };
        let mut kwargs = kwargs;
        let mut state = kwargs.get("parser").cloned().unwrap_or_default();
        for round in 0..rounds {
            log::trace!("{}: round {}/{}", self.name, round + 1, rounds);
            kwargs.insert("parser".to_string(), state);
            state = self.invoke(context, silent, kwargs.clone())?;
        }
        Ok(state)
    }

    /// Evaluates every expression of `result` once.
    ///
    /// A chain yields a tuple of its results; a single expression yields its
    /// own result.
    pub fn invoke(&self, context: &Context, silent: bool, kwargs: IndexMap<String, Value>) -> Result<Value, EvalError> {
        let mut kwargs = kwargs;
        kwargs.extend(self.parameters.iter().map(|(k, v)| (k.clone(), Value::from(v))));

        let mut results = Vec::new();
        for source in self.result.expressions() {
            results.push(self.execute(source, context, silent, &kwargs)?);
        }
        Ok(match results.len() {
            1 => results.pop().unwrap_or_default(),
            _ => Value::Tuple(results),
        })
    }

    fn execute(
        &self,
        source: &str,
        context: &Context,
        silent: bool,
        kwargs: &IndexMap<String, Value>,
    ) -> Result<Value, EvalError> {
        let outcome = expression::compile(source).and_then(|e| e.evaluate(context));
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                self.report(source, &e, context, silent);
                return Err(e);
            }
        };
        if kwargs.is_empty() || !value.is_callable() {
            return Ok(value);
        }
        let args = Args {
            positional: Vec::new(),
            keywords: kwargs.clone(),
        };
        value.call(args).inspect_err(|e| {
            if e.is_forbidden() {
                log::error!("{}: {}", self.name, e);
            } else if !silent {
                log::warn!("Bad function: {}", source);
                log::warn!("{}", e);
            }
        })
    }

    fn report(&self, source: &str, error: &EvalError, context: &Context, silent: bool) {
        match error {
            EvalError::Forbidden(_) => {
                log::warn!("Bad expression: {}", source);
                log::error!("{}", error);
            }
            EvalError::Unbound(name) => {
                if !silent {
                    log::debug!("'{}' is either not computed yet or mistaken", name);
                }
            }
            _ => {
                if !silent {
                    log::warn!("Bad expression: {}", source);
                    log::warn!("{}", error);
                    let names: Vec<&str> = context.names().collect();
                    log::debug!("Variables: {}", names.join(", "));
                }
            }
        }
    }

    /// A Markdown help text built from the descriptive fields.
    pub fn help(&self) -> String {
        let mut blocks = Vec::new();
        if !self.description.is_empty() {
            blocks.push(self.description.clone());
        }
        if let Some(comment) = self.fields.get("comment").and_then(ConfigValue::as_str) {
            blocks.push(format!("> **Note**: {}", comment));
        }
        if let Some(link) = self.fields.get("link").and_then(ConfigValue::as_str) {
            blocks.push(format!("> **Link**: {}", link));
        }
        if let Some(ConfigValue::List(references)) = self.fields.get("references") {
            let list: Vec<String> = references
                .iter()
                .enumerate()
                .map(|(i, r)| format!("{}. {}", i + 1, r))
                .collect();
            blocks.push(format!("## References\n\n{}", list.join("\n")));
        }
        blocks.join("\n\n")
    }
}

impl fmt::Display for ItemDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.name, self.family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(yaml: &str) -> ConfigMap {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        ConfigValue::from(value).as_map().cloned().unwrap()
    }

    fn item(yaml: &str) -> ItemDefinition {
        ItemDefinition::from_fields(Family::Modifier, "item", &fields(yaml), None, None).unwrap()
    }

    fn context() -> Context {
        Context::with_safe_functions().with("x", 1i64).with("y", 5i64)
    }

    #[test]
    fn test_result_defaults_to_name_and_rejects_empty() {
        assert_eq!(item("apply: false").result, ResultSpec::Expr("item".into()));
        let err = ItemDefinition::from_fields(Family::Packer, "p", &fields("result: ''"), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedResult { .. }));
        let err = ItemDefinition::from_fields(Family::Packer, "p", &fields("result: []"), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedResult { .. }));
    }

    #[test]
    fn test_field_types_are_checked() {
        let err = ItemDefinition::from_fields(Family::Packer, "p", &fields("apply: 'yes'"), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::BadField { ref field, .. } if field == "apply"));
        assert_eq!(item("loop: 0").loop_count, None);
        assert_eq!(item("loop: 3").loop_count, Some(3));
    }

    #[test]
    fn test_single_and_chained_results() {
        assert_eq!(item("result: x + 1").call(&context(), false, IndexMap::new()).unwrap(), Value::Int(2));
        let chained = item("result: [x + 1, y * 2]").call(&context(), false, IndexMap::new()).unwrap();
        assert_eq!(chained, Value::Tuple(vec![Value::Int(2), Value::Int(10)]));
    }

    #[test]
    fn test_callable_results_receive_parameters() {
        let def = item("result: 'lambda factor, parser=None: x * factor'\nparameters:\n  factor: 7\n");
        assert_eq!(def.call(&context(), false, IndexMap::new()).unwrap(), Value::Int(7));
        // without keywords, the function itself is returned
        let raw = item("result: 'lambda: 1'");
        assert!(raw.call(&context(), false, IndexMap::new()).unwrap().is_callable());
    }

    #[test]
    fn test_loop_threads_the_parser_state() {
        let def = item("result: 'lambda parser=None: (parser or 0) + 1'\nloop: 4\n");
        let mut kwargs = IndexMap::new();
        kwargs.insert("parser".to_string(), Value::None);
        assert_eq!(def.call(&context(), false, kwargs).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_errors_are_returned_even_when_silent() {
        let def = item("result: y / 0");
        assert!(matches!(def.call(&context(), true, IndexMap::new()), Err(EvalError::ZeroDivision(_))));
        let def = item("result: not_computed_yet");
        assert!(def.call(&context(), true, IndexMap::new()).unwrap_err().is_unbound());
        let def = item("result: x.__class__");
        assert!(def.call(&context(), true, IndexMap::new()).unwrap_err().is_forbidden());
    }

    #[test]
    fn test_help_collects_descriptive_fields() {
        let def = item("description: Packs things\ncomment: slow\nreferences: [a, b]\n");
        let help = def.help();
        assert!(help.starts_with("Packs things"));
        assert!(help.contains("> **Note**: slow"));
        assert!(help.contains("2. b"));
    }
}
