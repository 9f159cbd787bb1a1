// src/core/pipeline.rs

//! # Pipeline Executor
//!
//! Runs the selected items of a registry, in registry order, against one
//! target executable. The binary is parsed right before the first item and
//! built once at the end, and only if at least one item succeeded.
//!
//! A failing item is logged and skipped. A forbidden expression is the one
//! failure that aborts the whole run.

use crate::{
    core::{formats, item::ItemDefinition, modifiers, registry::Registry},
    expression::{Args, CallGuard, Context, EvalError, Value},
    models::Target,
    system::binary::{BinaryError, BinaryHandle, BinaryParser, into_handle},
};
use indexmap::IndexMap;
use std::{fmt, rc::Rc, sync::Arc};
use thiserror::Error;

/// Errors that stop a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// An explicitly selected item does not exist for the category.
    #[error("Item '{name}' does not exist for category '{category}'.")]
    UnknownItem { name: String, category: String },
    /// The target's format is not a known category.
    #[error("Unknown category '{0}'.")]
    UnknownCategory(String),
    /// An item used a forbidden construct; the run was aborted.
    #[error("Security violation in '{item}': {source}")]
    Security {
        item: String,
        #[source]
        source: EvalError,
    },
    /// The binary could not be parsed or built.
    #[error(transparent)]
    Binary(#[from] BinaryError),
}

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No binary parsed yet.
    #[default]
    Idle,
    /// The target is being parsed ahead of the first item.
    Parsing,
    /// Items are running against the live binary.
    Applying,
    /// The binary was built.
    Committed,
    /// Nothing to run on, or the run was stopped.
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Parsing => "parsing",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a run picks its items and what it binds for them.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Explicit item names; `None` runs every item whose `apply` flag is set.
    pub selection: Option<Vec<String>>,
    /// Drop unknown selected names with a warning instead of failing.
    pub lenient: bool,
    /// Extra names bound into every item's context.
    pub bindings: IndexMap<String, Value>,
}

impl PipelineOptions {
    /// Runs exactly these items (in registry order) instead of the `apply` ones.
    pub fn select<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.selection = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets whether unknown selected names are dropped with a warning.
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    /// Binds an extra name into every item's context.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }
}

/// Outcome of a run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Items that ran without error, in execution order.
    pub applied: Vec<String>,
    /// Items that failed, with the cause.
    pub failures: Vec<(String, String)>,
    /// State the run ended in.
    pub state: PipelineState,
    /// The binary as left by the run, if it was parsed.
    pub binary: Option<BinaryHandle>,
}

impl PipelineReport {
    /// Whether the binary was built.
    pub fn committed(&self) -> bool {
        self.state == PipelineState::Committed
    }
}

/// Applies items of one registry through one binary parser.
pub struct Pipeline<'a> {
    registry: &'a Registry,
    parser: &'a dyn BinaryParser,
    state: PipelineState,
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("family", &self.registry.family())
            .field("state", &self.state)
            .finish()
    }
}

impl<'a> Pipeline<'a> {
    /// A pipeline over `registry`, parsing targets with `parser`.
    pub fn new(registry: &'a Registry, parser: &'a dyn BinaryParser) -> Self {
        Self {
            registry,
            parser,
            state: PipelineState::Idle,
        }
    }

    /// State of the last (or current) run.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Runs the selected items against `target`. An absent target aborts the
    /// run without doing anything.
    pub fn run(&mut self, target: Option<&Target>, options: &PipelineOptions) -> Result<PipelineReport, PipelineError> {
        self.state = PipelineState::Idle;
        let Some(target) = target else {
            log::warn!("No target given, nothing to apply");
            self.state = PipelineState::Aborted;
            return Ok(PipelineReport {
                state: self.state,
                ..PipelineReport::default()
            });
        };
        let category = formats::canonical_category(&target.format)
            .ok_or_else(|| PipelineError::UnknownCategory(target.format.clone()))?;

        let items = self.selected_items(category, options)?;
        let mut report = PipelineReport::default();
        let mut scope: Option<Rc<RunScope>> = None;

        for item in items {
            let scope = match &scope {
                Some(scope) => Rc::clone(scope),
                None => {
                    self.state = PipelineState::Parsing;
                    log::debug!("Parsing '{}'", target.destination.display());
                    let handle = into_handle(self.parser.parse(&target.destination, &target.format)?);
                    let run_scope = Rc::new(RunScope {
                        target: target.clone(),
                        handle,
                        items: self.registry.items(category),
                        bindings: options.bindings.clone(),
                    });
                    scope = Some(Rc::clone(&run_scope));
                    self.state = PipelineState::Applying;
                    run_scope
                }
            };

            log::debug!("Applying '{}'", item.name);
            match item.call(&scope.context(), false, scope.kwargs()) {
                Ok(_) => report.applied.push(item.name.clone()),
                Err(e) if e.is_forbidden() => {
                    self.state = PipelineState::Aborted;
                    return Err(PipelineError::Security {
                        item: item.name.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    log::warn!("{}: {}", item.name, e);
                    report.failures.push((item.name.clone(), e.to_string()));
                }
            }
        }

        let binary = scope.map(|scope| Rc::clone(&scope.handle));
        if let Some(handle) = &binary
            && !report.applied.is_empty()
        {
            let mut object = handle
                .try_borrow_mut()
                .map_err(|_| BinaryError::Build {
                    path: target.destination.clone(),
                    reason: "binary is still in use".into(),
                })?;
            object.build()?;
            self.state = PipelineState::Committed;
        }
        log::info!(
            "{} item(s) applied to '{}' ({} failed)",
            report.applied.len(),
            target.filename(),
            report.failures.len()
        );
        report.state = self.state;
        report.binary = binary;
        Ok(report)
    }

    /// Items to run for a category, in registry order.
    fn selected_items(&self, category: &str, options: &PipelineOptions) -> Result<Vec<Arc<ItemDefinition>>, PipelineError> {
        let available = self.registry.items(category);
        let Some(selection) = &options.selection else {
            return Ok(available.into_iter().filter(|item| item.apply).collect());
        };

        let mut wanted = Vec::new();
        for name in selection {
            let key = formats::normalize_name(name);
            if available.iter().any(|item| formats::normalize_name(&item.name) == key) {
                wanted.push(key);
            } else if options.lenient {
                log::warn!("{} '{}' does not exist", self.registry.family(), name);
            } else {
                return Err(PipelineError::UnknownItem {
                    name: name.clone(),
                    category: category.to_string(),
                });
            }
        }
        Ok(available
            .into_iter()
            .filter(|item| wanted.contains(&formats::normalize_name(&item.name)))
            .collect())
    }
}

fn executable_value(target: &Target) -> Value {
    Value::from_pairs([
        ("format", Value::from(target.format.as_str())),
        ("destination", Value::from(target.destination.display().to_string())),
        ("filename", Value::from(target.filename())),
        ("size", Value::from(target.size)),
    ])
}

/// What every item of one run shares: the target, its live binary, the
/// category's items and the caller's bindings.
struct RunScope {
    target: Target,
    handle: BinaryHandle,
    items: Vec<Arc<ItemDefinition>>,
    bindings: IndexMap<String, Value>,
}

impl RunScope {
    /// Keyword arguments every item is invoked with.
    fn kwargs(&self) -> IndexMap<String, Value> {
        let mut kwargs = IndexMap::new();
        kwargs.insert("executable".to_string(), executable_value(&self.target));
        kwargs.insert("parser".to_string(), Value::Binary(Rc::clone(&self.handle)));
        kwargs
    }

    /// Safe functions, format helpers, the category's items, live binary
    /// data, then caller bindings. Later names shadow earlier ones.
    fn context(self: &Rc<Self>) -> Context {
        let mut context = Context::with_safe_functions();
        context.extend(modifiers::helpers(&self.target.format));
        for item in &self.items {
            context.bind(item.name.as_str(), self.item_function(item));
        }

        let sections = self
            .handle
            .try_borrow()
            .map(|binary| binary.sections().iter().map(Value::from).collect())
            .unwrap_or_default();
        context.bind("sections", Value::List(sections));

        let checksum_of = Rc::clone(&self.handle);
        context.bind(
            "compute_checksum",
            Value::function("compute_checksum", move |_| {
                let binary = checksum_of.try_borrow().map_err(|_| EvalError::Call {
                    function: "compute_checksum".into(),
                    reason: "binary is in use".into(),
                })?;
                Ok(Value::Int(i64::from(binary.compute_checksum())))
            }),
        );
        context.bind("executable", executable_value(&self.target));
        context.bind("parser", Value::Binary(Rc::clone(&self.handle)));
        context.extend(self.bindings.clone());
        context
    }

    /// Exposes `item` to other items' expressions. Keywords given at the
    /// call site override `executable` and `parser`.
    fn item_function(self: &Rc<Self>, item: &Arc<ItemDefinition>) -> Value {
        let scope = Rc::clone(self);
        let item = Arc::clone(item);
        let name = item.name.clone();
        Value::function(&name, move |args: Args| {
            if !args.positional.is_empty() {
                return Err(EvalError::Type(format!("{}() takes keyword arguments only", item.name)));
            }
            let _guard = CallGuard::enter()?;
            let mut kwargs = scope.kwargs();
            kwargs.extend(args.keywords);
            item.call(&scope.context(), false, kwargs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{config_loader::ConfigTree, registry::{BaseSources, RegistryBuilder}},
        models::{ConfigMap, ConfigValue, Family},
        system::binary::{BinaryObject, MemoryBinary, MemoryParser, Section},
    };
    use std::{cell::Cell, path::Path};

    fn registry(yaml: &str) -> Registry {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let entries = ConfigValue::from(value).as_map().cloned().unwrap();
        RegistryBuilder::new(Family::Modifier)
            .build_from_tree(Path::new("memory"), ConfigTree::from(entries), &BaseSources::new())
            .unwrap()
    }

    fn target() -> Target {
        Target::new("PE32", "/tmp/sample.exe", 1024)
    }

    /// Counts parses, and builds through the shared counter.
    struct CountingParser {
        parses: Cell<usize>,
        builds: Rc<Cell<usize>>,
    }

    #[derive(Debug)]
    struct CountingBinary {
        inner: MemoryBinary,
        builds: Rc<Cell<usize>>,
    }

    impl BinaryObject for CountingBinary {
        fn format(&self) -> &str {
            self.inner.format()
        }
        fn path(&self) -> &Path {
            self.inner.path()
        }
        fn sections(&self) -> Vec<Section> {
            self.inner.sections()
        }
        fn compute_checksum(&self) -> u32 {
            self.inner.compute_checksum()
        }
        fn build(&mut self) -> Result<(), BinaryError> {
            self.builds.set(self.builds.get() + 1);
            self.inner.build()
        }
        fn add_section(&mut self, name: &str, data: &[u8]) -> Result<(), BinaryError> {
            self.inner.add_section(name, data)
        }
        fn append_to_section(&mut self, name: &str, data: &[u8]) -> Result<(), BinaryError> {
            self.inner.append_to_section(name, data)
        }
    }

    impl CountingParser {
        fn new() -> Self {
            Self {
                parses: Cell::new(0),
                builds: Rc::new(Cell::new(0)),
            }
        }
    }

    impl BinaryParser for CountingParser {
        fn parse(&self, path: &Path, format: &str) -> Result<Box<dyn BinaryObject>, BinaryError> {
            self.parses.set(self.parses.get() + 1);
            let inner = MemoryParser::default().parse(path, format)?;
            Ok(Box::new(CountingBinary {
                inner: MemoryBinary::new(format, path, inner.sections()),
                builds: Rc::clone(&self.builds),
            }))
        }
    }

    #[test]
    fn test_failing_item_is_isolated_and_commit_happens_once() {
        let registry = registry("A:\n  result: x + 1\n  apply: true\nB:\n  result: y / 0\n  apply: true\n");
        let parser = CountingParser::new();
        let options = PipelineOptions::default().bind("x", 1i64).bind("y", 5i64);
        let mut pipeline = Pipeline::new(&registry, &parser);

        let report = pipeline.run(Some(&target()), &options).unwrap();
        assert_eq!(report.applied, vec!["A"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "B");
        assert!(report.failures[0].1.contains("ZeroDivision"));
        assert!(report.committed());
        assert_eq!(parser.parses.get(), 1);
        assert_eq!(parser.builds.get(), 1);
        assert_eq!(pipeline.state(), PipelineState::Committed);
    }

    #[test]
    fn test_no_commit_when_nothing_applied() {
        let registry = registry("B:\n  result: missing_name\n");
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(parser.builds.get(), 0);
        assert_eq!(report.state, PipelineState::Applying);
    }

    #[test]
    fn test_absent_target_aborts_without_parsing() {
        let registry = registry("A:\n  result: '1'\n");
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser).run(None, &PipelineOptions::default()).unwrap();
        assert_eq!(report.state, PipelineState::Aborted);
        assert_eq!(parser.parses.get(), 0);
    }

    #[test]
    fn test_nothing_selected_never_parses() {
        let registry = registry("A:\n  result: '1'\n  apply: false\n");
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert_eq!(report.state, PipelineState::Idle);
        assert_eq!(parser.parses.get(), 0);
    }

    #[test]
    fn test_forbidden_expression_aborts_the_run() {
        let registry = registry("A:\n  result: __import__('os')\nB:\n  result: '1'\n");
        let parser = CountingParser::new();
        let mut pipeline = Pipeline::new(&registry, &parser);
        let err = pipeline.run(Some(&target()), &PipelineOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Security { ref item, .. } if item == "A"));
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(parser.builds.get(), 0);
    }

    #[test]
    fn test_explicit_selection_overrides_apply_and_keeps_registry_order() {
        let registry = registry("A:\n  result: '1'\n  apply: false\nB:\n  result: '2'\nC:\n  result: '3'\n");
        let parser = CountingParser::new();
        let options = PipelineOptions::default().select(["c", "A"]);
        let report = Pipeline::new(&registry, &parser).run(Some(&target()), &options).unwrap();
        assert_eq!(report.applied, vec!["A", "C"]);
    }

    #[test]
    fn test_unknown_selection_is_an_error_unless_lenient() {
        let registry = registry("A:\n  result: '1'\n");
        let parser = CountingParser::new();
        let strict = PipelineOptions::default().select(["A", "Z"]);
        assert!(matches!(
            Pipeline::new(&registry, &parser).run(Some(&target()), &strict),
            Err(PipelineError::UnknownItem { .. })
        ));
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &strict.clone().lenient(true))
            .unwrap();
        assert_eq!(report.applied, vec!["A"]);
    }

    #[test]
    fn test_unknown_category() {
        let registry = registry("A:\n  result: '1'\n");
        let parser = CountingParser::new();
        let target = Target::new("COFF", "/tmp/x", 0);
        assert!(matches!(
            Pipeline::new(&registry, &parser).run(Some(&target), &PipelineOptions::default()),
            Err(PipelineError::UnknownCategory(_))
        ));
    }

    #[test]
    fn test_later_items_observe_earlier_mutations() {
        let registry = registry(
            "Add:\n  result: add_section('.upx', b'xx')\nCount:\n  result: \"len(sections) if len(sections) == 4 else missing\"\n",
        );
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert_eq!(report.applied, vec!["Add", "Count"]);
        let binary = report.binary.unwrap();
        assert_eq!(binary.borrow().sections().len(), 4);
    }

    #[test]
    fn test_context_exposes_checksum_and_executable() {
        let registry = registry("A:\n  result: \"compute_checksum() >= 0 and executable.size == 1024 or missing\"\n");
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert_eq!(report.applied, vec!["A"]);
    }

    #[test]
    fn test_items_can_call_each_other_by_name() {
        let registry = registry(
            "Grow:\n  result: add_section('.grow', b'xy')\n  apply: false\nUseGrow:\n  result: Grow(parser=parser)\n",
        );
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert_eq!(report.applied, vec!["UseGrow"]);
        assert!(report.failures.is_empty());
        assert_eq!(parser.builds.get(), 1);
        let names: Vec<String> = report.binary.unwrap().borrow().sections().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec![".text", ".data", ".rsrc", ".grow"]);
    }

    #[test]
    fn test_caller_bindings_shadow_item_names() {
        let registry = registry("Grow:\n  result: add_section('.grow', b'xy')\n  apply: false\nUse:\n  result: Grow + 1\n");
        let parser = CountingParser::new();
        let options = PipelineOptions::default().bind("Grow", 41i64);
        let report = Pipeline::new(&registry, &parser).run(Some(&target()), &options).unwrap();
        assert_eq!(report.applied, vec!["Use"]);
        assert_eq!(report.binary.unwrap().borrow().sections().len(), 3);
    }

    #[test]
    fn test_self_calling_item_fails_instead_of_overflowing() {
        let registry = registry("Loop:\n  result: Loop()\n");
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert!(report.applied.is_empty());
        assert!(report.failures[0].1.contains("recursion"));
    }

    #[test]
    fn test_loop_threads_the_parser() {
        let mut fields = ConfigMap::new();
        fields.insert("result".into(), ConfigValue::from("append_to_section('.text', b'ab')"));
        fields.insert("loop".into(), ConfigValue::Int(2));
        let mut entries = ConfigMap::new();
        entries.insert("L".into(), ConfigValue::Map(fields));
        let registry = RegistryBuilder::new(Family::Modifier)
            .build_from_tree(Path::new("memory"), ConfigTree::from(entries), &BaseSources::new())
            .unwrap();
        let parser = CountingParser::new();
        let report = Pipeline::new(&registry, &parser)
            .run(Some(&target()), &PipelineOptions::default())
            .unwrap();
        assert_eq!(report.applied, vec!["L"]);
        let text = report.binary.unwrap().borrow().sections().remove(0);
        assert_eq!(text.content.len(), 64 + 4);
    }
}
