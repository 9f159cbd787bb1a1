// src/expression/mod.rs

//! # Expression Evaluator
//!
//! A small, Python-flavoured expression language used by item `result`
//! fields. Sources are tokenized, parsed into an AST and interpreted against
//! a [`Context`] that only ever holds what the caller bound into it: there is
//! no access to the host process, the filesystem or any introspection hook.
//!
//! Disallowed syntax (dunder names, private attributes, statement keywords,
//! assignments, statement separators) is rejected while lexing or parsing,
//! with [`EvalError::Forbidden`], before a single node is evaluated.

mod ast;
mod builtins;
mod interpreter;
mod lexer;
mod parser;
mod value;

pub use builtins::PRINTABLE;
pub use interpreter::Closure;
pub(crate) use interpreter::CallGuard;
pub use value::{Args, Function, NativeFn, Value};

use indexmap::IndexMap;
use thiserror::Error;

/// Everything that can go wrong while compiling or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// A disallowed construct was found. Never downgraded, never silenced.
    #[error("Forbidden expression: {0}")]
    Forbidden(String),
    /// A name is not (yet) bound in the evaluation context.
    #[error("name '{0}' is not defined")]
    Unbound(String),
    /// The source does not parse.
    #[error("invalid syntax at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    /// An operation was applied to a value of the wrong type.
    #[error("TypeError: {0}")]
    Type(String),
    /// An argument has the right type but a bad value (also used for limits).
    #[error("ValueError: {0}")]
    Value(String),
    /// Division or modulo by zero.
    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(String),
    /// A sequence index is out of range.
    #[error("IndexError: {0}")]
    Index(String),
    /// A dictionary key is missing.
    #[error("KeyError: {0}")]
    Key(String),
    /// An attribute or method does not exist.
    #[error("AttributeError: {0}")]
    Attribute(String),
    /// A host function failed for a reason of its own (e.g. the binary
    /// refused a mutation).
    #[error("{function}() failed: {reason}")]
    Call { function: String, reason: String },
}

impl EvalError {
    /// Whether this is a security violation.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }

    /// Whether a name was missing from the context.
    pub fn is_unbound(&self) -> bool {
        matches!(self, Self::Unbound(_))
    }
}

/// A parsed expression, ready to be evaluated any number of times.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: ast::Expr,
}

impl Expression {
    /// The text the expression was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates against a snapshot of `context`.
    pub fn evaluate(&self, context: &Context) -> Result<Value, EvalError> {
        let scope = interpreter::Scope::root(context.bindings.clone());
        interpreter::eval(&self.ast, &scope)
    }
}

/// Parses `source`, rejecting forbidden constructs.
pub fn compile(source: &str) -> Result<Expression, EvalError> {
    let ast = parser::parse(source)?;
    Ok(Expression {
        source: source.to_string(),
        ast,
    })
}

/// The names visible to one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    bindings: IndexMap<String, Value>,
}

impl Context {
    /// An empty context: not even the safe functions are bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context holding the safe function table only.
    pub fn with_safe_functions() -> Self {
        Self {
            bindings: builtins::safe_table(),
        }
    }

    /// Binds (or rebinds) a name.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Owned variant of [`Context::bind`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind(name, value);
        self
    }

    /// Binds every pair, rebinding names already present.
    pub fn extend<K: Into<String>>(&mut self, bindings: impl IntoIterator<Item = (K, Value)>) {
        self.bindings
            .extend(bindings.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Bound names, in binding order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Compiles and evaluates `source` in one go.
    pub fn evaluate(&self, source: &str) -> Result<Value, EvalError> {
        compile(source)?.evaluate(self)
    }
}
