// src/expression/interpreter.rs

use super::{
    EvalError,
    ast::{Comprehension, ComprehensionKind, Expr, LambdaDef, Pattern},
    builtins,
    value::{self, Args, Value, dict_insert},
};
use crate::{
    constants::{MAX_EXPRESSION_DEPTH, MAX_SEQUENCE_LENGTH},
    system::binary::BinaryHandle,
};
use indexmap::IndexMap;
use std::{cell::Cell, fmt, rc::Rc};

type EvalResult<T> = Result<T, EvalError>;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Tracks nested calls (lambdas and host-composed items); released on drop.
pub(crate) struct CallGuard;

impl CallGuard {
    pub(crate) fn enter() -> EvalResult<Self> {
        let depth = CALL_DEPTH.with(|d| {
            let next = d.get() + 1;
            d.set(next);
            next
        });
        let guard = Self;
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(EvalError::Value("maximum recursion depth exceeded".into()));
        }
        Ok(guard)
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Name bindings visible to an expression. Comprehensions and lambda calls
/// push a child scope on top of the one they were created in.
#[derive(Debug)]
pub(crate) struct Scope {
    vars: IndexMap<String, Value>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub(crate) fn root(vars: IndexMap<String, Value>) -> Rc<Self> {
        Rc::new(Self { vars, parent: None })
    }

    fn child(parent: &Rc<Self>, vars: IndexMap<String, Value>) -> Rc<Self> {
        Rc::new(Self {
            vars,
            parent: Some(Rc::clone(parent)),
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(value) = current.vars.get(name) {
                return Some(value.clone());
            }
            scope = current.parent.as_deref();
        }
        None
    }
}

/// A lambda together with the scope it was created in.
#[derive(Clone)]
pub struct Closure {
    def: Rc<LambdaDef>,
    defaults: Vec<Option<Value>>,
    scope: Rc<Scope>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<&str> = self.def.params.iter().map(|p| p.name.as_str()).collect();
        write!(f, "<lambda({})>", params.join(", "))
    }
}

impl Closure {
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.def, &other.def) && Rc::ptr_eq(&self.scope, &other.scope)
    }

    /// Binds `args` to the parameters and evaluates the body.
    pub fn call(&self, args: Args) -> EvalResult<Value> {
        let _guard = CallGuard::enter()?;
        let params = &self.def.params;
        if args.positional.len() > params.len() {
            return Err(EvalError::Type(format!(
                "<lambda>() takes {} positional arguments but {} were given",
                params.len(),
                args.positional.len()
            )));
        }
        if let Some(unknown) = args.keywords.keys().find(|k| !params.iter().any(|p| &p.name == *k)) {
            return Err(EvalError::Type(format!(
                "<lambda>() got an unexpected keyword argument '{}'",
                unknown
            )));
        }

        let mut vars = IndexMap::new();
        for (i, param) in params.iter().enumerate() {
            let value = match (args.positional.get(i), args.keywords.get(&param.name)) {
                (Some(_), Some(_)) => {
                    return Err(EvalError::Type(format!(
                        "<lambda>() got multiple values for argument '{}'",
                        param.name
                    )));
                }
                (Some(v), None) | (None, Some(v)) => v.clone(),
                (None, None) => match self.defaults.get(i) {
                    Some(Some(default)) => default.clone(),
                    _ => {
                        return Err(EvalError::Type(format!(
                            "<lambda>() missing required argument: '{}'",
                            param.name
                        )));
                    }
                },
            };
            vars.insert(param.name.clone(), value);
        }
        eval(&self.def.body, &Scope::child(&self.scope, vars))
    }
}

pub(crate) fn eval(expr: &Expr, scope: &Rc<Scope>) -> EvalResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => scope.lookup(name).ok_or_else(|| EvalError::Unbound(name.clone())),
        Expr::List(items) => Ok(Value::List(eval_all(items, scope)?)),
        Expr::Tuple(items) => Ok(Value::Tuple(eval_all(items, scope)?)),
        Expr::Dict(pairs) => {
            let mut dict = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                dict_insert(&mut dict, eval(k, scope)?, eval(v, scope)?)?;
            }
            Ok(Value::Dict(dict))
        }
        Expr::Unary(op, operand) => value::unary_op(*op, &eval(operand, scope)?),
        Expr::Binary(left, op, right) => value::binary_op(*op, &eval(left, scope)?, &eval(right, scope)?),
        Expr::And(left, right) => {
            let left = eval(left, scope)?;
            if left.truthy() { eval(right, scope) } else { Ok(left) }
        }
        Expr::Or(left, right) => {
            let left = eval(left, scope)?;
            if left.truthy() { Ok(left) } else { eval(right, scope) }
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first, scope)?;
            for (op, operand) in rest {
                let right = eval(operand, scope)?;
                if !value::compare_op(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::IfElse { test, body, orelse } => {
            if eval(test, scope)?.truthy() {
                eval(body, scope)
            } else {
                eval(orelse, scope)
            }
        }
        Expr::Lambda(def) => {
            let defaults = def
                .params
                .iter()
                .map(|p| p.default.as_ref().map(|d| eval(d, scope)).transpose())
                .collect::<EvalResult<Vec<_>>>()?;
            Ok(Value::Lambda(Closure {
                def: Rc::clone(def),
                defaults,
                scope: Rc::clone(scope),
            }))
        }
        Expr::Call { func, args, keywords } => {
            let callee = eval(func, scope)?;
            let mut call_args = Args::new(eval_all(args, scope)?);
            for (name, value) in keywords {
                call_args.keywords.insert(name.clone(), eval(value, scope)?);
            }
            callee.call(call_args)
        }
        Expr::Attribute(target, name) => attribute(&eval(target, scope)?, name),
        Expr::Subscript(target, index) => {
            let target = eval(target, scope)?;
            match index.as_ref() {
                Expr::Slice(start, stop, step) => {
                    let bound = |b: &Option<Box<Expr>>| b.as_ref().map_or(Ok(Value::None), |e| eval(e, scope));
                    target.slice(&bound(start)?, &bound(stop)?, &bound(step)?)
                }
                other => target.get_item(&eval(other, scope)?),
            }
        }
        Expr::Slice(..) => Err(EvalError::Type("slice outside of a subscript".into())),
        Expr::Comprehension(comp) => comprehension(comp, scope),
    }
}

fn eval_all(items: &[Expr], scope: &Rc<Scope>) -> EvalResult<Vec<Value>> {
    items.iter().map(|e| eval(e, scope)).collect()
}

/// `obj.name`: dict keys first, then binary attributes, then methods.
fn attribute(target: &Value, name: &str) -> EvalResult<Value> {
    if let Value::Dict(pairs) = target
        && let Some(v) = value::dict_get(pairs, &Value::from(name))
    {
        return Ok(v.clone());
    }
    if let Value::Binary(handle) = target
        && let Some(v) = binary_attribute(handle, name)
    {
        return Ok(v);
    }
    builtins::bound_method(target, name).ok_or_else(|| {
        EvalError::Attribute(format!("'{}' object has no attribute '{}'", target.type_name(), name))
    })
}

fn binary_attribute(handle: &BinaryHandle, name: &str) -> Option<Value> {
    let binary = handle.try_borrow().ok()?;
    match name {
        "sections" => Some(Value::List(binary.sections().iter().map(Value::from).collect())),
        "format" => Some(Value::from(binary.format())),
        "path" => Some(Value::from(binary.path().display().to_string())),
        "checksum" => Some(Value::Int(i64::from(binary.compute_checksum()))),
        _ => None,
    }
}

fn bind_pattern(pattern: &Pattern, value: Value, vars: &mut IndexMap<String, Value>) -> EvalResult<()> {
    match pattern {
        Pattern::Name(name) => {
            vars.insert(name.clone(), value);
            Ok(())
        }
        Pattern::Tuple(targets) => {
            let items = value.iterate()?;
            if items.len() != targets.len() {
                return Err(EvalError::Value(format!(
                    "cannot unpack {} values into {} targets",
                    items.len(),
                    targets.len()
                )));
            }
            for (target, item) in targets.iter().zip(items) {
                bind_pattern(target, item, vars)?;
            }
            Ok(())
        }
    }
}

fn comprehension(comp: &Comprehension, scope: &Rc<Scope>) -> EvalResult<Value> {
    let mut items = Vec::new();
    let mut pairs = Vec::new();
    walk_clauses(comp, 0, scope, &mut |inner| {
        match (&comp.kind, &comp.value) {
            (ComprehensionKind::Dict, Some(value)) => dict_insert(&mut pairs, eval(&comp.element, inner)?, eval(value, inner)?)?,
            _ => items.push(eval(&comp.element, inner)?),
        }
        if items.len() + pairs.len() > MAX_SEQUENCE_LENGTH {
            return Err(EvalError::Value("comprehension produces too many items".into()));
        }
        Ok(())
    })?;
    Ok(match comp.kind {
        ComprehensionKind::Dict => Value::Dict(pairs),
        ComprehensionKind::List | ComprehensionKind::Generator => Value::List(items),
    })
}

fn walk_clauses(
    comp: &Comprehension,
    index: usize,
    scope: &Rc<Scope>,
    sink: &mut dyn FnMut(&Rc<Scope>) -> EvalResult<()>,
) -> EvalResult<()> {
    let Some(clause) = comp.clauses.get(index) else {
        return sink(scope);
    };
    for item in eval(&clause.iter, scope)?.iterate()? {
        let mut vars = IndexMap::new();
        bind_pattern(&clause.target, item, &mut vars)?;
        let inner = Scope::child(scope, vars);
        let mut keep = true;
        for condition in &clause.conditions {
            if !eval(condition, &inner)?.truthy() {
                keep = false;
                break;
            }
        }
        if keep {
            walk_clauses(comp, index + 1, &inner, sink)?;
        }
    }
    Ok(())
}
