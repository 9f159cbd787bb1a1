// src/expression/value.rs

use super::{
    EvalError,
    ast::{BinOp, CmpOp, UnaryOp},
    interpreter::Closure,
};
use crate::{
    constants::MAX_SEQUENCE_LENGTH,
    models::ConfigValue,
    system::binary::{BinaryHandle, Section},
};
use indexmap::IndexMap;
use std::{cmp::Ordering, fmt, rc::Rc};

type EvalResult<T> = Result<T, EvalError>;

/// Signature of every host function reachable from an expression.
pub type NativeFn = dyn Fn(Args) -> EvalResult<Value>;

/// A named host function.
#[derive(Clone)]
pub struct Function {
    name: String,
    func: Rc<NativeFn>,
}

impl Function {
    /// Wraps a host closure under a display name.
    pub fn new(name: impl Into<String>, func: impl Fn(Args) -> EvalResult<Value> + 'static) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    /// Name shown in errors and `repr()`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the host closure.
    pub fn call(&self, args: Args) -> EvalResult<Value> {
        (self.func)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// Call arguments: positional values then keyword values.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Positional arguments, in call order.
    pub positional: Vec<Value>,
    /// Keyword arguments, in call order.
    pub keywords: IndexMap<String, Value>,
}

impl Args {
    /// Positional arguments only.
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: IndexMap::new(),
        }
    }

    /// Adds a keyword argument.
    pub fn keyword(mut self, name: impl Into<String>, value: Value) -> Self {
        self.keywords.insert(name.into(), value);
        self
    }

    /// Looks an argument up by position first, then by keyword.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.keywords.get(name))
    }

    /// Like [`Args::get`], but a missing argument is a `TypeError`.
    pub fn require(&self, index: usize, name: &str, func: &str) -> EvalResult<&Value> {
        self.get(index, name)
            .ok_or_else(|| EvalError::Type(format!("{}() missing required argument: '{}'", func, name)))
    }

    /// Whether no argument was passed at all.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }
}

/// A runtime value of the expression language.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// `None`.
    #[default]
    None,
    /// `True` / `False`.
    Bool(bool),
    /// A 64-bit integer; overflow is an error.
    Int(i64),
    /// A double-precision float.
    Float(f64),
    /// A text string.
    Str(String),
    /// A byte string.
    Bytes(Vec<u8>),
    /// A list.
    List(Vec<Value>),
    /// A tuple.
    Tuple(Vec<Value>),
    /// Insertion-ordered pairs; keys are compared by value.
    Dict(Vec<(Value, Value)>),
    /// A host function.
    Function(Function),
    /// A lambda together with the scope it was created in.
    Lambda(Closure),
    /// A live binary, passed around as `parser`.
    Binary(BinaryHandle),
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Value {
    /// Shorthand for a [`Value::Function`].
    pub fn function(name: &str, func: impl Fn(Args) -> EvalResult<Value> + 'static) -> Self {
        Self::Function(Function::new(name, func))
    }

    /// Builds a dict with string keys.
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| (Self::Str(k.into()), v))
                .collect(),
        )
    }

    /// Type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Function(_) => "builtin_function_or_method",
            Self::Lambda(_) => "function",
            Self::Binary(_) => "binary",
        }
    }

    /// Truth value, as tested by `if`, `and`, `or` and `not`.
    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(x) => *x != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::List(l) | Self::Tuple(l) => !l.is_empty(),
            Self::Dict(d) => !d.is_empty(),
            Self::Function(_) | Self::Lambda(_) | Self::Binary(_) => true,
        }
    }

    /// Whether this is `None`.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Whether the value can be called.
    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Function(_) | Self::Lambda(_))
    }

    /// The integer (booleans count as 0/1).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as a float, if numeric.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            other => other.as_int().map(|i| i as f64),
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    fn as_num(&self) -> Option<Num> {
        match self {
            Self::Float(x) => Some(Num::Float(*x)),
            other => other.as_int().map(Num::Int),
        }
    }

    /// Length as reported by `len()`; strings count characters.
    pub fn len(&self) -> EvalResult<usize> {
        match self {
            Self::Str(s) => Ok(s.chars().count()),
            Self::Bytes(b) => Ok(b.len()),
            Self::List(l) | Self::Tuple(l) => Ok(l.len()),
            Self::Dict(d) => Ok(d.len()),
            other => Err(EvalError::Type(format!("object of type '{}' has no len()", other.type_name()))),
        }
    }

    /// Materializes the items an iteration over this value would yield.
    pub fn iterate(&self) -> EvalResult<Vec<Value>> {
        match self {
            Self::List(l) | Self::Tuple(l) => Ok(l.clone()),
            Self::Str(s) => Ok(s.chars().map(|c| Self::Str(c.to_string())).collect()),
            Self::Bytes(b) => Ok(b.iter().map(|x| Self::Int(i64::from(*x))).collect()),
            Self::Dict(d) => Ok(d.iter().map(|(k, _)| k.clone()).collect()),
            other => Err(EvalError::Type(format!("'{}' object is not iterable", other.type_name()))),
        }
    }

    /// Calls a function or lambda.
    pub fn call(&self, args: Args) -> EvalResult<Value> {
        match self {
            Self::Function(f) => f.call(args),
            Self::Lambda(c) => c.call(args),
            other => Err(EvalError::Type(format!("'{}' object is not callable", other.type_name()))),
        }
    }

    /// The `in` operator.
    pub fn contains(&self, item: &Value) -> EvalResult<bool> {
        match (self, item) {
            (Self::Str(haystack), Self::Str(needle)) => Ok(haystack.contains(needle.as_str())),
            (Self::Str(_), other) => Err(EvalError::Type(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
            (Self::Bytes(haystack), Self::Bytes(needle)) => {
                Ok(needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle.as_slice()))
            }
            (Self::Bytes(haystack), other) => match other.as_int() {
                Some(i) => Ok(u8::try_from(i).is_ok_and(|b| haystack.contains(&b))),
                None => Err(EvalError::Type("a bytes-like object is required".into())),
            },
            (Self::List(l) | Self::Tuple(l), _) => Ok(l.iter().any(|v| v == item)),
            (Self::Dict(d), _) => Ok(dict_get(d, item).is_some()),
            (other, _) => Err(EvalError::Type(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Subscription with an index or a key.
    pub fn get_item(&self, key: &Value) -> EvalResult<Value> {
        match self {
            Self::Dict(d) => dict_get(d, key)
                .cloned()
                .ok_or_else(|| EvalError::Key(key.repr())),
            Self::List(_) | Self::Tuple(_) | Self::Str(_) | Self::Bytes(_) => {
                let index = key.as_int().ok_or_else(|| {
                    EvalError::Type(format!(
                        "{} indices must be integers, not {}",
                        self.type_name(),
                        key.type_name()
                    ))
                })?;
                let len = self.len()?;
                let position = normalize_index(index, len)
                    .ok_or_else(|| EvalError::Index(format!("{} index out of range", self.type_name())))?;
                let item = match self {
                    Self::List(l) | Self::Tuple(l) => l.get(position).cloned(),
                    Self::Str(s) => s.chars().nth(position).map(|c| Self::Str(c.to_string())),
                    Self::Bytes(b) => b.get(position).map(|x| Self::Int(i64::from(*x))),
                    _ => None,
                };
                item.ok_or_else(|| EvalError::Index(format!("{} index out of range", self.type_name())))
            }
            other => Err(EvalError::Type(format!("'{}' object is not subscriptable", other.type_name()))),
        }
    }

    /// Subscription with a slice; out-of-range bounds are clamped.
    pub fn slice(&self, start: &Value, stop: &Value, step: &Value) -> EvalResult<Value> {
        let bound = |v: &Value| -> EvalResult<Option<i64>> {
            match v {
                Self::None => Ok(None),
                other => other
                    .as_int()
                    .map(Some)
                    .ok_or_else(|| EvalError::Type("slice indices must be integers or None".into())),
            }
        };
        let indices = slice_indices(self.len()?, bound(start)?, bound(stop)?, bound(step)?)?;
        Ok(match self {
            Self::List(l) => Self::List(indices.iter().filter_map(|&i| l.get(i).cloned()).collect()),
            Self::Tuple(l) => Self::Tuple(indices.iter().filter_map(|&i| l.get(i).cloned()).collect()),
            Self::Bytes(b) => Self::Bytes(indices.iter().filter_map(|&i| b.get(i).copied()).collect()),
            Self::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Self::Str(indices.iter().filter_map(|&i| chars.get(i)).collect())
            }
            other => {
                return Err(EvalError::Type(format!("'{}' object is not subscriptable", other.type_name())));
            }
        })
    }

    /// Ordering used by `<`, `sorted`, `min` and `max`.
    pub fn compare(&self, other: &Value) -> EvalResult<Ordering> {
        match (self.as_num(), other.as_num()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => return Ok(a.cmp(&b)),
            (Some(a), Some(b)) => {
                let (a, b) = (num_to_f64(a), num_to_f64(b));
                return Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal));
            }
            _ => {}
        }
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Ok(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Ok(a.cmp(b)),
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    if x != y {
                        return x.compare(y);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => Err(EvalError::Type(format!(
                "'<' not supported between instances of '{}' and '{}'",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// Python `repr()`.
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => repr_str(s),
            Self::Bytes(b) => repr_bytes(b),
            other => other.to_string(),
        }
    }

    /// Converts back into a configuration value (used for exports).
    pub fn to_config(&self) -> ConfigValue {
        match self {
            Self::None => ConfigValue::Null,
            Self::Bool(b) => ConfigValue::Bool(*b),
            Self::Int(i) => ConfigValue::Int(*i),
            Self::Float(x) => ConfigValue::Float(*x),
            Self::Str(s) => ConfigValue::Str(s.clone()),
            Self::List(l) | Self::Tuple(l) => ConfigValue::List(l.iter().map(Self::to_config).collect()),
            Self::Dict(d) => ConfigValue::Map(d.iter().map(|(k, v)| (k.to_string(), v.to_config())).collect()),
            other => ConfigValue::Str(other.repr()),
        }
    }
}

fn num_to_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(x) => x,
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> EvalResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(EvalError::Value("slice step cannot be zero".into()));
    }
    let len = i64::try_from(len).map_err(|_| EvalError::Value("sequence is too long".into()))?;
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let clamp = |bound: Option<i64>, default: i64| match bound {
        None => default,
        Some(b) if b < 0 => (b + len).max(lower),
        Some(b) => b.min(upper),
    };
    let start = clamp(start, if step > 0 { lower } else { upper });
    let stop = clamp(stop, if step > 0 { upper } else { lower });

    let mut indices = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        if let Ok(index) = usize::try_from(i) {
            indices.push(index);
        }
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(indices)
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn repr_bytes(bytes: &[u8]) -> String {
    let mut out = String::from("b'");
    for b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(char::from(*b)),
            other => out.push_str(&format!("\\x{:02x}", other)),
        }
    }
    out.push('\'');
    out
}

fn format_float(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        (if x > 0.0 { "inf" } else { "-inf" }).to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

/// Python `str()`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |items: &[Value]| items.iter().map(Value::repr).collect::<Vec<_>>().join(", ");
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", format_float(*x)),
            Self::Str(s) => write!(f, "{}", s),
            Self::Bytes(b) => write!(f, "{}", repr_bytes(b)),
            Self::List(l) => write!(f, "[{}]", join(l)),
            Self::Tuple(l) if l.len() == 1 => write!(f, "({},)", join(l)),
            Self::Tuple(l) => write!(f, "({})", join(l)),
            Self::Dict(d) => {
                let parts: Vec<String> = d.iter().map(|(k, v)| format!("{}: {}", k.repr(), v.repr())).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Lambda(_) => write!(f, "<function <lambda>>"),
            Self::Binary(handle) => match handle.try_borrow() {
                Ok(binary) => write!(f, "<{} binary '{}'>", binary.format(), binary.path().display()),
                Err(_) => write!(f, "<binary>"),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_num(), other.as_num()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => return a == b,
            (Some(a), Some(b)) => return num_to_f64(a) == num_to_f64(b),
            _ => {}
        }
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| dict_get(b, k).is_some_and(|w| w == v))
            }
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(&a.func, &b.func),
            (Self::Lambda(a), Self::Lambda(b)) => a.same_as(b),
            (Self::Binary(a), Self::Binary(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// --- Dict helpers ---

pub fn dict_get<'a>(pairs: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

pub fn dict_insert(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) -> EvalResult<()> {
    if matches!(key, Value::List(_) | Value::Dict(_)) {
        return Err(EvalError::Type(format!("unhashable type: '{}'", key.type_name())));
    }
    match pairs.iter_mut().find(|(k, _)| *k == key) {
        Some((_, slot)) => *slot = value,
        None => pairs.push((key, value)),
    }
    Ok(())
}

// --- Operators ---

fn overflow() -> EvalError {
    EvalError::Value("integer overflow".into())
}

fn check_length(len: usize) -> EvalResult<()> {
    if len > MAX_SEQUENCE_LENGTH {
        return Err(EvalError::Value(format!(
            "sequence of {} items exceeds the limit of {}",
            len, MAX_SEQUENCE_LENGTH
        )));
    }
    Ok(())
}

fn repeat(seq: &Value, times: i64) -> EvalResult<Value> {
    let times = usize::try_from(times.max(0)).map_err(|_| overflow())?;
    check_length(seq.len()?.saturating_mul(times))?;
    Ok(match seq {
        Value::Str(s) => Value::Str(s.repeat(times)),
        Value::Bytes(b) => Value::Bytes(b.repeat(times)),
        Value::List(l) => Value::List(std::iter::repeat_n(l.iter().cloned(), times).flatten().collect()),
        Value::Tuple(l) => Value::Tuple(std::iter::repeat_n(l.iter().cloned(), times).flatten().collect()),
        other => return Err(EvalError::Type(format!("can't multiply sequence of type '{}'", other.type_name()))),
    })
}

fn floor_div(a: i64, b: i64) -> EvalResult<i64> {
    if b == 0 {
        return Err(EvalError::ZeroDivision("integer division or modulo by zero".into()));
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    Ok(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q })
}

fn py_mod(a: i64, b: i64) -> EvalResult<i64> {
    if b == 0 {
        return Err(EvalError::ZeroDivision("integer division or modulo by zero".into()));
    }
    let r = a.checked_rem(b).ok_or_else(overflow)?;
    Ok(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
}

fn int_op(op: BinOp, a: i64, b: i64) -> EvalResult<Value> {
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => return float_op(op, a as f64, b as f64),
        BinOp::FloorDiv => Some(floor_div(a, b)?),
        BinOp::Mod => Some(py_mod(a, b)?),
        BinOp::Pow => {
            if b < 0 {
                return float_op(op, a as f64, b as f64);
            }
            u32::try_from(b).ok().and_then(|e| a.checked_pow(e))
        }
        BinOp::BitOr => Some(a | b),
        BinOp::BitXor => Some(a ^ b),
        BinOp::BitAnd => Some(a & b),
        BinOp::LShift => {
            if b < 0 {
                return Err(EvalError::Value("negative shift count".into()));
            }
            match u32::try_from(b) {
                Ok(shift) if shift < 63 => a.checked_mul(1i64 << shift),
                _ if a == 0 => Some(0),
                _ => None,
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(EvalError::Value("negative shift count".into()));
            }
            match u32::try_from(b) {
                Ok(shift) if shift < 64 => Some(a >> shift),
                _ => Some(if a < 0 { -1 } else { 0 }),
            }
        }
    };
    result.map(Value::Int).ok_or_else(overflow)
}

fn float_op(op: BinOp, a: f64, b: f64) -> EvalResult<Value> {
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float division by zero".into()));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float floor division by zero".into()));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float modulo".into()));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::ZeroDivision("0.0 cannot be raised to a negative power".into()));
            }
            a.powf(b)
        }
        other => {
            return Err(EvalError::Type(format!(
                "unsupported operand type(s) for {}: 'float'",
                other.symbol()
            )));
        }
    };
    Ok(Value::Float(value))
}

pub(crate) fn binary_op(op: BinOp, left: &Value, right: &Value) -> EvalResult<Value> {
    if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
        match op {
            BinOp::BitOr => return Ok(Value::Bool(a | b)),
            BinOp::BitAnd => return Ok(Value::Bool(a & b)),
            BinOp::BitXor => return Ok(Value::Bool(a ^ b)),
            _ => {}
        }
    }
    match (left.as_num(), right.as_num()) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => return int_op(op, a, b),
        (Some(a), Some(b)) => return float_op(op, num_to_f64(a), num_to_f64(b)),
        _ => {}
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            check_length(a.len() + b.len())?;
            Ok(Value::Str(format!("{}{}", a, b)))
        }
        (BinOp::Add, Value::Bytes(a), Value::Bytes(b)) => {
            check_length(a.len() + b.len())?;
            Ok(Value::Bytes([a.as_slice(), b.as_slice()].concat()))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            check_length(a.len() + b.len())?;
            Ok(Value::List([a.as_slice(), b.as_slice()].concat()))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            check_length(a.len() + b.len())?;
            Ok(Value::Tuple([a.as_slice(), b.as_slice()].concat()))
        }
        (BinOp::Mul, seq, count) | (BinOp::Mul, count, seq)
            if count.as_int().is_some() && matches!(seq, Value::Str(_) | Value::Bytes(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            repeat(seq, count.as_int().unwrap_or_default())
        }
        (BinOp::BitOr, Value::Dict(a), Value::Dict(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                dict_insert(&mut merged, k.clone(), v.clone())?;
            }
            Ok(Value::Dict(merged))
        }
        _ => Err(EvalError::Type(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))),
    }
}

pub(crate) fn unary_op(op: UnaryOp, operand: &Value) -> EvalResult<Value> {
    match (op, operand) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
        (UnaryOp::Pos, Value::Float(x)) => Ok(Value::Float(*x)),
        (UnaryOp::Neg, v) if v.as_int().is_some() => v
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(overflow),
        (UnaryOp::Pos, v) if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or_default())),
        (UnaryOp::Invert, v) if v.as_int().is_some() => Ok(Value::Int(!v.as_int().unwrap_or_default())),
        (op, v) => {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Invert => "~",
                UnaryOp::Not => "not",
            };
            Err(EvalError::Type(format!("bad operand type for unary {}: '{}'", symbol, v.type_name())))
        }
    }
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Function(_), Value::Function(_))
        | (Value::Lambda(_), Value::Lambda(_))
        | (Value::Binary(_), Value::Binary(_)) => left == right,
        _ => false,
    }
}

pub(crate) fn compare_op(op: CmpOp, left: &Value, right: &Value) -> EvalResult<bool> {
    Ok(match op {
        CmpOp::Eq => left == right,
        CmpOp::NotEq => left != right,
        CmpOp::Lt => left.compare(right)? == Ordering::Less,
        CmpOp::LtE => left.compare(right)? != Ordering::Greater,
        CmpOp::Gt => left.compare(right)? == Ordering::Greater,
        CmpOp::GtE => left.compare(right)? != Ordering::Less,
        CmpOp::In => right.contains(left)?,
        CmpOp::NotIn => !right.contains(left)?,
        CmpOp::Is => identical(left, right),
        CmpOp::IsNot => !identical(left, right),
    })
}

// --- Conversions ---

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<&ConfigValue> for Value {
    fn from(value: &ConfigValue) -> Self {
        match value {
            ConfigValue::Null => Self::None,
            ConfigValue::Bool(b) => Self::Bool(*b),
            ConfigValue::Int(i) => Self::Int(*i),
            ConfigValue::Float(x) => Self::Float(*x),
            ConfigValue::Str(s) => Self::Str(s.clone()),
            ConfigValue::List(l) => Self::List(l.iter().map(Self::from).collect()),
            ConfigValue::Map(m) => Self::from_pairs(m.iter().map(|(k, v)| (k.clone(), Self::from(v)))),
        }
    }
}

impl From<&Section> for Value {
    fn from(section: &Section) -> Self {
        Self::from_pairs([
            ("name", Self::from(section.name.as_str())),
            ("offset", Self::from(section.offset)),
            ("size", Self::from(section.size)),
            ("virtual_size", Self::from(section.virtual_size)),
            ("characteristics", Self::Int(i64::from(section.characteristics))),
            ("entropy", Self::Float(section.entropy())),
            ("content", Self::Bytes(section.content.clone())),
        ])
    }
}

impl From<BinaryHandle> for Value {
    fn from(handle: BinaryHandle) -> Self {
        Self::Binary(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_crosses_types() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Str("1".into()), Value::Int(1));
    }

    #[test]
    fn test_python_division_semantics() {
        assert_eq!(binary_op(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binary_op(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(binary_op(BinOp::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Float(3.5));
        assert!(matches!(
            binary_op(BinOp::Mod, &Value::Int(1), &Value::Int(0)),
            Err(EvalError::ZeroDivision(_))
        ));
    }

    #[test]
    fn test_overflow_is_an_error_not_a_panic() {
        assert!(matches!(
            binary_op(BinOp::Pow, &Value::Int(10), &Value::Int(100)),
            Err(EvalError::Value(_))
        ));
        assert!(matches!(
            binary_op(BinOp::Mul, &Value::Str("ab".into()), &Value::Int(i64::MAX)),
            Err(EvalError::Value(_))
        ));
    }

    #[test]
    fn test_slices_follow_python_rules() {
        let list = Value::List((0..5).map(Value::Int).collect());
        let reversed = list.slice(&Value::None, &Value::None, &Value::Int(-1)).unwrap();
        assert_eq!(reversed, Value::List((0..5).rev().map(Value::Int).collect()));
        let middle = list.slice(&Value::Int(1), &Value::Int(-1), &Value::None).unwrap();
        assert_eq!(middle, Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        let text = Value::from("abcdef");
        assert_eq!(text.slice(&Value::Int(-3), &Value::Int(100), &Value::None).unwrap(), Value::from("def"));
    }

    #[test]
    fn test_huge_slice_steps_stop_instead_of_overflowing() {
        let text = Value::from("abc");
        assert_eq!(text.slice(&Value::Int(1), &Value::None, &Value::Int(i64::MAX)).unwrap(), Value::from("b"));
        assert_eq!(text.slice(&Value::Int(1), &Value::None, &Value::Int(i64::MIN)).unwrap(), Value::from("b"));
        let list = Value::List((0..3).map(Value::Int).collect());
        assert_eq!(
            list.slice(&Value::None, &Value::None, &Value::Int(i64::MIN + 1)).unwrap(),
            Value::List(vec![Value::Int(2)])
        );
    }

    #[test]
    fn test_list_and_tuple_repetition() {
        let list = Value::List(vec![Value::Int(1), Value::from("x")]);
        assert_eq!(
            binary_op(BinOp::Mul, &list, &Value::Int(2)).unwrap(),
            Value::List(vec![Value::Int(1), Value::from("x"), Value::Int(1), Value::from("x")])
        );
        let tuple = Value::Tuple(vec![Value::Int(7)]);
        assert_eq!(binary_op(BinOp::Mul, &Value::Int(3), &tuple).unwrap(), Value::Tuple(vec![Value::Int(7); 3]));
        assert_eq!(binary_op(BinOp::Mul, &list, &Value::Int(-1)).unwrap(), Value::List(Vec::new()));
    }

    #[test]
    fn test_concatenation_respects_the_sequence_limit() {
        let half = MAX_SEQUENCE_LENGTH / 2;
        let list = Value::List(vec![Value::Int(0); MAX_SEQUENCE_LENGTH]);
        assert!(matches!(
            binary_op(BinOp::Add, &list, &Value::List(vec![Value::Int(0)])),
            Err(EvalError::Value(_))
        ));
        let text = Value::Str("a".repeat(half + 1));
        assert!(matches!(binary_op(BinOp::Add, &text, &text), Err(EvalError::Value(_))));
        let bytes = Value::Bytes(vec![0x61; half + 1]);
        assert!(matches!(binary_op(BinOp::Add, &bytes, &bytes), Err(EvalError::Value(_))));
        let fits = Value::Str("a".repeat(half));
        assert_eq!(binary_op(BinOp::Add, &fits, &fits).unwrap().len().unwrap(), MAX_SEQUENCE_LENGTH);
    }

    #[test]
    fn test_negative_index_and_out_of_range() {
        let tuple = Value::Tuple(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(tuple.get_item(&Value::Int(-1)).unwrap(), Value::Int(2));
        assert!(matches!(tuple.get_item(&Value::Int(2)), Err(EvalError::Index(_))));
    }

    #[test]
    fn test_repr_and_str() {
        assert_eq!(Value::from("it's").repr(), "'it\\'s'");
        assert_eq!(Value::Bytes(vec![0x41, 0x00]).repr(), "b'A\\x00'");
        assert_eq!(Value::Tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
    }

    #[test]
    fn test_config_values_become_dicts() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("name: x\nsize: 3\n").unwrap();
        let value = Value::from(&ConfigValue::from(yaml));
        assert_eq!(value.get_item(&Value::from("size")).unwrap(), Value::Int(3));
    }
}
