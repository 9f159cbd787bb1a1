// src/expression/builtins.rs

//! The fixed table of functions every expression can reach, plus the methods
//! of the built-in value types. Nothing here touches the filesystem, the
//! environment or the process.

use super::{
    EvalError,
    ast::BinOp,
    value::{Args, Value, binary_op, dict_get},
};
use crate::constants::{MAX_SEQUENCE_LENGTH, MAX_UNIQUE_BYTES};
use indexmap::IndexMap;
use rand::{Rng, seq::SliceRandom};
use std::cmp::Ordering;

type EvalResult<T> = Result<T, EvalError>;
type Builtin = fn(Args) -> EvalResult<Value>;

/// `string.printable`
pub const PRINTABLE: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ \t\n\r\x0b\x0c";

const RANDSTR_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const SAFE_FUNCTIONS: &[(&str, Builtin)] = &[
    // general purpose
    ("abs", abs),
    ("all", all),
    ("any", any),
    ("bool", to_bool),
    ("chr", chr),
    ("divmod", divmod),
    ("float", to_float),
    ("hex", hex),
    ("int", to_int),
    ("len", len),
    ("list", to_list),
    ("max", max),
    ("min", min),
    ("oct", oct),
    ("ord", ord),
    ("pow", pow),
    ("range", range),
    ("round", round),
    ("sorted", sorted),
    ("str", to_str),
    ("sum", sum),
    ("tuple", to_tuple),
    ("zip", zip),
    // randomness
    ("choice", choice),
    ("randint", randint),
    ("randrange", randrange),
    ("randstr", randstr),
    ("randbytes", randbytes),
    // item helpers
    ("apply", apply),
    ("concatn", concatn),
    ("repeatn", repeatn),
    ("select", select),
    ("select_section_name", select_section_name),
    ("size", size),
    ("value", value),
    ("zeropad", zeropad),
];

/// Builds the safe bindings every evaluation context starts from.
pub fn safe_table() -> IndexMap<String, Value> {
    let mut table: IndexMap<String, Value> = SAFE_FUNCTIONS
        .iter()
        .map(|(name, func)| (name.to_string(), Value::function(name, *func)))
        .collect();
    table.insert("printable".to_string(), Value::from(PRINTABLE));
    table
}

// --- Argument helpers ---

fn int_value(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

fn int_arg(args: &Args, index: usize, name: &str, func: &str) -> EvalResult<i64> {
    let value = args.require(index, name, func)?;
    value.as_int().ok_or_else(|| {
        EvalError::Type(format!(
            "{}() argument '{}' must be an integer, not '{}'",
            func,
            name,
            value.type_name()
        ))
    })
}

fn count_arg(args: &Args, index: usize, name: &str, func: &str) -> EvalResult<usize> {
    let n = int_arg(args, index, name, func)?;
    let n = usize::try_from(n).map_err(|_| EvalError::Value(format!("{}() argument '{}' must be >= 0", func, name)))?;
    if n > MAX_SEQUENCE_LENGTH {
        return Err(EvalError::Value(format!("{}() argument '{}' is too large", func, name)));
    }
    Ok(n)
}

/// Truncates toward zero, rejecting values `int` cannot hold.
#[allow(clippy::cast_possible_truncation)]
fn float_to_int(x: f64) -> EvalResult<i64> {
    if !x.is_finite() {
        return Err(EvalError::Value(format!("cannot convert float {} to integer", x)));
    }
    let truncated = x.trunc();
    if truncated.abs() >= 9.223_372_036_854_775_807e18 {
        return Err(EvalError::Value("integer overflow".into()));
    }
    Ok(truncated as i64)
}

fn random_index(len: usize) -> usize {
    rand::rng().random_range(0..len)
}

// --- General purpose ---

fn abs(args: Args) -> EvalResult<Value> {
    match args.require(0, "x", "abs")? {
        Value::Float(x) => Ok(Value::Float(x.abs())),
        v => v
            .as_int()
            .ok_or_else(|| EvalError::Type(format!("bad operand type for abs(): '{}'", v.type_name())))?
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| EvalError::Value("integer overflow".into())),
    }
}

fn all(args: Args) -> EvalResult<Value> {
    Ok(Value::Bool(args.require(0, "iterable", "all")?.iterate()?.iter().all(Value::truthy)))
}

fn any(args: Args) -> EvalResult<Value> {
    Ok(Value::Bool(args.require(0, "iterable", "any")?.iterate()?.iter().any(Value::truthy)))
}

fn to_bool(args: Args) -> EvalResult<Value> {
    Ok(Value::Bool(args.get(0, "x").is_some_and(Value::truthy)))
}

fn chr(args: Args) -> EvalResult<Value> {
    let code = int_arg(&args, 0, "i", "chr")?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::Str(c.to_string()))
        .ok_or_else(|| EvalError::Value("chr() arg not in range(0x110000)".into()))
}

fn divmod(args: Args) -> EvalResult<Value> {
    let a = args.require(0, "a", "divmod")?;
    let b = args.require(1, "b", "divmod")?;
    Ok(Value::Tuple(vec![
        binary_op(BinOp::FloorDiv, a, b)?,
        binary_op(BinOp::Mod, a, b)?,
    ]))
}

fn to_float(args: Args) -> EvalResult<Value> {
    let Some(value) = args.get(0, "x") else {
        return Ok(Value::Float(0.0));
    };
    if let Some(x) = value.as_float() {
        return Ok(Value::Float(x));
    }
    let Value::Str(text) = value else {
        return Err(EvalError::Type(format!(
            "float() argument must be a string or a number, not '{}'",
            value.type_name()
        )));
    };
    let trimmed = text.trim().replace('_', "");
    let parsed = match trimmed.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        other => other.parse::<f64>().ok(),
    };
    parsed
        .map(Value::Float)
        .ok_or_else(|| EvalError::Value(format!("could not convert string to float: '{}'", text)))
}

fn radix_repr(args: &Args, func: &str, prefix: &str, radix: u32) -> EvalResult<Value> {
    let n = int_arg(args, 0, "x", func)?;
    let magnitude = n.unsigned_abs();
    let digits = match radix {
        16 => format!("{:x}", magnitude),
        8 => format!("{:o}", magnitude),
        _ => format!("{:b}", magnitude),
    };
    let sign = if n < 0 { "-" } else { "" };
    Ok(Value::Str(format!("{}{}{}", sign, prefix, digits)))
}

fn hex(args: Args) -> EvalResult<Value> {
    radix_repr(&args, "hex", "0x", 16)
}

fn oct(args: Args) -> EvalResult<Value> {
    radix_repr(&args, "oct", "0o", 8)
}

fn to_int(args: Args) -> EvalResult<Value> {
    let Some(value) = args.get(0, "x") else {
        return Ok(Value::Int(0));
    };
    let base = args.get(1, "base").map(|b| b.as_int().unwrap_or(10)).unwrap_or(10);
    match value {
        Value::Float(x) => float_to_int(*x).map(Value::Int),
        Value::Str(text) => parse_int(text, base),
        other => other.as_int().map(Value::Int).ok_or_else(|| {
            EvalError::Type(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn parse_int(text: &str, base: i64) -> EvalResult<Value> {
    let invalid = || EvalError::Value(format!("invalid literal for int() with base {}: '{}'", base, text));
    let cleaned = text.trim().replace('_', "");
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest.to_string()),
        None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned).to_string()),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, digits) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, lower.get(2..).unwrap_or("")),
        (0 | 8, Some("0o")) => (8, lower.get(2..).unwrap_or("")),
        (0 | 2, Some("0b")) => (2, lower.get(2..).unwrap_or("")),
        (0, _) => (10, lower.as_str()),
        (b, _) => (u32::try_from(b).map_err(|_| invalid())?, lower.as_str()),
    };
    if !(2..=36).contains(&radix) || digits.is_empty() {
        return Err(invalid());
    }
    let magnitude = i64::from_str_radix(digits, radix).map_err(|_| invalid())?;
    Ok(Value::Int(if negative { -magnitude } else { magnitude }))
}

fn len(args: Args) -> EvalResult<Value> {
    Ok(int_value(args.require(0, "obj", "len")?.len()?))
}

fn to_list(args: Args) -> EvalResult<Value> {
    Ok(Value::List(match args.get(0, "iterable") {
        Some(v) => v.iterate()?,
        None => Vec::new(),
    }))
}

fn to_tuple(args: Args) -> EvalResult<Value> {
    Ok(Value::Tuple(match args.get(0, "iterable") {
        Some(v) => v.iterate()?,
        None => Vec::new(),
    }))
}

/// `min`/`max` skip `None` entries and return `None` when nothing is left.
fn extremum(args: &Args, func: &str, wanted: Ordering) -> EvalResult<Value> {
    let candidates = match args.positional.as_slice() {
        [] => return Err(EvalError::Type(format!("{}() expected at least 1 argument, got 0", func))),
        [single] => single.iterate()?,
        many => many.to_vec(),
    };
    let key = args.keywords.get("key").filter(|k| !k.is_none());
    let mut best: Option<(Value, Value)> = None;
    for item in candidates.into_iter().filter(|v| !v.is_none()) {
        let rank = match key {
            Some(f) => f.call(Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((_, best_rank)) => rank.compare(best_rank)? == wanted,
        };
        if replace {
            best = Some((item, rank));
        }
    }
    Ok(best
        .map(|(item, _)| item)
        .or_else(|| args.keywords.get("default").cloned())
        .unwrap_or_default())
}

fn max(args: Args) -> EvalResult<Value> {
    extremum(&args, "max", Ordering::Greater)
}

fn min(args: Args) -> EvalResult<Value> {
    extremum(&args, "min", Ordering::Less)
}

fn ord(args: Args) -> EvalResult<Value> {
    match args.require(0, "c", "ord")? {
        Value::Str(s) if s.chars().count() == 1 => Ok(Value::Int(s.chars().next().map(u32::from).map(i64::from).unwrap_or_default())),
        Value::Bytes(b) if b.len() == 1 => Ok(Value::Int(b.first().copied().map(i64::from).unwrap_or_default())),
        other => Err(EvalError::Type(format!(
            "ord() expected a character, but got '{}'",
            other.type_name()
        ))),
    }
}

fn pow(args: Args) -> EvalResult<Value> {
    let base = args.require(0, "base", "pow")?;
    let exp = args.require(1, "exp", "pow")?;
    let modulus = args.get(2, "mod").filter(|m| !m.is_none());
    let Some(modulus) = modulus else {
        return binary_op(BinOp::Pow, base, exp);
    };
    let (Some(b), Some(e), Some(m)) = (base.as_int(), exp.as_int(), modulus.as_int()) else {
        return Err(EvalError::Type("pow() 3rd argument not allowed unless all arguments are integers".into()));
    };
    if m == 0 {
        return Err(EvalError::Value("pow() 3rd argument cannot be 0".into()));
    }
    if e < 0 {
        return Err(EvalError::Value("pow() negative exponent with modulus is not supported".into()));
    }
    let m = i128::from(m);
    let mut result: i128 = 1;
    let mut b = i128::from(b).rem_euclid(m);
    let mut e = e;
    while e > 0 {
        if e & 1 == 1 {
            result = (result * b).rem_euclid(m);
        }
        b = (b * b).rem_euclid(m);
        e >>= 1;
    }
    // Python gives the result the sign of the modulus.
    let result = if m < 0 && result > 0 { result + m } else { result };
    i64::try_from(result)
        .map(Value::Int)
        .map_err(|_| EvalError::Value("integer overflow".into()))
}

fn range(args: Args) -> EvalResult<Value> {
    let (start, stop) = match args.positional.len() {
        0 => return Err(EvalError::Type("range expected at least 1 argument, got 0".into())),
        1 => (0, int_arg(&args, 0, "stop", "range")?),
        _ => (int_arg(&args, 0, "start", "range")?, int_arg(&args, 1, "stop", "range")?),
    };
    let step = match args.positional.get(2) {
        Some(_) => int_arg(&args, 2, "step", "range")?,
        None => 1,
    };
    if step == 0 {
        return Err(EvalError::Value("range() arg 3 must not be zero".into()));
    }
    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let step_abs = i128::from(step).abs();
    let count = if span <= 0 { 0 } else { (span + step_abs - 1) / step_abs };
    if count > i128::try_from(MAX_SEQUENCE_LENGTH).unwrap_or(i128::MAX) {
        return Err(EvalError::Value(format!("range() of {} items is too large", count)));
    }
    let mut items = Vec::new();
    let mut current = start;
    for _ in 0..count {
        items.push(Value::Int(current));
        current = current.saturating_add(step);
    }
    Ok(Value::List(items))
}

fn round(args: Args) -> EvalResult<Value> {
    let number = args.require(0, "number", "round")?;
    let ndigits = args.get(1, "ndigits").filter(|n| !n.is_none());
    match (number, ndigits) {
        (Value::Float(x), None) => float_to_int(x.round_ties_even()).map(Value::Int),
        (Value::Float(x), Some(n)) => {
            let digits = n
                .as_int()
                .ok_or_else(|| EvalError::Type("round() ndigits must be an integer".into()))?;
            let factor = 10f64.powi(i32::try_from(digits.clamp(-308, 308)).unwrap_or_default());
            Ok(Value::Float((x * factor).round_ties_even() / factor))
        }
        (v, _) => v
            .as_int()
            .map(Value::Int)
            .ok_or_else(|| EvalError::Type(format!("type {} doesn't define __round__ method", v.type_name()))),
    }
}

fn sorted(args: Args) -> EvalResult<Value> {
    let items = args.require(0, "iterable", "sorted")?.iterate()?;
    let key = args.keywords.get("key").filter(|k| !k.is_none());
    let reverse = args.keywords.get("reverse").is_some_and(Value::truthy);
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let rank = match key {
            Some(f) => f.call(Args::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        keyed.push((item, rank));
    }
    let mut failure = None;
    keyed.sort_by(|a, b| {
        let (left, right) = if reverse { (&b.1, &a.1) } else { (&a.1, &b.1) };
        left.compare(right).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(Value::List(keyed.into_iter().map(|(item, _)| item).collect())),
    }
}

fn to_str(args: Args) -> EvalResult<Value> {
    Ok(Value::Str(args.get(0, "object").map(Value::to_string).unwrap_or_default()))
}

fn sum(args: Args) -> EvalResult<Value> {
    let items = args.require(0, "iterable", "sum")?.iterate()?;
    let start = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
    items
        .iter()
        .try_fold(start, |acc, item| binary_op(BinOp::Add, &acc, item))
}

fn zip(args: Args) -> EvalResult<Value> {
    let columns = args
        .positional
        .iter()
        .map(Value::iterate)
        .collect::<EvalResult<Vec<_>>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::List(
        (0..rows)
            .map(|i| Value::Tuple(columns.iter().filter_map(|c| c.get(i).cloned()).collect()))
            .collect(),
    ))
}

// --- Randomness ---

fn pick(pool: Vec<Value>, error: bool) -> EvalResult<Value> {
    if pool.is_empty() {
        return if error {
            Err(EvalError::Index("cannot choose from an empty sequence".into()))
        } else {
            Ok(Value::None)
        };
    }
    let index = random_index(pool.len());
    Ok(pool.into_iter().nth(index).unwrap_or_default())
}

/// `choice(seq, exclusions=(), error=True)`
fn choice(args: Args) -> EvalResult<Value> {
    let items = args.require(0, "seq", "choice")?.iterate()?;
    let exclusions = as_list(args.get(1, "exclusions"))?;
    let error = args.get(2, "error").is_none_or(Value::truthy);
    pick(items.into_iter().filter(|v| !exclusions.contains(v)).collect(), error)
}

fn randint(args: Args) -> EvalResult<Value> {
    let a = int_arg(&args, 0, "a", "randint")?;
    let b = int_arg(&args, 1, "b", "randint")?;
    if a > b {
        return Err(EvalError::Value(format!("empty range for randint({}, {})", a, b)));
    }
    Ok(Value::Int(rand::rng().random_range(a..=b)))
}

fn randrange(args: Args) -> EvalResult<Value> {
    let (start, stop) = match args.get(1, "stop").filter(|v| !v.is_none()) {
        Some(_) => (int_arg(&args, 0, "start", "randrange")?, int_arg(&args, 1, "stop", "randrange")?),
        None => (0, int_arg(&args, 0, "start", "randrange")?),
    };
    let step = match args.get(2, "step") {
        Some(_) => int_arg(&args, 2, "step", "randrange")?,
        None => 1,
    };
    if step == 0 {
        return Err(EvalError::Value("zero step for randrange()".into()));
    }
    let span = i128::from(stop) - i128::from(start);
    let step = i128::from(step);
    let count = if step > 0 { (span + step - 1) / step } else { (span + step + 1) / step };
    if count <= 0 {
        return Err(EvalError::Value(format!("empty range for randrange({}, {})", start, stop)));
    }
    let k = rand::rng().random_range(0..count);
    i64::try_from(i128::from(start) + k * step)
        .map(Value::Int)
        .map_err(|_| EvalError::Value("integer overflow".into()))
}

/// `randstr(n=8, alphabet=letters+digits)`
fn randstr(args: Args) -> EvalResult<Value> {
    let n = match args.get(0, "n") {
        Some(_) => count_arg(&args, 0, "n", "randstr")?,
        None => 8,
    };
    let alphabet: Vec<char> = match args.get(1, "alphabet") {
        Some(Value::Str(s)) => s.chars().collect(),
        Some(other) => {
            return Err(EvalError::Type(format!(
                "randstr() alphabet must be a string, not '{}'",
                other.type_name()
            )));
        }
        None => RANDSTR_ALPHABET.chars().collect(),
    };
    if alphabet.is_empty() {
        return Err(EvalError::Value("randstr() alphabet cannot be empty".into()));
    }
    let mut rng = rand::rng();
    Ok(Value::Str(
        (0..n)
            .filter_map(|_| alphabet.get(rng.random_range(0..alphabet.len())))
            .collect(),
    ))
}

/// `randbytes(n, unique=True)`: with `unique`, no byte value repeats, hence
/// at most 256 bytes.
fn randbytes(args: Args) -> EvalResult<Value> {
    let n = count_arg(&args, 0, "n", "randbytes")?;
    let unique = args.get(1, "unique").is_none_or(Value::truthy);
    let mut rng = rand::rng();
    if !unique {
        return Ok(Value::Bytes((0..n).map(|_| rng.random::<u8>()).collect()));
    }
    if n > MAX_UNIQUE_BYTES {
        return Err(EvalError::Value(format!(
            "Cannot produce more than {} distinct bytes",
            MAX_UNIQUE_BYTES
        )));
    }
    let mut alphabet: Vec<u8> = (0..=u8::MAX).collect();
    alphabet.shuffle(&mut rng);
    alphabet.truncate(n);
    Ok(Value::Bytes(alphabet))
}

// --- Item helpers ---

/// `apply(f)(op)` builds `lambda *a, **kw: op(f(*a, **kw))`.
fn apply(args: Args) -> EvalResult<Value> {
    let inner = args.require(0, "f", "apply")?.clone();
    Ok(Value::function("apply.<wrapper>", move |wrapper_args: Args| {
        let op = wrapper_args.require(0, "op", "apply")?.clone();
        let inner = inner.clone();
        Ok(Value::function("apply.<composed>", move |call_args: Args| {
            let intermediate = inner.call(call_args)?;
            op.call(Args::new(vec![intermediate]))
        }))
    }))
}

/// `concatn(parts, n)`: concatenates sequences until `n` items are reached.
fn concatn(args: Args) -> EvalResult<Value> {
    let parts = args.require(0, "parts", "concatn")?.iterate()?;
    let n = count_arg(&args, 1, "n", "concatn")?;
    let mut acc: Option<Value> = None;
    for part in parts {
        if let Some(current) = &acc
            && current.len()? >= n
        {
            break;
        }
        acc = Some(match acc {
            None => part,
            Some(current) => binary_op(BinOp::Add, &current, &part)?,
        });
    }
    match acc {
        Some(value) => value.slice(&Value::None, &int_value(n), &Value::None),
        None => Ok(Value::List(Vec::new())),
    }
}

/// `repeatn(s, n)`: repeats `s` up to exactly `n` items.
fn repeatn(args: Args) -> EvalResult<Value> {
    let seq = args.require(0, "s", "repeatn")?;
    let n = count_arg(&args, 1, "n", "repeatn")?;
    let len = seq.len()?;
    if len == 0 {
        return Err(EvalError::Value("repeatn() cannot repeat an empty sequence".into()));
    }
    let whole = binary_op(BinOp::Mul, seq, &int_value(n / len))?;
    if n % len == 0 {
        return Ok(whole);
    }
    let rest = seq.slice(&Value::None, &int_value(n % len), &Value::None)?;
    binary_op(BinOp::Add, &whole, &rest)
}

/// `zeropad(n, value=0)` returns a function padding its argument up to `n` items.
fn zeropad(args: Args) -> EvalResult<Value> {
    let n = count_arg(&args, 0, "n", "zeropad")?;
    let fill = match args.get(1, "value") {
        Some(_) => int_arg(&args, 1, "value", "zeropad")?,
        None => 0,
    };
    Ok(Value::function("zeropad.<pad>", move |pad_args: Args| {
        let data = pad_args.require(0, "data", "zeropad")?;
        let missing = n.saturating_sub(data.len()?);
        Ok(match data {
            Value::Bytes(b) => {
                let byte = u8::try_from(fill).map_err(|_| EvalError::Value("zeropad() value must be in range(0, 256)".into()))?;
                Value::Bytes([b.as_slice(), vec![byte; missing].as_slice()].concat())
            }
            Value::Str(s) => {
                let c = u32::try_from(fill).ok().and_then(char::from_u32).unwrap_or('\0');
                Value::Str(format!("{}{}", s, c.to_string().repeat(missing)))
            }
            Value::List(l) => Value::List([l.as_slice(), vec![Value::Int(fill); missing].as_slice()].concat()),
            other => {
                return Err(EvalError::Type(format!("zeropad() cannot pad '{}'", other.type_name())));
            }
        })
    }))
}

fn as_list(value: Option<&Value>) -> EvalResult<Vec<Value>> {
    match value {
        None | Some(Value::None) => Ok(Vec::new()),
        Some(v) if v.is_callable() => v.call(Args::default())?.iterate(),
        Some(v @ (Value::List(_) | Value::Tuple(_) | Value::Dict(_))) => v.iterate(),
        Some(v) => Ok(vec![v.clone()]),
    }
}

fn section_name(value: &Value) -> Value {
    if let Value::Dict(pairs) = value {
        for key in ["real_name", "name"] {
            if let Some(name) = dict_get(pairs, &Value::from(key)) {
                return name.clone();
            }
        }
    }
    value.clone()
}

/// Returns the first entry of `lst` allowed by the inclusions and exclusions,
/// else a random entry of `random_lst` that is not excluded (or `None`).
fn select_with(args: &Args, mapper: Option<fn(&Value) -> Value>) -> EvalResult<Value> {
    let map = |items: Vec<Value>| -> Vec<Value> {
        match mapper {
            Some(f) => items.iter().map(f).collect(),
            None => items,
        }
    };
    let lst = map(as_list(args.get(0, "lst"))?);
    let random_lst = map(as_list(args.get(1, "random_lst"))?);
    let mut inclusions = map(as_list(args.get(2, "inclusions"))?);
    let exclusions = map(as_list(args.get(3, "exclusions"))?);
    if inclusions.is_empty() {
        inclusions = [lst.as_slice(), random_lst.as_slice()].concat();
    }
    if let Some(first) = lst
        .iter()
        .find(|x| !exclusions.contains(x) && inclusions.contains(x))
    {
        return Ok(first.clone());
    }
    pick(
        random_lst.into_iter().filter(|x| !exclusions.contains(x)).collect(),
        false,
    )
}

fn select(args: Args) -> EvalResult<Value> {
    select_with(&args, None)
}

fn select_section_name(args: Args) -> EvalResult<Value> {
    select_with(&args, Some(section_name))
}

/// `size(exe, ratio=0.1, blocksize=512)`: a block-aligned fraction of the
/// executable size.
fn size(args: Args) -> EvalResult<Value> {
    let exe = args.require(0, "exe", "size")?;
    let total: f64 = match exe {
        Value::Binary(handle) => {
            let binary = handle
                .try_borrow()
                .map_err(|_| EvalError::Value("binary is busy".into()))?;
            binary.sections().iter().map(|s| s.size as f64).sum()
        }
        other => other
            .get_item(&Value::from("size"))?
            .as_float()
            .ok_or_else(|| EvalError::Type("size() expects a numeric 'size' field".into()))?,
    };
    let ratio = args.get(1, "ratio").and_then(Value::as_float).unwrap_or(0.1);
    let blocksize = args.get(2, "blocksize").and_then(Value::as_int).unwrap_or(512);
    if blocksize <= 0 {
        return Err(EvalError::Value("size() blocksize must be positive".into()));
    }
    let scaled = (total * ratio).trunc();
    let blocks = float_to_int((scaled / blocksize as f64 + 0.5).round_ties_even())?;
    blocks
        .checked_mul(blocksize)
        .map(Value::Int)
        .ok_or_else(|| EvalError::Value("integer overflow".into()))
}

/// `value(o)` unwraps `{value: ...}` wrappers.
fn value(args: Args) -> EvalResult<Value> {
    let wrapped = args.require(0, "o", "value")?;
    if let Value::Dict(pairs) = wrapped
        && let Some(inner) = dict_get(pairs, &Value::from("value"))
    {
        return Ok(inner.clone());
    }
    Ok(wrapped.clone())
}

// --- Methods of built-in types ---

const STR_METHODS: &[&str] = &[
    "lower", "upper", "strip", "lstrip", "rstrip", "startswith", "endswith", "split", "join", "replace", "encode",
    "find", "count", "zfill", "isdigit",
];
const BYTES_METHODS: &[&str] = &["decode", "hex", "startswith", "endswith"];
const SEQUENCE_METHODS: &[&str] = &["index", "count"];
const DICT_METHODS: &[&str] = &["keys", "values", "items", "get"];

/// Binds `target.name(...)` for the methods the built-in types expose.
pub(crate) fn bound_method(target: &Value, name: &str) -> Option<Value> {
    let known = match target {
        Value::Str(_) => STR_METHODS,
        Value::Bytes(_) => BYTES_METHODS,
        Value::List(_) | Value::Tuple(_) => SEQUENCE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        _ => &[],
    };
    if !known.contains(&name) {
        return None;
    }
    let receiver = target.clone();
    let method = name.to_string();
    Some(Value::function(name, move |args| call_method(&receiver, &method, &args)))
}

fn str_arg(args: &Args, index: usize, name: &str, func: &str) -> EvalResult<String> {
    match args.require(index, name, func)? {
        Value::Str(s) => Ok(s.clone()),
        other => Err(EvalError::Type(format!(
            "{}() argument must be str, not '{}'",
            func,
            other.type_name()
        ))),
    }
}

fn affix_matches(args: &Args, func: &str, test: impl Fn(&Value) -> EvalResult<bool>) -> EvalResult<Value> {
    match args.require(0, "prefix", func)? {
        Value::Tuple(options) => {
            for option in options {
                if test(option)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        single => test(single).map(Value::Bool),
    }
}

fn call_method(receiver: &Value, method: &str, args: &Args) -> EvalResult<Value> {
    match (receiver, method) {
        (Value::Str(s), _) => str_method(s, method, args),
        (Value::Bytes(b), "decode") => String::from_utf8(b.clone())
            .map(Value::Str)
            .map_err(|e| EvalError::Value(format!("'utf-8' codec can't decode bytes: {}", e))),
        (Value::Bytes(b), "hex") => Ok(Value::Str(b.iter().map(|x| format!("{:02x}", x)).collect())),
        (Value::Bytes(b), "startswith" | "endswith") => affix_matches(args, method, |v| match v {
            Value::Bytes(affix) if method == "startswith" => Ok(b.starts_with(affix)),
            Value::Bytes(affix) => Ok(b.ends_with(affix)),
            other => Err(EvalError::Type(format!("expected bytes, not '{}'", other.type_name()))),
        }),
        (Value::List(items) | Value::Tuple(items), "index") => {
            let needle = args.require(0, "value", "index")?;
            items
                .iter()
                .position(|v| v == needle)
                .map(int_value)
                .ok_or_else(|| EvalError::Value(format!("{} is not in {}", needle.repr(), receiver.type_name())))
        }
        (Value::List(items) | Value::Tuple(items), "count") => {
            let needle = args.require(0, "value", "count")?;
            Ok(int_value(items.iter().filter(|v| *v == needle).count()))
        }
        (Value::Dict(pairs), "keys") => Ok(Value::List(pairs.iter().map(|(k, _)| k.clone()).collect())),
        (Value::Dict(pairs), "values") => Ok(Value::List(pairs.iter().map(|(_, v)| v.clone()).collect())),
        (Value::Dict(pairs), "items") => Ok(Value::List(
            pairs
                .iter()
                .map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()]))
                .collect(),
        )),
        (Value::Dict(pairs), "get") => {
            let key = args.require(0, "key", "get")?;
            Ok(dict_get(pairs, key)
                .cloned()
                .or_else(|| args.get(1, "default").cloned())
                .unwrap_or_default())
        }
        _ => Err(EvalError::Attribute(format!(
            "'{}' object has no attribute '{}'",
            receiver.type_name(),
            method
        ))),
    }
}

fn str_method(s: &str, method: &str, args: &Args) -> EvalResult<Value> {
    let strip_set = |index: usize| -> EvalResult<Option<Vec<char>>> {
        match args.get(index, "chars") {
            None | Some(Value::None) => Ok(None),
            Some(Value::Str(chars)) => Ok(Some(chars.chars().collect())),
            Some(other) => Err(EvalError::Type(format!(
                "strip arg must be None or str, not '{}'",
                other.type_name()
            ))),
        }
    };
    Ok(match method {
        "lower" => Value::Str(s.to_lowercase()),
        "upper" => Value::Str(s.to_uppercase()),
        "strip" | "lstrip" | "rstrip" => {
            let set = strip_set(0)?;
            let matcher = |c: char| match &set {
                Some(chars) => chars.contains(&c),
                None => c.is_whitespace(),
            };
            Value::Str(
                match method {
                    "lstrip" => s.trim_start_matches(matcher),
                    "rstrip" => s.trim_end_matches(matcher),
                    _ => s.trim_matches(matcher),
                }
                .to_string(),
            )
        }
        "startswith" | "endswith" => {
            return affix_matches(args, method, |v| match v {
                Value::Str(affix) if method == "startswith" => Ok(s.starts_with(affix.as_str())),
                Value::Str(affix) => Ok(s.ends_with(affix.as_str())),
                other => Err(EvalError::Type(format!("expected str, not '{}'", other.type_name()))),
            });
        }
        "split" => {
            let maxsplit = args.get(1, "maxsplit").and_then(Value::as_int).unwrap_or(-1);
            let parts: Vec<String> = match args.get(0, "sep") {
                None | Some(Value::None) => {
                    let words = s.split_whitespace().map(str::to_string);
                    match usize::try_from(maxsplit) {
                        Ok(limit) => {
                            let mut out: Vec<String> = Vec::new();
                            let mut rest = s.trim_start();
                            while out.len() < limit {
                                match rest.find(char::is_whitespace) {
                                    Some(pos) => {
                                        out.push(rest.get(..pos).unwrap_or("").to_string());
                                        rest = rest.get(pos..).unwrap_or("").trim_start();
                                    }
                                    None => break,
                                }
                            }
                            if !rest.is_empty() {
                                out.push(rest.to_string());
                            }
                            out
                        }
                        Err(_) => words.collect(),
                    }
                }
                Some(Value::Str(sep)) if sep.is_empty() => {
                    return Err(EvalError::Value("empty separator".into()));
                }
                Some(Value::Str(sep)) => match usize::try_from(maxsplit) {
                    Ok(limit) => s.splitn(limit + 1, sep.as_str()).map(str::to_string).collect(),
                    Err(_) => s.split(sep.as_str()).map(str::to_string).collect(),
                },
                Some(other) => {
                    return Err(EvalError::Type(format!(
                        "must be str or None, not '{}'",
                        other.type_name()
                    )));
                }
            };
            Value::List(parts.into_iter().map(Value::Str).collect())
        }
        "join" => {
            let items = args.require(0, "iterable", "join")?.iterate()?;
            let mut pieces = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::Str(piece) => pieces.push(piece.as_str()),
                    other => {
                        return Err(EvalError::Type(format!(
                            "sequence item: expected str instance, '{}' found",
                            other.type_name()
                        )));
                    }
                }
            }
            Value::Str(pieces.join(s))
        }
        "replace" => {
            let old = str_arg(args, 0, "old", "replace")?;
            let new = str_arg(args, 1, "new", "replace")?;
            match args.get(2, "count").and_then(Value::as_int).map(usize::try_from) {
                Some(Ok(count)) => Value::Str(s.replacen(old.as_str(), &new, count)),
                _ => Value::Str(s.replace(old.as_str(), &new)),
            }
        }
        "encode" => Value::Bytes(s.as_bytes().to_vec()),
        "find" => {
            let needle = str_arg(args, 0, "sub", "find")?;
            match s.find(needle.as_str()) {
                Some(byte_pos) => int_value(s.get(..byte_pos).map(|p| p.chars().count()).unwrap_or_default()),
                None => Value::Int(-1),
            }
        }
        "count" => {
            let needle = str_arg(args, 0, "sub", "count")?;
            if needle.is_empty() {
                int_value(s.chars().count() + 1)
            } else {
                int_value(s.matches(needle.as_str()).count())
            }
        }
        "zfill" => {
            let width = count_arg(args, 0, "width", "zfill")?;
            let len = s.chars().count();
            if len >= width {
                Value::Str(s.to_string())
            } else {
                let (sign, digits) = match s.strip_prefix(['-', '+']) {
                    Some(rest) => (s.get(..1).unwrap_or(""), rest),
                    None => ("", s),
                };
                Value::Str(format!("{}{}{}", sign, "0".repeat(width - len), digits))
            }
        }
        "isdigit" => Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())),
        _ => {
            return Err(EvalError::Attribute(format!("'str' object has no attribute '{}'", method)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Args) -> EvalResult<Value> {
        safe_table().get(name).unwrap().call(args)
    }

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn test_min_max_ignore_none() {
        let mixed = Value::List(vec![Value::None, Value::Int(3), Value::Int(7), Value::None]);
        assert_eq!(call("max", Args::new(vec![mixed.clone()])).unwrap(), Value::Int(7));
        assert_eq!(call("min", Args::new(vec![mixed])).unwrap(), Value::Int(3));
        let nones = Value::List(vec![Value::None, Value::None]);
        assert_eq!(call("max", Args::new(vec![nones])).unwrap(), Value::None);
    }

    #[test]
    fn test_randbytes_unique_and_capped() {
        let Value::Bytes(bytes) = call("randbytes", Args::new(vec![Value::Int(256)])).unwrap() else {
            panic!("bytes expected");
        };
        let mut sorted = bytes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 256);
        assert!(matches!(
            call("randbytes", Args::new(vec![Value::Int(257)])),
            Err(EvalError::Value(_))
        ));
        let repeated = call("randbytes", Args::new(vec![Value::Int(300)]).keyword("unique", Value::Bool(false))).unwrap();
        assert_eq!(repeated.len().unwrap(), 300);
    }

    #[test]
    fn test_concatn_and_repeatn() {
        let parts = Value::List(vec![ints(&[1, 2]), ints(&[3, 4]), ints(&[5, 6])]);
        assert_eq!(call("concatn", Args::new(vec![parts, Value::Int(3)])).unwrap(), ints(&[1, 2, 3]));
        assert_eq!(
            call("repeatn", Args::new(vec![Value::from("ab"), Value::Int(5)])).unwrap(),
            Value::from("ababa")
        );
        assert_eq!(call("repeatn", Args::new(vec![ints(&[1, 2]), Value::Int(4)])).unwrap(), ints(&[1, 2, 1, 2]));
        assert_eq!(call("repeatn", Args::new(vec![ints(&[1, 2]), Value::Int(0)])).unwrap(), ints(&[]));
    }

    #[test]
    fn test_repeatn_reaches_the_sequence_limit_exactly() {
        let near_cap = Value::Bytes(vec![0x41; MAX_SEQUENCE_LENGTH / 2 + 1]);
        let filled = call("repeatn", Args::new(vec![near_cap.clone(), int_value(MAX_SEQUENCE_LENGTH)])).unwrap();
        assert_eq!(filled.len().unwrap(), MAX_SEQUENCE_LENGTH);
        assert!(matches!(
            call("repeatn", Args::new(vec![near_cap, int_value(MAX_SEQUENCE_LENGTH + 1)])),
            Err(EvalError::Value(_))
        ));
    }

    #[test]
    fn test_select_prefers_first_allowed_entry() {
        let args = Args::new(vec![
            Value::List(vec![Value::from(".text"), Value::from(".data")]),
            Value::List(vec![Value::from(".rand")]),
        ])
        .keyword("exclusions", Value::List(vec![Value::from(".text")]));
        assert_eq!(call("select", args).unwrap(), Value::from(".data"));

        let exhausted = Args::new(vec![
            Value::List(vec![Value::from(".text")]),
            Value::List(vec![Value::from(".rand")]),
        ])
        .keyword("exclusions", Value::List(vec![Value::from(".text")]));
        assert_eq!(call("select", exhausted).unwrap(), Value::from(".rand"));
    }

    #[test]
    fn test_select_section_name_maps_sections() {
        let section = Value::from_pairs([("name", Value::from(".text"))]);
        let args = Args::new(vec![Value::List(vec![section])]);
        assert_eq!(call("select_section_name", args).unwrap(), Value::from(".text"));
    }

    #[test]
    fn test_size_rounds_to_blocks() {
        let exe = Value::from_pairs([("size", Value::Int(20_000))]);
        // int(20000 * 0.1) = 2000 ; 2000 / 512 + .5 = 4.406 -> 4 blocks
        assert_eq!(call("size", Args::new(vec![exe])).unwrap(), Value::Int(2048));
    }

    #[test]
    fn test_value_unwraps() {
        let wrapped = Value::from_pairs([("value", Value::Int(4))]);
        assert_eq!(call("value", Args::new(vec![wrapped])).unwrap(), Value::Int(4));
        assert_eq!(call("value", Args::new(vec![Value::Int(5)])).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_zeropad_pads_bytes() {
        let pad = call("zeropad", Args::new(vec![Value::Int(4)])).unwrap();
        let padded = pad.call(Args::new(vec![Value::Bytes(vec![1])])).unwrap();
        assert_eq!(padded, Value::Bytes(vec![1, 0, 0, 0]));
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(call("int", Args::new(vec![Value::from(" -0x1f "), Value::Int(0)])).unwrap(), Value::Int(-31));
        assert_eq!(call("int", Args::new(vec![Value::Float(-2.7)])).unwrap(), Value::Int(-2));
        assert!(matches!(call("int", Args::new(vec![Value::from("zz")])), Err(EvalError::Value(_))));
    }

    #[test]
    fn test_round_is_bankers() {
        assert_eq!(call("round", Args::new(vec![Value::Float(2.5)])).unwrap(), Value::Int(2));
        assert_eq!(call("round", Args::new(vec![Value::Float(3.5)])).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_methods() {
        let split = bound_method(&Value::from("a,b,,c"), "split").unwrap();
        assert_eq!(split.call(Args::new(vec![Value::from(",")])).unwrap().len().unwrap(), 4);
        let upper = bound_method(&Value::from("pe"), "upper").unwrap();
        assert_eq!(upper.call(Args::default()).unwrap(), Value::from("PE"));
        assert!(bound_method(&Value::Int(1), "real").is_none());
    }
}
