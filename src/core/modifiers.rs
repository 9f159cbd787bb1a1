// src/core/modifiers.rs

//! Binary helper functions bound into modifier contexts.
//!
//! Each helper is a factory: `add_section('.x', b'..')` returns a callable
//! which the pipeline then invokes with the `parser=` (and `executable=`)
//! keyword arguments. The callable mutates the binary behind the handle and
//! hands the handle back, so a `loop` can feed it to the next round.

use crate::{
    core::formats,
    expression::{Args, EvalError, Value},
    system::binary::{BinaryError, BinaryObject},
};
use indexmap::IndexMap;
use std::rc::Rc;

type EvalResult<T> = Result<T, EvalError>;

/// Helpers for a target format: the common ones plus those of its group.
pub fn helpers(format: &str) -> IndexMap<String, Value> {
    let mut table = IndexMap::new();
    table.insert("add_section".to_string(), Value::function("add_section", add_section));
    table.insert("append_to_section".to_string(), Value::function("append_to_section", append_to_section));
    table.insert("rename_section".to_string(), Value::function("rename_section", rename_section));
    table.insert(
        "rename_all_sections".to_string(),
        Value::function("rename_all_sections", rename_all_sections),
    );
    if formats::format_group(format) == Some("PE") {
        table.insert("set_checksum".to_string(), Value::function("set_checksum", set_checksum));
    }
    table
}

/// Wraps a binary operation into the callable returned by a helper.
fn mutator(name: &'static str, operation: impl Fn(&mut dyn BinaryObject) -> Result<(), BinaryError> + 'static) -> Value {
    Value::function(name, move |args: Args| {
        let handle = match args.keywords.get("parser") {
            Some(Value::Binary(handle)) => Rc::clone(handle),
            Some(other) => {
                return Err(EvalError::Type(format!(
                    "{}() expects a binary as 'parser', got '{}'",
                    name,
                    other.type_name()
                )));
            }
            None => return Err(EvalError::Type(format!("{}() requires a 'parser' argument", name))),
        };
        {
            let mut binary = handle.try_borrow_mut().map_err(|_| failure(name, "binary is in use"))?;
            log::trace!("{} on '{}'", name, binary.path().display());
            operation(&mut **binary).map_err(|e| failure(name, e))?;
        }
        Ok(Value::Binary(handle))
    })
}

fn failure(function: &str, reason: impl ToString) -> EvalError {
    EvalError::Call {
        function: function.to_string(),
        reason: reason.to_string(),
    }
}

fn text_arg(args: &Args, index: usize, name: &str, func: &str) -> EvalResult<Option<String>> {
    match args.get(index, name) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(Value::Bytes(b)) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
        Some(other) => Err(EvalError::Type(format!(
            "{}() argument '{}' must be str, not {}",
            func,
            name,
            other.type_name()
        ))),
    }
}

fn data_arg(args: &Args, index: usize, func: &str) -> EvalResult<Vec<u8>> {
    match args.get(index, "data") {
        None | Some(Value::None) => Ok(Vec::new()),
        Some(Value::Bytes(b)) => Ok(b.clone()),
        Some(Value::Str(s)) => Ok(s.as_bytes().to_vec()),
        Some(Value::List(items)) => items
            .iter()
            .map(|v| {
                v.as_int()
                    .and_then(|i| u8::try_from(i).ok())
                    .ok_or_else(|| EvalError::Value(format!("{}() data items must be in range(0, 256)", func)))
            })
            .collect(),
        Some(other) => Err(EvalError::Type(format!(
            "{}() data must be bytes, not {}",
            func,
            other.type_name()
        ))),
    }
}

fn names_arg(args: &Args, index: usize, name: &str, func: &str) -> EvalResult<Vec<String>> {
    args.require(index, name, func)?
        .iterate()?
        .into_iter()
        .map(|v| match v {
            Value::Str(s) => Ok(s),
            other => Err(EvalError::Type(format!(
                "{}() '{}' must hold str, not {}",
                func,
                name,
                other.type_name()
            ))),
        })
        .collect()
}

/// `add_section(name, data=b"")`
fn add_section(args: Args) -> EvalResult<Value> {
    let name = text_arg(&args, 0, "name", "add_section")?
        .ok_or_else(|| EvalError::Value("add_section() requires a section name".into()))?;
    let data = data_arg(&args, 1, "add_section")?;
    Ok(mutator("add_section", move |binary| binary.add_section(&name, &data)))
}

/// `append_to_section(name, data)`
fn append_to_section(args: Args) -> EvalResult<Value> {
    let name = text_arg(&args, 0, "name", "append_to_section")?
        .ok_or_else(|| EvalError::Value("append_to_section() requires a section name".into()))?;
    let data = data_arg(&args, 1, "append_to_section")?;
    Ok(mutator("append_to_section", move |binary| binary.append_to_section(&name, &data)))
}

/// `rename_section(old, new, error=True)`: with `error=False`, a missing
/// section (or no old name at all) is not an error.
fn rename_section(args: Args) -> EvalResult<Value> {
    let strict = args.get(2, "error").is_none_or(Value::truthy);
    let old = text_arg(&args, 0, "old", "rename_section")?;
    let new = text_arg(&args, 1, "new", "rename_section")?
        .ok_or_else(|| EvalError::Value("rename_section() requires a new section name".into()))?;
    let old = match old {
        Some(old) => old,
        None if strict => return Err(EvalError::Value("rename_section() requires an old section name".into())),
        None => return Ok(mutator("rename_section", |_| Ok(()))),
    };
    Ok(mutator("rename_section", move |binary| {
        match binary.rename_section(&old, &new) {
            Err(BinaryError::SectionNotFound(_)) if !strict => Ok(()),
            outcome => outcome,
        }
    }))
}

/// `rename_all_sections(olds, news)`: pairs are renamed in order, missing
/// sections are skipped.
fn rename_all_sections(args: Args) -> EvalResult<Value> {
    let olds = names_arg(&args, 0, "olds", "rename_all_sections")?;
    let news = names_arg(&args, 1, "news", "rename_all_sections")?;
    if olds.len() != news.len() {
        return Err(EvalError::Value(format!(
            "rename_all_sections() got {} old names for {} new names",
            olds.len(),
            news.len()
        )));
    }
    Ok(mutator("rename_all_sections", move |binary| {
        for (old, new) in olds.iter().zip(&news) {
            match binary.rename_section(old, new) {
                Err(BinaryError::SectionNotFound(name)) => log::debug!("Section '{}' not found, skipped", name),
                outcome => outcome?,
            }
        }
        Ok(())
    }))
}

/// `set_checksum(value)` (PE only)
fn set_checksum(args: Args) -> EvalResult<Value> {
    let raw = args
        .require(0, "value", "set_checksum")?
        .as_int()
        .ok_or_else(|| EvalError::Type("set_checksum() expects an integer".into()))?;
    let value = u32::try_from(raw).map_err(|_| EvalError::Value(format!("checksum {} out of range", raw)))?;
    Ok(mutator("set_checksum", move |binary| binary.set_checksum(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expression::Context,
        system::binary::{BinaryHandle, MemoryBinary, Section, into_handle},
    };

    fn handle(format: &str) -> BinaryHandle {
        into_handle(Box::new(MemoryBinary::new(
            format,
            "/tmp/t.exe",
            vec![Section::new(".text", vec![0; 4]), Section::new(".data", vec![1; 2])],
        )))
    }

    fn run(format: &str, source: &str, binary: &BinaryHandle) -> EvalResult<Value> {
        let mut ctx = Context::with_safe_functions();
        ctx.extend(helpers(format));
        let helper = ctx.evaluate(source)?;
        helper.call(
            Args::default()
                .keyword("executable", Value::None)
                .keyword("parser", Value::Binary(Rc::clone(binary))),
        )
    }

    fn names(binary: &BinaryHandle) -> Vec<String> {
        binary.borrow().sections().into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn test_add_and_append() {
        let binary = handle("ELF64");
        let out = run("ELF64", "add_section('.new', b'ab')", &binary).unwrap();
        assert!(matches!(out, Value::Binary(_)));
        run("ELF64", "append_to_section('.new', 'cd')", &binary).unwrap();
        let last = binary.borrow().sections().pop().unwrap();
        assert_eq!(last.content, b"abcd".to_vec());
        assert_eq!(names(&binary), vec![".text", ".data", ".new"]);
    }

    #[test]
    fn test_rename_section_strictness() {
        let binary = handle("PE32");
        run("PE32", "rename_section('.text', 'UPX0')", &binary).unwrap();
        assert_eq!(names(&binary), vec!["UPX0", ".data"]);

        let err = run("PE32", "rename_section('.nope', 'X')", &binary).unwrap_err();
        assert!(matches!(err, EvalError::Call { .. }));
        run("PE32", "rename_section('.nope', 'X', error=False)", &binary).unwrap();
        run("PE32", "rename_section(None, 'X', error=False)", &binary).unwrap();
        assert!(matches!(
            run("PE32", "rename_section(None, 'X')", &binary),
            Err(EvalError::Value(_))
        ));
        assert!(matches!(
            run("PE32", "rename_section('.data', None)", &binary),
            Err(EvalError::Value(_))
        ));
    }

    #[test]
    fn test_rename_all_skips_missing_sections() {
        let binary = handle("PE64");
        run("PE64", "rename_all_sections(['.text', '.gone', '.data'], ['a', 'b', 'c'])", &binary).unwrap();
        assert_eq!(names(&binary), vec!["a", "c"]);
    }

    #[test]
    fn test_checksum_helper_is_pe_only() {
        assert!(helpers("PE32").contains_key("set_checksum"));
        assert!(!helpers("ELF32").contains_key("set_checksum"));

        let binary = handle("PE32");
        run("PE32", "set_checksum(0xBEEF)", &binary).unwrap();
        assert_eq!(binary.borrow().compute_checksum(), 0xBEEF);
    }

    #[test]
    fn test_missing_parser_is_a_type_error() {
        let mut ctx = Context::with_safe_functions();
        ctx.extend(helpers("ELF32"));
        let helper = ctx.evaluate("add_section('.x')").unwrap();
        assert!(matches!(helper.call(Args::default()), Err(EvalError::Type(_))));
    }
}
