//! Command handlers for CLI subcommands
//!
//! This module contains the implementation logic for each CLI subcommand,
//! plus the literal parsing shared by `call` and `smoke`.

mod call;
mod check;
mod completions;
mod config;
mod layout;
mod smoke;

pub use call::handle_call;
pub use check::handle_check;
pub use completions::handle_completions;
pub use config::handle_config;
pub use layout::handle_layout;
pub use smoke::handle_smoke;

use crate::error::{Error, Result};
use cmarshal_core::{Declarations, FieldKind, LayoutDescriptor, NativeType, Primitive, Record, Value};
use std::path::Path;
use std::sync::Arc;

/// Read a declarations file, reporting a missing file as such
pub(crate) fn load_declarations(path: &Path) -> Result<Declarations> {
    if !path.exists() {
        return Err(Error::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(Declarations::from_file(path)?)
}

/// Convert a command-line literal to a host value for parameter `index`.
///
/// Scalars use their usual spelling (`-3`, `0x10`, `2.5`, `true`), strings
/// are taken verbatim, `null` is NULL, and records are JSON objects keyed by
/// field name. Fields left out of an object keep their zero value.
pub(crate) fn parse_argument(literal: &str, param: &NativeType, index: usize) -> Result<Value> {
    let target = format!("argument {}", index);
    match param {
        NativeType::Void => Err(Error::invalid_args(format!("{} has kind void", target))),
        NativeType::Primitive(p) => parse_scalar(literal, *p, &target),
        NativeType::ByRef(_) if literal == "null" => Ok(Value::null()),
        NativeType::ByValue(layout) | NativeType::ByRef(layout) => {
            let json: serde_json::Value = serde_json::from_str(literal).map_err(|e| {
                Error::invalid_args(format!(
                    "{} must be a JSON object for {}: {}",
                    target,
                    layout.name(),
                    e
                ))
            })?;
            Ok(Value::Record(record_from_json(&json, layout, &target)?))
        }
    }
}

fn parse_scalar(literal: &str, kind: Primitive, target: &str) -> Result<Value> {
    let bad = || {
        Error::invalid_args(format!(
            "{}: cannot read {:?} as {}",
            target,
            literal,
            kind.name()
        ))
    };

    match kind {
        Primitive::String if literal == "null" => Ok(Value::Str(None)),
        Primitive::String => Ok(Value::from(literal)),
        Primitive::Pointer if literal == "null" => Ok(Value::null()),
        Primitive::Pointer => parse_unsigned(literal).map(|p| Value::Pointer(p as usize)).ok_or_else(bad),
        Primitive::Bool => literal.parse::<bool>().map(Value::Bool).map_err(|_| bad()),
        p if p.is_float() => literal.parse::<f64>().map(Value::Float).map_err(|_| bad()),
        p if p.is_unsigned() => parse_unsigned(literal).map(Value::UInt).ok_or_else(bad),
        _ => parse_signed(literal).map(Value::Int).ok_or_else(bad),
    }
}

fn parse_unsigned(literal: &str) -> Option<u64> {
    match literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => literal.parse().ok(),
    }
}

fn parse_signed(literal: &str) -> Option<i64> {
    match literal.strip_prefix('-') {
        Some(rest) => parse_unsigned(rest)
            .and_then(|magnitude| 0i64.checked_sub_unsigned(magnitude)),
        None => parse_unsigned(literal).and_then(|u| i64::try_from(u).ok()),
    }
}

fn record_from_json(
    json: &serde_json::Value,
    layout: &Arc<LayoutDescriptor>,
    target: &str,
) -> Result<Record> {
    let object = json.as_object().ok_or_else(|| {
        Error::invalid_args(format!("{} must be a JSON object for {}", target, layout.name()))
    })?;

    let mut record = Record::new(Arc::clone(layout));
    for (name, value) in object {
        let field = layout.field(name).ok_or_else(|| {
            Error::invalid_args(format!("{}: {} has no field '{}'", target, layout.name(), name))
        })?;
        let field_target = format!("{}.{}", target, name);
        let value = field_from_json(value, field.kind(), &field_target)?;
        record.set(name, value)?;
    }
    Ok(record)
}

fn field_from_json(json: &serde_json::Value, kind: &FieldKind, target: &str) -> Result<Value> {
    use serde_json::Value as Json;
    match (kind, json) {
        (FieldKind::Struct(layout), _) => Ok(Value::Record(record_from_json(json, layout, target)?)),
        (FieldKind::Ptr(_) | FieldKind::PtrArray { .. }, Json::Null) => Ok(Value::null()),
        (FieldKind::Ptr(_) | FieldKind::PtrArray { .. }, other) => {
            parse_scalar(&scalar_text(other), Primitive::Pointer, target)
        }
        (FieldKind::Primitive(Primitive::String), Json::String(s)) => Ok(Value::from(s.as_str())),
        (FieldKind::Primitive(p), other) => parse_scalar(&scalar_text(other), *p, target),
    }
}

/// Literal spelling of a JSON scalar, so JSON fields share scalar parsing
fn scalar_text(json: &serde_json::Value) -> String {
    match json {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmarshal_core::{FieldSpec, LayoutRegistry};
    use pretty_assertions::assert_eq;

    fn registry() -> LayoutRegistry {
        let mut registry = LayoutRegistry::new();
        registry
            .define_layout(
                "MyCString",
                [FieldSpec::new("len", "uint32"), FieldSpec::new("ptr", "string")],
            )
            .unwrap();
        registry
    }

    fn param(registry: &LayoutRegistry, kind: &str) -> NativeType {
        NativeType::resolve(kind, registry).unwrap()
    }

    #[test]
    fn test_scalar_literals() {
        let r = registry();
        assert_eq!(parse_argument("-12", &param(&r, "int32"), 0).unwrap(), Value::Int(-12));
        assert_eq!(parse_argument("0x10", &param(&r, "size_t"), 0).unwrap(), Value::UInt(16));
        assert_eq!(parse_argument("2.5", &param(&r, "double"), 0).unwrap(), Value::Float(2.5));
        assert_eq!(parse_argument("true", &param(&r, "bool"), 0).unwrap(), Value::Bool(true));
        assert_eq!(parse_argument("null", &param(&r, "string"), 0).unwrap(), Value::Str(None));
        assert_eq!(parse_argument("null", &param(&r, "pointer"), 0).unwrap(), Value::null());
        assert_eq!(
            parse_argument("01234", &param(&r, "string"), 0).unwrap(),
            Value::from("01234")
        );
        assert_eq!(
            parse_argument("-9223372036854775808", &param(&r, "int64"), 0).unwrap(),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn test_bad_scalar_literal() {
        let r = registry();
        let err = parse_argument("seven", &param(&r, "int32"), 2).unwrap_err();
        assert!(matches!(err, Error::InvalidArgs(_)));
        assert!(err.to_string().contains("argument 2"));
        assert!(parse_argument("-1", &param(&r, "uint8"), 0).is_err());
    }

    #[test]
    fn test_record_literal() {
        let r = registry();
        let value = parse_argument(
            r#"{"len": 7, "ptr": "Hello, world"}"#,
            &param(&r, "struct<MyCString>"),
            0,
        )
        .unwrap();
        let record = value.as_record().unwrap();
        assert_eq!(record.get("len").unwrap(), &Value::UInt(7));
        assert_eq!(record.get("ptr").unwrap().as_str(), Some("Hello, world"));

        assert_eq!(
            parse_argument("null", &param(&r, "ptr<MyCString>"), 0).unwrap(),
            Value::null()
        );
    }

    #[test]
    fn test_record_literal_unknown_field() {
        let r = registry();
        let err = parse_argument(r#"{"size": 1}"#, &param(&r, "ptr<MyCString>"), 0).unwrap_err();
        assert!(err.to_string().contains("no field 'size'"));
    }

    #[test]
    fn test_out_of_range_field_is_a_core_error() {
        let r = registry();
        let err = parse_argument(r#"{"len": 5000000000}"#, &param(&r, "struct<MyCString>"), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Core(cmarshal_core::Error::TypeMismatch { .. })));
    }
}
