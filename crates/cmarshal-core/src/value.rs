//! Host-side values
//!
//! [`Value`] is the host representation of anything that crosses the native
//! boundary. [`Record`] is a host struct: one value per field of a layout,
//! kept in canonical form so that marshaling and unmarshaling are exact
//! inverses.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kind::Primitive;
use crate::layout::{FieldKind, LayoutDescriptor};

/// A host value.
///
/// Canonical forms per native kind: signed integers are `Int`, unsigned
/// integers are `UInt`, floats are `Float`, `bool` is `Bool`, `string` is
/// `Str` (`None` is NULL), `pointer` / `ptr<..>` / `ptr_array<..>` are
/// `Pointer`, and `struct<..>` is `Record`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Str(Option<String>),
    Pointer(usize),
    Record(Record),
}

impl Value {
    /// Short type name used in mismatch diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Pointer(_) => "pointer",
            Value::Record(_) => "record",
        }
    }

    /// The NULL pointer.
    pub fn null() -> Self {
        Value::Pointer(0)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            Value::UInt(u) => i64::try_from(u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::UInt(u) => Some(u),
            Value::Int(i) => u64::try_from(i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<usize> {
        match *self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(Some(s)) => write!(f, "{:?}", s),
            Value::Str(None) => f.write_str("NULL"),
            Value::Pointer(0) => f.write_str("NULL"),
            Value::Pointer(p) => write!(f, "{:#x}", p),
            Value::Record(r) => write!(f, "{}", r),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $target:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $target)
                }
            }
        )*
    };
}

value_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    isize => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Some(v.to_string()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Some(v))
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(v)
    }
}

/// A host struct conforming to a layout.
#[derive(Debug, Clone)]
pub struct Record {
    layout: Arc<LayoutDescriptor>,
    values: Vec<Value>,
}

impl Record {
    /// A zero-initialized record: integers 0, floats 0.0, strings and
    /// pointers NULL, nested structs recursively zeroed.
    pub fn new(layout: Arc<LayoutDescriptor>) -> Self {
        let values = layout.fields().iter().map(|f| zero_value(f.kind())).collect();
        Self { layout, values }
    }

    /// Assemble a record from already canonical values. Used by the
    /// unmarshaler, which produces canonical values by construction.
    pub(crate) fn from_parts(layout: Arc<LayoutDescriptor>, values: Vec<Value>) -> Self {
        debug_assert_eq!(layout.fields().len(), values.len());
        Self { layout, values }
    }

    pub fn layout(&self) -> &Arc<LayoutDescriptor> {
        &self.layout
    }

    pub fn get(&self, field: &str) -> Result<&Value> {
        let index = self.layout.require_field(field)?;
        Ok(&self.values[index])
    }

    /// Set a field, converting the value to the field's canonical form.
    /// Fails with [`Error::TypeMismatch`] if it cannot be converted.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.layout.require_field(field)?;
        let descriptor = &self.layout.fields()[index];
        let target = format!("field '{}.{}'", self.layout.name(), field);
        let canonical = coerce_field(descriptor.kind(), value.into(), &target)?;
        self.values[index] = canonical;
        Ok(())
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Values in field order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// `(field name, value)` pairs in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.layout
            .fields()
            .iter()
            .map(|f| f.name())
            .zip(self.values.iter())
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        *self.layout == *other.layout && self.values == other.values
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ ", self.layout.name())?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        f.write_str(" }")
    }
}

fn zero_value(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Primitive(p) => zero_primitive(*p),
        FieldKind::Struct(layout) => Value::Record(Record::new(Arc::clone(layout))),
        FieldKind::Ptr(_) | FieldKind::PtrArray { .. } => Value::Pointer(0),
    }
}

fn zero_primitive(p: Primitive) -> Value {
    match p {
        _ if p.is_signed() => Value::Int(0),
        _ if p.is_unsigned() => Value::UInt(0),
        Primitive::F32 | Primitive::F64 => Value::Float(0.0),
        Primitive::Bool => Value::Bool(false),
        Primitive::String => Value::Str(None),
        _ => Value::Pointer(0),
    }
}

/// Convert `value` to the canonical form of a field kind.
pub(crate) fn coerce_field(kind: &FieldKind, value: Value, target: &str) -> Result<Value> {
    match kind {
        FieldKind::Primitive(p) => coerce_primitive(*p, value, target),
        FieldKind::Struct(layout) => coerce_record(layout, value, target),
        FieldKind::Ptr(layout) => match value {
            Value::Pointer(p) => Ok(Value::Pointer(p)),
            other => Err(Error::type_mismatch(
                target,
                format!("pointer to {}", layout.name()),
                other.type_name(),
            )),
        },
        FieldKind::PtrArray { layout, .. } => match value {
            Value::Pointer(p) => Ok(Value::Pointer(p)),
            other => Err(Error::type_mismatch(
                target,
                format!("pointer to array of {}", layout.name()),
                other.type_name(),
            )),
        },
    }
}

/// A record value whose layout is exactly `layout`.
pub(crate) fn coerce_record(
    layout: &Arc<LayoutDescriptor>,
    value: Value,
    target: &str,
) -> Result<Value> {
    match value {
        Value::Record(record) if *record.layout == **layout => Ok(Value::Record(record)),
        Value::Record(record) => Err(Error::type_mismatch(
            target,
            format!("record of {}", layout.name()),
            format!("record of {}", record.layout.name()),
        )),
        other => Err(Error::type_mismatch(
            target,
            format!("record of {}", layout.name()),
            other.type_name(),
        )),
    }
}

/// Convert `value` to the canonical form of a primitive kind.
pub(crate) fn coerce_primitive(p: Primitive, value: Value, target: &str) -> Result<Value> {
    let mismatch = |actual: &Value| Error::type_mismatch(target, p.name(), actual.type_name());

    if let Some((min, max)) = p.int_range() {
        let wide: i128 = match value {
            Value::Int(i) => i as i128,
            Value::UInt(u) => u as i128,
            ref other => return Err(mismatch(other)),
        };
        if wide < min || wide > max {
            return Err(Error::type_mismatch(
                target,
                format!("{} in range {}..={}", p.name(), min, max),
                wide.to_string(),
            ));
        }
        return Ok(if p.is_signed() {
            Value::Int(wide as i64)
        } else {
            Value::UInt(wide as u64)
        });
    }

    match (p, value) {
        (Primitive::F32, Value::Float(x)) => Ok(Value::Float(x as f32 as f64)),
        (Primitive::F32, Value::Int(i)) => Ok(Value::Float(i as f32 as f64)),
        (Primitive::F32, Value::UInt(u)) => Ok(Value::Float(u as f32 as f64)),
        (Primitive::F64, Value::Float(x)) => Ok(Value::Float(x)),
        (Primitive::F64, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (Primitive::F64, Value::UInt(u)) => Ok(Value::Float(u as f64)),
        (Primitive::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (Primitive::Pointer, Value::Pointer(addr)) => Ok(Value::Pointer(addr)),
        (Primitive::String, Value::Str(s)) => {
            if s.as_deref().is_some_and(|s| s.contains('\0')) {
                return Err(Error::type_mismatch(
                    target,
                    "string without interior NUL",
                    "string containing NUL",
                ));
            }
            Ok(Value::Str(s))
        }
        (_, other) => Err(mismatch(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FieldSpec, LayoutRegistry};

    fn cstring_layout() -> Arc<LayoutDescriptor> {
        let mut registry = LayoutRegistry::new();
        registry
            .define_layout(
                "MyCString",
                [FieldSpec::new("len", "uint32"), FieldSpec::new("ptr", "string")],
            )
            .unwrap()
    }

    #[test]
    fn test_new_record_is_zeroed() {
        let record = Record::new(cstring_layout());
        assert_eq!(record.get("len").unwrap(), &Value::UInt(0));
        assert_eq!(record.get("ptr").unwrap(), &Value::Str(None));
    }

    #[test]
    fn test_set_canonicalizes_integers() {
        let mut record = Record::new(cstring_layout());
        record.set("len", 7i32).unwrap();
        assert_eq!(record.get("len").unwrap(), &Value::UInt(7));
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut record = Record::new(cstring_layout());
        let err = record.set("len", -1i64).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        let err = record.set("len", u64::MAX).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert_eq!(record.get("len").unwrap(), &Value::UInt(0));
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let mut record = Record::new(cstring_layout());
        assert!(record.set("ptr", 12u32).is_err());
        assert!(record.set("len", "seven").is_err());
        assert!(record.set("ptr", "inner\0nul").is_err());
    }

    #[test]
    fn test_unknown_field() {
        let mut record = Record::new(cstring_layout());
        let err = record.set("capacity", 1u32).unwrap_err();
        assert!(matches!(err, Error::UnknownField { field, .. } if field == "capacity"));
    }

    #[test]
    fn test_float_narrowing_is_applied_eagerly() {
        let v = coerce_primitive(Primitive::F32, Value::Float(0.1), "x").unwrap();
        assert_eq!(v, Value::Float(0.1f32 as f64));
    }

    #[test]
    fn test_display() {
        let record = Record::new(cstring_layout())
            .with("len", 7u32)
            .unwrap()
            .with("ptr", "Hello, world")
            .unwrap();
        assert_eq!(
            record.to_string(),
            "MyCString { len: 7, ptr: \"Hello, world\" }"
        );
    }
}
