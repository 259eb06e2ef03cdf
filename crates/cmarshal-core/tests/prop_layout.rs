//! Property-based tests for layout computation and marshaling
//!
//! These tests verify layout invariants and buffer round-trips across
//! randomly generated struct declarations.

use std::sync::Arc;

use cmarshal_core::{marshal, FieldSpec, LayoutDescriptor, LayoutRegistry, Record, Value};
use proptest::prelude::*;

const KINDS: &[&str] = &[
    "int8", "int16", "int32", "int64", "uint8", "uint16", "uint32", "uint64", "long", "ulong",
    "size_t", "ssize_t", "float", "double", "bool", "pointer", "string",
];

/// Strategy for a list of primitive kind names
fn kinds_strategy() -> impl Strategy<Value = Vec<&'static str>> {
    proptest::collection::vec(proptest::sample::select(KINDS), 1..12)
}

fn define(kinds: &[&str]) -> Arc<LayoutDescriptor> {
    let mut registry = LayoutRegistry::new();
    let fields = kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| FieldSpec::new(format!("f{}", i), *kind));
    registry.define_layout("Generated", fields).unwrap()
}

/// Strategy for a host value valid for `kind`
fn value_strategy(kind: &'static str) -> BoxedStrategy<Value> {
    match kind {
        "int8" => any::<i8>().prop_map(Value::from).boxed(),
        "int16" => any::<i16>().prop_map(Value::from).boxed(),
        "int32" => any::<i32>().prop_map(Value::from).boxed(),
        "int64" => any::<i64>().prop_map(Value::from).boxed(),
        "uint8" => any::<u8>().prop_map(Value::from).boxed(),
        "uint16" => any::<u16>().prop_map(Value::from).boxed(),
        "uint32" => any::<u32>().prop_map(Value::from).boxed(),
        "uint64" => any::<u64>().prop_map(Value::from).boxed(),
        "long" | "ssize_t" => any::<i32>().prop_map(Value::from).boxed(),
        "ulong" | "size_t" => any::<u32>().prop_map(Value::from).boxed(),
        "float" => (-1.0e6f32..1.0e6f32).prop_map(Value::from).boxed(),
        "double" => any::<f64>()
            .prop_filter("NaN never compares equal", |x| !x.is_nan())
            .prop_map(Value::from)
            .boxed(),
        "bool" => any::<bool>().prop_map(Value::from).boxed(),
        "pointer" => any::<usize>().prop_map(Value::Pointer).boxed(),
        _ => proptest::option::of("[a-zA-Z0-9 ,.!]{0,40}")
            .prop_map(Value::Str)
            .boxed(),
    }
}

/// Strategy for a layout together with one value per field
fn record_strategy() -> impl Strategy<Value = (Vec<&'static str>, Vec<Value>)> {
    kinds_strategy().prop_flat_map(|kinds| {
        let values: Vec<_> = kinds.iter().map(|&k| value_strategy(k)).collect();
        (Just(kinds), values)
    })
}

proptest! {
    #[test]
    fn prop_offsets_are_monotonic_and_aligned(kinds in kinds_strategy()) {
        let layout = define(&kinds);
        let fields = layout.fields();

        for pair in fields.windows(2) {
            prop_assert!(pair[0].offset() + pair[0].size() <= pair[1].offset());
        }
        for field in fields {
            prop_assert_eq!(field.offset() % field.kind().align(), 0);
            prop_assert!(field.kind().align() <= layout.align());
        }
        prop_assert_eq!(layout.size() % layout.align(), 0);
        let last = fields.last().unwrap();
        prop_assert!(last.end() <= layout.size());
    }

    #[test]
    fn prop_marshal_then_unmarshal_is_identity((kinds, values) in record_strategy()) {
        let layout = define(&kinds);
        let mut record = Record::new(layout);
        for (i, value) in values.into_iter().enumerate() {
            record.set(&format!("f{}", i), value).unwrap();
        }

        let buffer = marshal(&record).unwrap();
        prop_assert_eq!(buffer.len(), record.layout().size());
        prop_assert_eq!(buffer.to_record().unwrap(), record);
    }
}
