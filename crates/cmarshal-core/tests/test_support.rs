//! Shared test support utilities for integration tests

#![allow(dead_code)]

use std::ffi::c_void;

use cmarshal_core::{BoundFunction, FieldSpec, FunctionSignature, LayoutRegistry, Record};

/// Registry with the two layouts used by the reference library:
/// `MyCString { len: uint32, ptr: string }` and
/// `MyCStringArray { len: uint32, ptr: ptr_array<MyCString, len> }`.
pub fn rosie_registry() -> LayoutRegistry {
    let mut registry = LayoutRegistry::new();
    registry
        .define_layout(
            "MyCString",
            [FieldSpec::new("len", "uint32"), FieldSpec::new("ptr", "string")],
        )
        .unwrap();
    registry
        .define_layout(
            "MyCStringArray",
            [
                FieldSpec::new("len", "uint32"),
                FieldSpec::new("ptr", "ptr_array<MyCString, len>"),
            ],
        )
        .unwrap();
    registry
}

/// `MyCString { len: 7, ptr: "Hello, world" }`
pub fn hello(registry: &LayoutRegistry) -> Record {
    Record::new(registry.layout("MyCString").unwrap())
        .with("len", 7u32)
        .unwrap()
        .with("ptr", "Hello, world")
        .unwrap()
}

/// Bind a function linked into the test binary.
pub fn bind_raw(
    registry: &LayoutRegistry,
    name: &str,
    address: *const c_void,
    returns: &str,
    params: &[&str],
) -> BoundFunction {
    let signature = FunctionSignature::parse(registry, returns, params.iter().copied()).unwrap();
    unsafe { BoundFunction::from_raw(name, address, signature) }.unwrap()
}
