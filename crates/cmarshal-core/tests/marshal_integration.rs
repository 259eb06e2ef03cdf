//! Marshaling tests against the reference library
//!
//! Functions are bound by address from the linked `cmarshal-testlib` rlib,
//! so these tests run without locating the cdylib on disk. Every test that
//! calls into the library is serialized because they share its call
//! counter.

mod test_support;

use std::ffi::c_void;

use cmarshal_core::{Error, Record, Value};
use cmarshal_testlib as testlib;
use pretty_assertions::assert_eq;
use serial_test::serial;
use test_support::{bind_raw, hello, rosie_registry};

#[test]
#[serial]
fn test_by_value_callee_cannot_touch_caller() {
    let registry = rosie_registry();
    let testbyvalue = bind_raw(
        &registry,
        "testbyvalue",
        testlib::testbyvalue as *const c_void,
        "int32",
        &["struct<MyCString>"],
    );

    let original = hello(&registry);
    let mut args = [Value::Record(original.clone())];
    let doubled = unsafe { testbyvalue.call(&mut args) }.unwrap();

    assert_eq!(doubled, Value::Int(14));
    assert_eq!(args[0], Value::Record(original));
    assert_eq!(args[0].as_record().unwrap().get("len").unwrap(), &Value::UInt(7));
}

#[test]
#[serial]
fn test_by_reference_mutation_is_visible() {
    let registry = rosie_registry();
    let testbyref = bind_raw(
        &registry,
        "testbyref",
        testlib::testbyref as *const c_void,
        "int32",
        &["ptr<MyCString>"],
    );

    let mut args = [Value::Record(hello(&registry))];
    let previous = unsafe { testbyref.call(&mut args) }.unwrap();

    assert_eq!(previous, Value::Int(7));
    let after = args[0].as_record().unwrap();
    assert_eq!(after.get("len").unwrap(), &Value::UInt(0));
    assert_eq!(after.get("ptr").unwrap().as_str(), Some("Hello, world"));
}

#[test]
#[serial]
fn test_by_reference_accepts_null() {
    let registry = rosie_registry();
    let testbyref = bind_raw(
        &registry,
        "testbyref",
        testlib::testbyref as *const c_void,
        "int32",
        &["ptr<MyCString>"],
    );

    let mut args = [Value::null()];
    assert_eq!(unsafe { testbyref.call(&mut args) }.unwrap(), Value::Int(-1));
    assert_eq!(args[0], Value::null());
}

#[test]
#[serial]
fn test_returned_struct_carries_native_string() {
    let registry = rosie_registry();
    let testretstring = bind_raw(
        &registry,
        "testretstring",
        testlib::testretstring as *const c_void,
        "struct<MyCString>",
        &["ptr<MyCString>"],
    );

    let mut args = [Value::Record(hello(&registry))];
    let returned = unsafe { testretstring.call(&mut args) }.unwrap();
    let record = returned.as_record().unwrap();
    assert_eq!(
        record.get("ptr").unwrap().as_str(),
        Some("Hello from cmarshal-testlib")
    );
    assert_eq!(record.get("len").unwrap(), &Value::UInt(27));

    let mut args = [Value::null()];
    let empty = unsafe { testretstring.call(&mut args) }.unwrap();
    assert_eq!(empty.as_record().unwrap().get("ptr").unwrap(), &Value::Str(None));
}

#[test]
#[serial]
fn test_pointer_array_walk_yields_len_elements_in_order() {
    let registry = rosie_registry();
    let testretarray = bind_raw(
        &registry,
        "testretarray",
        testlib::testretarray as *const c_void,
        "struct<MyCStringArray>",
        &["struct<MyCString>"],
    );
    let testfreearray = bind_raw(
        &registry,
        "testfreearray",
        testlib::testfreearray as *const c_void,
        "void",
        &["struct<MyCStringArray>"],
    );

    let returned = unsafe { testretarray.call(&mut [Value::Record(hello(&registry))]) }.unwrap();
    let array = returned.as_record().unwrap();
    assert_eq!(array.get("len").unwrap(), &Value::UInt(3));

    let elements = unsafe { array.elements("ptr") }.unwrap();
    assert_eq!(elements.len(), 3);
    let names: Vec<String> = elements
        .iter()
        .map(|view| {
            let view = view.unwrap();
            view.get("ptr").unwrap().as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(names, vec!["zero", "one", "two"]);

    for (i, record) in elements.to_records().unwrap().iter().enumerate() {
        assert_eq!(record.get("len").unwrap(), &Value::UInt(i as u64));
    }

    unsafe { testfreearray.call(&mut [returned.clone()]) }.unwrap();
}

#[test]
#[serial]
fn test_null_slot_raises_null_element() {
    let registry = rosie_registry();
    let testretsparse = bind_raw(
        &registry,
        "testretsparse",
        testlib::testretsparse as *const c_void,
        "struct<MyCStringArray>",
        &[],
    );
    let testfreearray = bind_raw(
        &registry,
        "testfreearray",
        testlib::testfreearray as *const c_void,
        "void",
        &["struct<MyCStringArray>"],
    );

    let returned = unsafe { testretsparse.call(&mut []) }.unwrap();
    let array = returned.as_record().unwrap();
    let elements = unsafe { array.elements("ptr") }.unwrap();

    assert_eq!(elements.len(), 3);
    assert!(elements.get(0).is_ok());
    match elements.get(1) {
        Err(Error::NullElement { index, len, .. }) => {
            assert_eq!(index, 1);
            assert_eq!(len, 3);
        }
        other => panic!("expected NullElement, got {:?}", other.map(|v| v.as_ptr())),
    }
    assert!(elements.to_records().is_err());

    let results: Vec<bool> = elements.iter().map(|r| r.is_ok()).collect();
    assert_eq!(results, vec![true, false, true]);

    unsafe { testfreearray.call(&mut [returned.clone()]) }.unwrap();
}

#[test]
#[serial]
fn test_guard_rejects_before_native_call() {
    let registry = rosie_registry();
    let testbyvalue = bind_raw(
        &registry,
        "testbyvalue",
        testlib::testbyvalue as *const c_void,
        "int32",
        &["struct<MyCString>"],
    );
    testlib::reset_call_count();

    let err = unsafe { testbyvalue.call(&mut []) }.unwrap_err();
    assert!(matches!(err, Error::ArityMismatch { expected: 1, actual: 0, .. }));

    let mut two = [Value::Record(hello(&registry)), Value::Int(1)];
    let err = unsafe { testbyvalue.call(&mut two) }.unwrap_err();
    assert!(matches!(err, Error::ArityMismatch { .. }));

    let err = unsafe { testbyvalue.call(&mut [Value::Int(7)]) }.unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));

    let wrong_layout = Record::new(registry.layout("MyCStringArray").unwrap());
    let err = unsafe { testbyvalue.call(&mut [Value::Record(wrong_layout)]) }.unwrap_err();
    assert!(err.is_pre_call());

    assert_eq!(testlib::call_count(), 0);

    unsafe { testbyvalue.call(&mut [Value::Record(hello(&registry))]) }.unwrap();
    assert_eq!(testlib::call_count(), 1);
}

#[test]
#[serial]
fn test_out_of_range_scalar_is_a_type_mismatch() {
    let registry = rosie_registry();
    let identity = bind_raw(
        &registry,
        "counted_identity",
        testlib::counted_identity as *const c_void,
        "int32",
        &["int32"],
    );
    testlib::reset_call_count();

    let err = unsafe { identity.call(&mut [Value::Int(i64::from(i32::MAX) + 1)]) }.unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
    assert_eq!(testlib::call_count(), 0);

    assert_eq!(
        unsafe { identity.call(&mut [Value::Int(-12)]) }.unwrap(),
        Value::Int(-12)
    );
}

#[tokio::test]
#[serial]
async fn test_worker_returns_by_reference_updates() {
    let registry = rosie_registry();
    let worker = bind_raw(
        &registry,
        "testbyref",
        testlib::testbyref as *const c_void,
        "int32",
        &["ptr<MyCString>"],
    )
    .into_worker()
    .unwrap();

    let outcome = unsafe { worker.call(vec![Value::Record(hello(&registry))]).await }.unwrap();
    assert_eq!(outcome.value, Value::Int(7));
    assert_eq!(
        outcome.args[0].as_record().unwrap().get("len").unwrap(),
        &Value::UInt(0)
    );
}
