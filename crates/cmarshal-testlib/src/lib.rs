//! Reference native library
//!
//! A small C-ABI library with known behavior, built both as a `cdylib` (to
//! be loaded with `dlopen`) and as an `rlib` (so tests can take function
//! addresses directly). Every entry point bumps a global call counter, which
//! tests use to prove that a rejected call never reached native code.

use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

static CALLS: AtomicUsize = AtomicUsize::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

const GREETING: &[u8] = b"Hello from cmarshal-testlib\0";
const NAMES: [&[u8]; 3] = [b"zero\0", b"one\0", b"two\0"];

/// `struct { uint32_t len; char *ptr; }`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TestString {
    pub len: u32,
    pub ptr: *const c_char,
}

/// `struct { uint32_t len; TestString **ptr; }`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TestStringArray {
    pub len: u32,
    pub ptr: *mut *mut TestString,
}

fn bump() {
    CALLS.fetch_add(1, Ordering::SeqCst);
}

fn static_str(bytes: &'static [u8]) -> TestString {
    TestString {
        len: (bytes.len() - 1) as u32,
        ptr: bytes.as_ptr() as *const c_char,
    }
}

/// Leak `elements` as a native pointer array.
fn leak_array(elements: Vec<Option<TestString>>) -> TestStringArray {
    let slots: Box<[*mut TestString]> = elements
        .into_iter()
        .map(|e| match e {
            Some(s) => Box::into_raw(Box::new(s)),
            None => ptr::null_mut(),
        })
        .collect();
    let len = slots.len() as u32;
    TestStringArray {
        len,
        ptr: Box::into_raw(slots) as *mut *mut TestString,
    }
}

/// Number of entry-point calls since the last reset.
#[no_mangle]
pub extern "C" fn call_count() -> usize {
    CALLS.load(Ordering::SeqCst)
}

#[no_mangle]
pub extern "C" fn reset_call_count() {
    CALLS.store(0, Ordering::SeqCst);
}

/// Returns 0 on success, -1 if `home` is NULL.
///
/// # Safety
/// `home` must be NULL or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn initialize(home: *const c_char) -> i32 {
    bump();
    if home.is_null() {
        return -1;
    }
    INITIALIZED.store(true, Ordering::SeqCst);
    0
}

#[no_mangle]
pub extern "C" fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Sets `s.len` to 0 and returns the previous length, or -1 for NULL.
///
/// # Safety
/// `s` must be NULL or point to a writable `TestString`.
#[no_mangle]
pub unsafe extern "C" fn testbyref(s: *mut TestString) -> i32 {
    bump();
    match s.as_mut() {
        Some(s) => {
            let previous = s.len;
            s.len = 0;
            previous as i32
        }
        None => -1,
    }
}

/// Doubles its own copy of `s.len` and returns it.
#[no_mangle]
pub extern "C" fn testbyvalue(mut s: TestString) -> i32 {
    bump();
    s.len = s.len.wrapping_mul(2);
    s.len as i32
}

/// Returns a struct pointing at a static string. The argument is only
/// checked for NULL.
///
/// # Safety
/// `s` must be NULL or point to a readable `TestString`.
#[no_mangle]
pub unsafe extern "C" fn testretstring(s: *const TestString) -> TestString {
    bump();
    if s.is_null() {
        return TestString {
            len: 0,
            ptr: ptr::null(),
        };
    }
    static_str(GREETING)
}

/// Returns three elements named "zero", "one" and "two", with `len` set
/// to the index. Release with [`testfreearray`].
#[no_mangle]
pub extern "C" fn testretarray(_s: TestString) -> TestStringArray {
    bump();
    leak_array(
        NAMES
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                Some(TestString {
                    len: i as u32,
                    ..static_str(name)
                })
            })
            .collect(),
    )
}

/// Like [`testretarray`] but slot 1 is NULL.
#[no_mangle]
pub extern "C" fn testretsparse() -> TestStringArray {
    bump();
    leak_array(vec![Some(static_str(NAMES[0])), None, Some(static_str(NAMES[2]))])
}

/// Free an array returned by [`testretarray`] or [`testretsparse`].
///
/// # Safety
/// `array` must come from one of those functions and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn testfreearray(array: TestStringArray) {
    if array.ptr.is_null() {
        return;
    }
    let slots = Box::from_raw(ptr::slice_from_raw_parts_mut(array.ptr, array.len as usize));
    for &slot in slots.iter() {
        if !slot.is_null() {
            drop(Box::from_raw(slot));
        }
    }
}

/// Returns `x`.
#[no_mangle]
pub extern "C" fn counted_identity(x: i32) -> i32 {
    bump();
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::ffi::CStr;

    #[test]
    #[serial]
    fn test_byref_zeroes_len() {
        let mut s = static_str(GREETING);
        let before = s.len as i32;
        assert_eq!(unsafe { testbyref(&mut s) }, before);
        assert_eq!(s.len, 0);
        assert_eq!(unsafe { testbyref(ptr::null_mut()) }, -1);
    }

    #[test]
    #[serial]
    fn test_byvalue_leaves_caller_copy() {
        let s = TestString { len: 7, ptr: ptr::null() };
        assert_eq!(testbyvalue(s), 14);
        assert_eq!(s.len, 7);
    }

    #[test]
    #[serial]
    fn test_array_round_trip() {
        let array = testretarray(static_str(GREETING));
        assert_eq!(array.len, 3);
        unsafe {
            for i in 0..3 {
                let element = &**array.ptr.add(i);
                assert_eq!(element.len as usize, i);
                let name = CStr::from_ptr(element.ptr).to_str().unwrap();
                assert_eq!(name.as_bytes(), &NAMES[i][..NAMES[i].len() - 1]);
            }
            testfreearray(array);
        }
    }

    #[test]
    #[serial]
    fn test_call_counter() {
        reset_call_count();
        counted_identity(1);
        counted_identity(2);
        assert_eq!(call_count(), 2);
        reset_call_count();
        assert_eq!(call_count(), 0);
    }
}
