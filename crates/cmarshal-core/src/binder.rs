//! Binding symbols to typed callables
//!
//! [`BoundFunction::bind`] resolves a symbol eagerly and prepares a libffi
//! call interface for its signature. Calling it converts every argument
//! before any native code runs, so an arity or type error never reaches the
//! native side.

use std::ffi::{c_void, CString};
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::Arc;

use libffi::middle::Type;
use libffi::raw;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::kind::{Primitive, WORD_SIZE};
use crate::layout::{FieldKind, LayoutDescriptor};
use crate::library::LibraryHandle;
use crate::marshal::{self, NativeBuffer};
use crate::signature::{CallingConvention, FunctionSignature, NativeType};
use crate::value::{coerce_primitive, coerce_record, Value};
use crate::worker::WorkerFunction;

fn primitive_type(p: Primitive) -> Type {
    match p {
        Primitive::I8 => Type::i8(),
        Primitive::I16 => Type::i16(),
        Primitive::I32 => Type::i32(),
        Primitive::I64 => Type::i64(),
        Primitive::U8 | Primitive::Bool => Type::u8(),
        Primitive::U16 => Type::u16(),
        Primitive::U32 => Type::u32(),
        Primitive::U64 => Type::u64(),
        Primitive::Long => Type::c_long(),
        Primitive::ULong => Type::c_ulong(),
        Primitive::Size => Type::usize(),
        Primitive::SSize => Type::isize(),
        Primitive::F32 => Type::f32(),
        Primitive::F64 => Type::f64(),
        Primitive::Pointer | Primitive::String => Type::pointer(),
    }
}

/// libffi description of a layout. Gaps left by explicit offsets become
/// runs of `uint8` padding so libffi computes the same offsets.
fn struct_type(layout: &LayoutDescriptor) -> Type {
    let mut elements = Vec::with_capacity(layout.fields().len());
    let mut cursor = 0;
    for field in layout.fields() {
        elements.extend((cursor..field.offset()).map(|_| Type::u8()));
        elements.push(match field.kind() {
            FieldKind::Primitive(p) => primitive_type(*p),
            FieldKind::Struct(nested) => struct_type(nested),
            FieldKind::Ptr(_) | FieldKind::PtrArray { .. } => Type::pointer(),
        });
        cursor = field.end();
    }
    Type::structure(elements)
}

fn native_type(ty: &NativeType) -> Type {
    match ty {
        NativeType::Void => Type::void(),
        NativeType::Primitive(p) => primitive_type(*p),
        NativeType::ByValue(layout) => struct_type(layout),
        NativeType::ByRef(_) => Type::pointer(),
    }
}

/// A prepared `ffi_cif` together with the type descriptions it points into.
struct CallInterface {
    cif: Box<raw::ffi_cif>,
    _arg_types: Vec<Type>,
    _raw_arg_types: Vec<*mut raw::ffi_type>,
    _return_type: Type,
}

// SAFETY: the cif and the types it references are never mutated after
// `ffi_prep_cif`; `ffi_call` only reads them.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    fn prepare(name: &str, signature: &FunctionSignature) -> Result<Self> {
        let arg_types: Vec<Type> = signature.params().iter().map(native_type).collect();
        let return_type = native_type(signature.returns());
        let mut raw_arg_types: Vec<*mut raw::ffi_type> =
            arg_types.iter().map(Type::as_raw_ptr).collect();

        // SAFETY: an all-zero ffi_cif is a valid "unprepared" value.
        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { mem::zeroed() });
        let total = raw_arg_types.len() as u32;

        // SAFETY: every pointer handed to libffi stays alive inside `Self`.
        let status = unsafe {
            match signature.convention() {
                CallingConvention::Variadic { fixed } => raw::ffi_prep_cif_var(
                    &mut *cif,
                    raw::ffi_abi_FFI_DEFAULT_ABI,
                    fixed as u32,
                    total,
                    return_type.as_raw_ptr(),
                    raw_arg_types.as_mut_ptr(),
                ),
                convention => raw::ffi_prep_cif(
                    &mut *cif,
                    abi_for(convention),
                    total,
                    return_type.as_raw_ptr(),
                    raw_arg_types.as_mut_ptr(),
                ),
            }
        };
        if status != raw::ffi_status_FFI_OK {
            return Err(Error::CallInterface {
                function: name.to_string(),
                status: status as u32,
            });
        }

        Ok(Self {
            cif,
            _arg_types: arg_types,
            _raw_arg_types: raw_arg_types,
            _return_type: return_type,
        })
    }
}

#[cfg(all(target_arch = "x86", windows))]
fn abi_for(convention: CallingConvention) -> raw::ffi_abi {
    match convention {
        CallingConvention::Stdcall => raw::ffi_abi_FFI_STDCALL,
        _ => raw::ffi_abi_FFI_DEFAULT_ABI,
    }
}

/// Every other target has a single C calling convention.
#[cfg(not(all(target_arch = "x86", windows)))]
fn abi_for(_convention: CallingConvention) -> raw::ffi_abi {
    raw::ffi_abi_FFI_DEFAULT_ABI
}

struct Inner {
    name: String,
    address: usize,
    signature: FunctionSignature,
    interface: CallInterface,
    // Keeps the library mapped for as long as the function is reachable.
    _library: Option<LibraryHandle>,
}

/// A resolved native function plus its signature. Immutable; clones share
/// the same binding.
#[derive(Clone)]
pub struct BoundFunction {
    inner: Arc<Inner>,
}

/// Per-argument native storage, alive for the duration of one call.
enum ArgSlot {
    /// Scalars and pointers, stored in one or two words
    Scalar([u64; 2]),
    /// Struct passed by value
    Struct(NativeBuffer),
    /// Address passed for a by-reference struct. `buffer` is set when the
    /// host passed a record, which is re-read after the call.
    Ref {
        address: usize,
        buffer: Option<NativeBuffer>,
    },
}

impl ArgSlot {
    fn as_arg_ptr(&mut self) -> *mut c_void {
        match self {
            ArgSlot::Scalar(words) => words.as_mut_ptr() as *mut c_void,
            ArgSlot::Struct(buffer) => buffer.as_mut_ptr() as *mut c_void,
            ArgSlot::Ref { address, .. } => address as *mut usize as *mut c_void,
        }
    }
}

impl BoundFunction {
    /// Resolve `symbol` in `library` and prepare it for calls.
    pub fn bind(library: &LibraryHandle, symbol: &str, signature: FunctionSignature) -> Result<Self> {
        let address = library.resolve(symbol)?;
        debug!(
            function = symbol,
            library = library.name(),
            signature = %signature,
            "bound function"
        );
        Self::build(symbol, address as usize, signature, Some(library.clone()))
    }

    /// Bind a function from its address, for functions linked into the
    /// host binary.
    ///
    /// # Safety
    ///
    /// `address` must be a function whose native signature matches
    /// `signature`, and it must stay valid for as long as the binding (or
    /// any clone, or any worker built from it) exists.
    pub unsafe fn from_raw(name: &str, address: *const c_void, signature: FunctionSignature) -> Result<Self> {
        if address.is_null() {
            return Err(Error::NullFunctionPointer {
                symbol: name.to_string(),
                library: "<raw address>".to_string(),
            });
        }
        Self::build(name, address as usize, signature, None)
    }

    fn build(
        name: &str,
        address: usize,
        signature: FunctionSignature,
        library: Option<LibraryHandle>,
    ) -> Result<Self> {
        let interface = CallInterface::prepare(name, &signature)?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                address,
                signature,
                interface,
                _library: library,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.inner.signature
    }

    pub fn address(&self) -> *const c_void {
        self.inner.address as *const c_void
    }

    /// Call the function with positional arguments.
    ///
    /// Arguments declared `ptr<Name>` accept either a record, which is
    /// passed by reference and replaced in `args` by its state after the
    /// call, or a raw [`Value::Pointer`] (including NULL), passed as is.
    /// Struct returns come back as [`Value::Record`]; their pointer fields
    /// are raw addresses to follow with [`crate::Record::pointee`] and
    /// [`crate::Record::elements`].
    ///
    /// # Safety
    ///
    /// The bound address must really have the declared signature, every
    /// pointer argument must satisfy the callee's contract, and any
    /// strings the callee returns or writes into by-reference records must
    /// be NULL or readable NUL-terminated strings.
    pub unsafe fn call(&self, args: &mut [Value]) -> Result<Value> {
        let signature = &self.inner.signature;
        if args.len() != signature.arity() {
            return Err(Error::ArityMismatch {
                function: self.inner.name.clone(),
                expected: signature.arity(),
                actual: args.len(),
            });
        }

        let mut strings = Vec::new();
        let mut slots = signature
            .params()
            .iter()
            .zip(args.iter())
            .enumerate()
            .map(|(index, (ty, value))| self.prepare_arg(index, ty, value, &mut strings))
            .collect::<Result<Vec<_>>>()?;
        let mut arg_ptrs: Vec<*mut c_void> = slots.iter_mut().map(ArgSlot::as_arg_ptr).collect();

        let mut ret = vec![0u64; return_words(signature.returns())];

        trace!(function = %self.inner.name, args = args.len(), "calling native function");

        let code: unsafe extern "C" fn() = mem::transmute(self.inner.address);
        raw::ffi_call(
            &*self.inner.interface.cif as *const raw::ffi_cif as *mut raw::ffi_cif,
            Some(code),
            ret.as_mut_ptr() as *mut c_void,
            if arg_ptrs.is_empty() {
                ptr::null_mut()
            } else {
                arg_ptrs.as_mut_ptr()
            },
        );
        for (slot, arg) in slots.iter().zip(args.iter_mut()) {
            if let ArgSlot::Ref {
                buffer: Some(buffer),
                ..
            } = slot
            {
                *arg = Value::Record(buffer.to_record()?);
            }
        }

        // Argument strings stay alive until here: a returned pointer may
        // alias one of them.
        let result = read_return(signature.returns(), ret.as_ptr() as *const u8);
        drop(strings);
        result
    }

    fn prepare_arg(
        &self,
        index: usize,
        ty: &NativeType,
        value: &Value,
        strings: &mut Vec<CString>,
    ) -> Result<ArgSlot> {
        let target = || format!("argument {} of '{}'", index, self.inner.name);
        match ty {
            NativeType::Void => Err(Error::type_mismatch(target(), "non-void parameter", "void")),
            NativeType::Primitive(p) => {
                let canonical = coerce_primitive(*p, value.clone(), &target())?;
                let mut words = [0u64; 2];
                // SAFETY: 16 bytes cover every primitive.
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, 16)
                };
                marshal::write_primitive(bytes, 0, *p, &canonical, strings, &target())?;
                Ok(ArgSlot::Scalar(words))
            }
            NativeType::ByValue(layout) => Ok(ArgSlot::Struct(record_buffer(layout, value, &target())?)),
            NativeType::ByRef(layout) => match value {
                Value::Pointer(address) => Ok(ArgSlot::Ref {
                    address: *address,
                    buffer: None,
                }),
                other => {
                    let mut buffer = record_buffer(layout, other, &target())?;
                    Ok(ArgSlot::Ref {
                        address: buffer.as_mut_ptr() as usize,
                        buffer: Some(buffer),
                    })
                }
            },
        }
    }

    /// Move this function onto a dedicated background worker.
    pub fn into_worker(self) -> Result<WorkerFunction> {
        WorkerFunction::spawn(self)
    }
}

/// Marshal a host record for a struct parameter.
fn record_buffer(layout: &Arc<LayoutDescriptor>, value: &Value, target: &str) -> Result<NativeBuffer> {
    match coerce_record(layout, value.clone(), target)? {
        Value::Record(record) => marshal::marshal(&record),
        other => Err(Error::type_mismatch(
            target,
            format!("record of {}", layout.name()),
            other.type_name(),
        )),
    }
}

/// Return storage in words. libffi writes integer returns narrower than a
/// word as a full `ffi_arg`.
fn return_words(ty: &NativeType) -> usize {
    let bytes = match ty {
        NativeType::ByValue(layout) => layout.size(),
        _ => 8,
    };
    bytes.max(WORD_SIZE).div_ceil(mem::size_of::<u64>())
}

unsafe fn read_return(ty: &NativeType, ret: *const u8) -> Result<Value> {
    Ok(match ty {
        NativeType::Void => Value::Void,
        NativeType::Primitive(p) if p.size() < WORD_SIZE && (p.is_integer() || *p == Primitive::Bool) => {
            let word = ptr::read_unaligned(ret as *const usize);
            widened_return(*p, word)
        }
        NativeType::Primitive(p) => marshal::read_primitive(ret, *p),
        NativeType::ByValue(layout) => Value::Record(marshal::read_record(layout, ret)?),
        NativeType::ByRef(_) => Value::Pointer(ptr::read_unaligned(ret as *const usize)),
    })
}

fn widened_return(p: Primitive, word: usize) -> Value {
    match p {
        Primitive::I8 => Value::Int(word as i8 as i64),
        Primitive::I16 => Value::Int(word as i16 as i64),
        Primitive::I32 => Value::Int(word as i32 as i64),
        Primitive::U8 => Value::UInt(word as u8 as u64),
        Primitive::U16 => Value::UInt(word as u16 as u64),
        Primitive::Bool => Value::Bool(word as u8 != 0),
        // 4-byte `long` / `ssize_t` where the word is wider (LLP64)
        p if p.is_signed() => Value::Int(word as i32 as i64),
        _ => Value::UInt(word as u32 as u64),
    }
}

impl fmt::Debug for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFunction")
            .field("name", &self.inner.name)
            .field("address", &format_args!("{:#x}", self.inner.address))
            .field("signature", &format_args!("{}", self.inner.signature))
            .finish()
    }
}

impl fmt::Display for BoundFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.inner.name, self.inner.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FieldSpec, LayoutRegistry};

    extern "C" fn add_i32(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn negate_i8(a: i8) -> i8 {
        a.wrapping_neg()
    }

    #[repr(C)]
    struct Pair {
        a: u8,
        b: u64,
    }

    extern "C" fn sum_pair(p: Pair) -> u64 {
        p.a as u64 + p.b
    }

    extern "C" fn swap_pair(p: *mut Pair) {
        unsafe {
            let a = (*p).a;
            (*p).a = (*p).b as u8;
            (*p).b = a as u64;
        }
    }

    fn pair_registry() -> LayoutRegistry {
        let mut registry = LayoutRegistry::new();
        registry
            .define_layout("Pair", [FieldSpec::new("a", "uint8"), FieldSpec::new("b", "uint64")])
            .unwrap();
        registry
    }

    fn sig(registry: &LayoutRegistry, ret: &str, params: &[&str]) -> FunctionSignature {
        FunctionSignature::parse(registry, ret, params.iter().copied()).unwrap()
    }

    #[test]
    fn test_scalar_call() {
        let registry = LayoutRegistry::new();
        let f = unsafe {
            BoundFunction::from_raw("add_i32", add_i32 as *const c_void, sig(&registry, "int32", &["int32", "int32"]))
        }
        .unwrap();
        let out = unsafe { f.call(&mut [Value::Int(40), Value::Int(2)]) }.unwrap();
        assert_eq!(out, Value::Int(42));
    }

    #[test]
    fn test_narrow_signed_return() {
        let registry = LayoutRegistry::new();
        let f = unsafe {
            BoundFunction::from_raw("negate_i8", negate_i8 as *const c_void, sig(&registry, "int8", &["int8"]))
        }
        .unwrap();
        let out = unsafe { f.call(&mut [Value::Int(5)]) }.unwrap();
        assert_eq!(out, Value::Int(-5));
    }

    #[test]
    fn test_widened_return_keeps_sign() {
        let minus_one = (-1i32) as u32 as usize;
        assert_eq!(widened_return(Primitive::Long, minus_one), Value::Int(-1));
        assert_eq!(widened_return(Primitive::SSize, minus_one), Value::Int(-1));
        assert_eq!(widened_return(Primitive::I32, minus_one), Value::Int(-1));
        assert_eq!(widened_return(Primitive::U32, minus_one), Value::UInt(u32::MAX as u64));
        assert_eq!(widened_return(Primitive::ULong, minus_one), Value::UInt(u32::MAX as u64));
    }

    #[test]
    fn test_struct_by_value_and_by_ref() {
        let registry = pair_registry();
        let layout = registry.layout("Pair").unwrap();
        let pair = crate::Record::new(layout)
            .with("a", 3u8)
            .unwrap()
            .with("b", 39u64)
            .unwrap();

        let sum = unsafe {
            BoundFunction::from_raw("sum_pair", sum_pair as *const c_void, sig(&registry, "uint64", &["struct<Pair>"]))
        }
        .unwrap();
        let mut args = [Value::Record(pair.clone())];
        assert_eq!(unsafe { sum.call(&mut args) }.unwrap(), Value::UInt(42));
        assert_eq!(args[0], Value::Record(pair.clone()));

        let swap = unsafe {
            BoundFunction::from_raw("swap_pair", swap_pair as *const c_void, sig(&registry, "void", &["ptr<Pair>"]))
        }
        .unwrap();
        let mut args = [Value::Record(pair)];
        assert_eq!(unsafe { swap.call(&mut args) }.unwrap(), Value::Void);
        let swapped = args[0].as_record().unwrap();
        assert_eq!(swapped.get("a").unwrap(), &Value::UInt(39));
        assert_eq!(swapped.get("b").unwrap(), &Value::UInt(3));
    }

    #[test]
    fn test_arity_checked_first() {
        let registry = LayoutRegistry::new();
        let f = unsafe {
            BoundFunction::from_raw("add_i32", add_i32 as *const c_void, sig(&registry, "int32", &["int32", "int32"]))
        }
        .unwrap();
        let err = unsafe { f.call(&mut [Value::Int(1)]) }.unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { expected: 2, actual: 1, .. }));

        let err = unsafe { f.call(&mut [Value::Int(1), Value::from("two")]) }.unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_null_address_rejected() {
        let registry = LayoutRegistry::new();
        let err = unsafe { BoundFunction::from_raw("nothing", ptr::null(), sig(&registry, "void", &[])) }
            .unwrap_err();
        assert!(matches!(err, Error::NullFunctionPointer { .. }));
    }

    #[test]
    fn test_display() {
        let registry = LayoutRegistry::new();
        let f = unsafe {
            BoundFunction::from_raw("add_i32", add_i32 as *const c_void, sig(&registry, "int32", &["int32", "int32"]))
        }
        .unwrap();
        assert_eq!(f.to_string(), "add_i32(int32, int32) -> int32");
    }
}
