//! Marshal/unmarshal engine
//!
//! Two kinds of native memory are handled here:
//!
//! - [`NativeBuffer`]: bytes owned by this crate. Argument buffers are
//!   created per call and released when the call returns, together with any
//!   strings they point to.
//! - [`StructView`]: a borrowed view over memory owned by the native side
//!   (returned structs, pointees, pointer arrays). Views never free
//!   anything and read fields lazily, on access.
//!
//! String ownership: strings written by [`marshal`] are copied into
//! NUL-terminated buffers owned by the resulting [`NativeBuffer`]; strings
//! read from native memory are copied into host `String`s and the native
//! original is left untouched.

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kind::Primitive;
use crate::layout::{FieldKind, LayoutDescriptor};
use crate::value::{Record, Value};

/// Fixed-size byte region conforming to a layout, owned by this crate.
///
/// Storage is word-aligned so the buffer can be handed to native code
/// directly, by value or by address.
#[derive(Debug)]
pub struct NativeBuffer {
    layout: Arc<LayoutDescriptor>,
    storage: Vec<u64>,
    strings: Vec<CString>,
}

impl NativeBuffer {
    /// An all-zero buffer for `layout`.
    pub fn zeroed(layout: Arc<LayoutDescriptor>) -> Self {
        let words = layout.size().div_ceil(mem::size_of::<u64>()).max(1);
        Self {
            layout,
            storage: vec![0u64; words],
            strings: Vec::new(),
        }
    }

    pub fn layout(&self) -> &Arc<LayoutDescriptor> {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: storage holds at least `len()` initialized bytes.
        unsafe { slice::from_raw_parts(self.storage.as_ptr() as *const u8, self.len()) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len();
        // SAFETY: storage holds at least `len` initialized bytes.
        unsafe { slice::from_raw_parts_mut(self.storage.as_mut_ptr() as *mut u8, len) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr() as *const u8
    }

    /// Address handed to native code for by-reference passing.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.storage.as_mut_ptr() as *mut u8
    }

    /// Re-read the buffer into a host record.
    ///
    /// String fields are copied out; pointer fields are returned as raw
    /// addresses.
    pub fn to_record(&self) -> Result<Record> {
        // SAFETY: the buffer spans the whole layout. String fields are
        // either NULL or point at strings owned by `self.strings`, unless
        // native code rewrote them during a by-reference call, in which
        // case the caller of that call vouched for them.
        unsafe { read_record(&self.layout, self.as_ptr()) }
    }
}

/// Serialize a record into an owned native buffer.
pub fn marshal(record: &Record) -> Result<NativeBuffer> {
    let mut buffer = NativeBuffer::zeroed(Arc::clone(record.layout()));
    let mut strings = Vec::new();
    write_record(record, buffer.as_bytes_mut(), 0, &mut strings)?;
    buffer.strings = strings;
    Ok(buffer)
}

/// Deserialize `bytes` as an instance of `layout`.
///
/// # Safety
///
/// Every `string` field in `bytes` (including nested structs) must be NULL
/// or point to a readable NUL-terminated string.
pub unsafe fn unmarshal(layout: &Arc<LayoutDescriptor>, bytes: &[u8]) -> Result<Record> {
    if bytes.len() < layout.size() {
        return Err(Error::type_mismatch(
            format!("buffer for {}", layout.name()),
            format!("{} bytes", layout.size()),
            format!("{} bytes", bytes.len()),
        ));
    }
    read_record(layout, bytes.as_ptr())
}

fn write_record(
    record: &Record,
    bytes: &mut [u8],
    base: usize,
    strings: &mut Vec<CString>,
) -> Result<()> {
    let layout = record.layout();
    for (field, value) in layout.fields().iter().zip(record.values()) {
        let offset = base + field.offset();
        match (field.kind(), value) {
            (FieldKind::Primitive(p), value) => {
                let target = format!("field '{}.{}'", layout.name(), field.name());
                write_primitive(bytes, offset, *p, value, strings, &target)?;
            }
            (FieldKind::Struct(_), Value::Record(nested)) => {
                write_record(nested, bytes, offset, strings)?;
            }
            (FieldKind::Ptr(_) | FieldKind::PtrArray { .. }, Value::Pointer(addr)) => {
                put(bytes, offset, &addr.to_ne_bytes());
            }
            (kind, other) => {
                return Err(Error::type_mismatch(
                    format!("field '{}.{}'", layout.name(), field.name()),
                    kind.describe(layout),
                    other.type_name(),
                ))
            }
        }
    }
    Ok(())
}

/// Write one canonical primitive value at `offset`. Strings are copied into
/// `strings`, which must outlive every native read of `bytes`.
pub(crate) fn write_primitive(
    bytes: &mut [u8],
    offset: usize,
    p: Primitive,
    value: &Value,
    strings: &mut Vec<CString>,
    target: &str,
) -> Result<()> {
    let mismatch = || Error::type_mismatch(target, p.name(), value.type_name());

    match (p, value) {
        (Primitive::I8, Value::Int(v)) => put(bytes, offset, &(*v as i8).to_ne_bytes()),
        (Primitive::I16, Value::Int(v)) => put(bytes, offset, &(*v as i16).to_ne_bytes()),
        (Primitive::I32, Value::Int(v)) => put(bytes, offset, &(*v as i32).to_ne_bytes()),
        (Primitive::I64, Value::Int(v)) => put(bytes, offset, &v.to_ne_bytes()),
        (Primitive::Long, Value::Int(v)) => put(bytes, offset, &(*v as std::os::raw::c_long).to_ne_bytes()),
        (Primitive::SSize, Value::Int(v)) => put(bytes, offset, &(*v as isize).to_ne_bytes()),
        (Primitive::U8, Value::UInt(v)) => put(bytes, offset, &(*v as u8).to_ne_bytes()),
        (Primitive::U16, Value::UInt(v)) => put(bytes, offset, &(*v as u16).to_ne_bytes()),
        (Primitive::U32, Value::UInt(v)) => put(bytes, offset, &(*v as u32).to_ne_bytes()),
        (Primitive::U64, Value::UInt(v)) => put(bytes, offset, &v.to_ne_bytes()),
        (Primitive::ULong, Value::UInt(v)) => put(bytes, offset, &(*v as std::os::raw::c_ulong).to_ne_bytes()),
        (Primitive::Size, Value::UInt(v)) => put(bytes, offset, &(*v as usize).to_ne_bytes()),
        (Primitive::F32, Value::Float(v)) => put(bytes, offset, &(*v as f32).to_ne_bytes()),
        (Primitive::F64, Value::Float(v)) => put(bytes, offset, &v.to_ne_bytes()),
        (Primitive::Bool, Value::Bool(v)) => put(bytes, offset, &[*v as u8]),
        (Primitive::Pointer, Value::Pointer(addr)) => put(bytes, offset, &addr.to_ne_bytes()),
        (Primitive::String, Value::Str(None)) => put(bytes, offset, &0usize.to_ne_bytes()),
        (Primitive::String, Value::Str(Some(s))) => {
            let owned = CString::new(s.as_str()).map_err(|_| {
                Error::type_mismatch(target, "string without interior NUL", "string containing NUL")
            })?;
            let addr = owned.as_ptr() as usize;
            strings.push(owned);
            put(bytes, offset, &addr.to_ne_bytes());
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn put(bytes: &mut [u8], offset: usize, src: &[u8]) {
    bytes[offset..offset + src.len()].copy_from_slice(src);
}

/// Read a whole record starting at `base`.
///
/// # Safety
///
/// `base` must be valid for reads of `layout.size()` bytes and every string
/// field must be NULL or a readable NUL-terminated string.
pub(crate) unsafe fn read_record(layout: &Arc<LayoutDescriptor>, base: *const u8) -> Result<Record> {
    let mut values = Vec::with_capacity(layout.fields().len());
    for field in layout.fields() {
        let at = base.add(field.offset());
        let value = match field.kind() {
            FieldKind::Primitive(p) => read_primitive(at, *p),
            FieldKind::Struct(nested) => Value::Record(read_record(nested, at)?),
            FieldKind::Ptr(_) | FieldKind::PtrArray { .. } => Value::Pointer(read_word(at)),
        };
        values.push(value);
    }
    Ok(Record::from_parts(Arc::clone(layout), values))
}

/// Read one primitive at `at`, producing its canonical host value.
///
/// # Safety
///
/// `at` must be valid for reads of `p.size()` bytes; for `string` the
/// stored pointer must be NULL or a readable NUL-terminated string.
pub(crate) unsafe fn read_primitive(at: *const u8, p: Primitive) -> Value {
    match p {
        Primitive::I8 => Value::Int(ptr::read_unaligned(at as *const i8) as i64),
        Primitive::I16 => Value::Int(ptr::read_unaligned(at as *const i16) as i64),
        Primitive::I32 => Value::Int(ptr::read_unaligned(at as *const i32) as i64),
        Primitive::I64 => Value::Int(ptr::read_unaligned(at as *const i64)),
        Primitive::Long => {
            Value::Int(ptr::read_unaligned(at as *const std::os::raw::c_long) as i64)
        }
        Primitive::SSize => Value::Int(ptr::read_unaligned(at as *const isize) as i64),
        Primitive::U8 => Value::UInt(ptr::read_unaligned(at) as u64),
        Primitive::U16 => Value::UInt(ptr::read_unaligned(at as *const u16) as u64),
        Primitive::U32 => Value::UInt(ptr::read_unaligned(at as *const u32) as u64),
        Primitive::U64 => Value::UInt(ptr::read_unaligned(at as *const u64)),
        Primitive::ULong => {
            Value::UInt(ptr::read_unaligned(at as *const std::os::raw::c_ulong) as u64)
        }
        Primitive::Size => Value::UInt(read_word(at) as u64),
        Primitive::F32 => Value::Float(ptr::read_unaligned(at as *const f32) as f64),
        Primitive::F64 => Value::Float(ptr::read_unaligned(at as *const f64)),
        Primitive::Bool => Value::Bool(ptr::read_unaligned(at) != 0),
        Primitive::Pointer => Value::Pointer(read_word(at)),
        Primitive::String => Value::Str(read_c_string(read_word(at) as *const u8)),
    }
}

/// Copy a native string. NULL becomes `None`; invalid UTF-8 is replaced
/// lossily rather than rejected.
///
/// # Safety
///
/// `s` must be NULL or point to a readable NUL-terminated string.
pub(crate) unsafe fn read_c_string(s: *const u8) -> Option<String> {
    if s.is_null() {
        None
    } else {
        Some(CStr::from_ptr(s as *const _).to_string_lossy().into_owned())
    }
}

unsafe fn read_word(at: *const u8) -> usize {
    ptr::read_unaligned(at as *const usize)
}

/// Borrowed view over a native struct.
///
/// The memory belongs to the native library; the view only reads it.
/// Nested pointers are dereferenced lazily through
/// [`StructView::pointee`] and [`StructView::elements`].
#[derive(Debug, Clone)]
pub struct StructView<'a> {
    layout: Arc<LayoutDescriptor>,
    base: *const u8,
    _memory: PhantomData<&'a [u8]>,
}

impl<'a> StructView<'a> {
    /// Create a view over `ptr`. Returns `None` for NULL.
    ///
    /// # Safety
    ///
    /// For the whole lifetime `'a`, `ptr` must be valid for reads of
    /// `layout.size()` bytes, and every pointer reachable through the
    /// layout's `string`, `ptr<..>` and `ptr_array<..>` fields must be NULL
    /// or valid in the same sense.
    pub unsafe fn from_raw(layout: Arc<LayoutDescriptor>, ptr: *const u8) -> Option<Self> {
        if ptr.is_null() {
            None
        } else {
            Some(Self {
                layout,
                base: ptr,
                _memory: PhantomData,
            })
        }
    }

    pub fn layout(&self) -> &Arc<LayoutDescriptor> {
        &self.layout
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.base
    }

    /// Read one field. Strings are copied, nested structs are copied into a
    /// [`Record`], pointer fields come back as raw addresses.
    pub fn get(&self, field: &str) -> Result<Value> {
        let index = self.layout.require_field(field)?;
        let descriptor = &self.layout.fields()[index];
        // SAFETY: guaranteed by the contract of `from_raw`.
        unsafe {
            let at = self.base.add(descriptor.offset());
            Ok(match descriptor.kind() {
                FieldKind::Primitive(p) => read_primitive(at, *p),
                FieldKind::Struct(nested) => Value::Record(read_record(nested, at)?),
                FieldKind::Ptr(_) | FieldKind::PtrArray { .. } => Value::Pointer(read_word(at)),
            })
        }
    }

    /// Follow a `ptr<..>` field. `Ok(None)` if the pointer is NULL.
    pub fn pointee(&self, field: &str) -> Result<Option<StructView<'a>>> {
        let (layout, addr) = pointer_field(&self.layout, field, |index| {
            // SAFETY: the field lies within the viewed struct.
            unsafe { read_word(self.base.add(self.layout.fields()[index].offset())) }
        })?;
        // SAFETY: the pointee is covered by the contract of `from_raw`.
        Ok(unsafe { StructView::from_raw(layout, addr as *const u8) })
    }

    /// Walk a `ptr_array<..>` field using its sibling length field.
    pub fn elements(&self, field: &str) -> Result<PointerArray<'a>> {
        let spec = array_field(&self.layout, field)?;
        // SAFETY: both fields lie within the viewed struct.
        let (len_value, base) = unsafe {
            let fields = self.layout.fields();
            (
                read_primitive(self.base.add(fields[spec.len_field].offset()), spec.len_kind),
                read_word(self.base.add(fields[spec.index].offset())),
            )
        };
        // SAFETY: the array is covered by the contract of `from_raw`.
        unsafe { PointerArray::new(field, spec.pointee, base, &len_value) }
    }

    /// Copy the viewed struct into a host record.
    pub fn to_record(&self) -> Result<Record> {
        // SAFETY: guaranteed by the contract of `from_raw`.
        unsafe { read_record(&self.layout, self.base) }
    }
}

impl Record {
    /// Follow a `ptr<..>` field of a record returned by native code.
    ///
    /// # Safety
    ///
    /// The address stored in the field must be NULL or satisfy the contract
    /// of [`StructView::from_raw`] for as long as the view is used.
    pub unsafe fn pointee(&self, field: &str) -> Result<Option<StructView<'_>>> {
        let (layout, addr) = pointer_field(self.layout(), field, |index| {
            self.values()[index].as_pointer().unwrap_or(0)
        })?;
        Ok(StructView::from_raw(layout, addr as *const u8))
    }

    /// Walk a `ptr_array<..>` field of a record returned by native code.
    ///
    /// # Safety
    ///
    /// The array address stored in the field must be valid for reads of
    /// `len` words, and every non-NULL slot must satisfy the contract of
    /// [`StructView::from_raw`] for as long as the views are used.
    pub unsafe fn elements(&self, field: &str) -> Result<PointerArray<'_>> {
        let spec = array_field(self.layout(), field)?;
        let base = self.values()[spec.index].as_pointer().unwrap_or(0);
        let len_value = self.values()[spec.len_field].clone();
        PointerArray::new(field, spec.pointee, base, &len_value)
    }
}

fn pointer_field(
    layout: &Arc<LayoutDescriptor>,
    field: &str,
    read: impl FnOnce(usize) -> usize,
) -> Result<(Arc<LayoutDescriptor>, usize)> {
    let index = layout.require_field(field)?;
    match layout.fields()[index].kind() {
        FieldKind::Ptr(pointee) => Ok((Arc::clone(pointee), read(index))),
        other => Err(Error::type_mismatch(
            format!("field '{}.{}'", layout.name(), field),
            "ptr<..>",
            other.describe(layout),
        )),
    }
}

struct ArrayField {
    index: usize,
    len_field: usize,
    len_kind: Primitive,
    pointee: Arc<LayoutDescriptor>,
}

fn array_field(layout: &Arc<LayoutDescriptor>, field: &str) -> Result<ArrayField> {
    let index = layout.require_field(field)?;
    match layout.fields()[index].kind() {
        FieldKind::PtrArray {
            layout: pointee,
            len_field,
        } => {
            let len_kind = match layout.fields()[*len_field].kind() {
                FieldKind::Primitive(p) if p.is_integer() => *p,
                other => {
                    return Err(Error::type_mismatch(
                        format!("length of '{}.{}'", layout.name(), field),
                        "integer",
                        other.describe(layout),
                    ))
                }
            };
            Ok(ArrayField {
                index,
                len_field: *len_field,
                len_kind,
                pointee: Arc::clone(pointee),
            })
        }
        other => Err(Error::type_mismatch(
            format!("field '{}.{}'", layout.name(), field),
            "ptr_array<..>",
            other.describe(layout),
        )),
    }
}

/// A native array of pointers to structs, with an authoritative length.
///
/// Element `i` lives at `base + i * size_of::<*const T>()`. A NULL slot
/// within the declared length is a contract violation by the native
/// library and surfaces as [`Error::NullElement`].
#[derive(Debug, Clone)]
pub struct PointerArray<'a> {
    field: String,
    layout: Arc<LayoutDescriptor>,
    base: *const usize,
    len: usize,
    _memory: PhantomData<&'a [usize]>,
}

impl<'a> PointerArray<'a> {
    /// # Safety
    ///
    /// `base` must be valid for reads of `len` words, where `len` is read
    /// from `len_value`; non-NULL slots must satisfy the contract of
    /// [`StructView::from_raw`].
    unsafe fn new(
        field: &str,
        layout: Arc<LayoutDescriptor>,
        base: usize,
        len_value: &Value,
    ) -> Result<Self> {
        let len = len_value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                Error::type_mismatch(
                    format!("length of '{}'", field),
                    "non-negative length",
                    len_value.to_string(),
                )
            })?;
        Ok(Self {
            field: field.to_string(),
            layout,
            base: base as *const usize,
            len,
            _memory: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn layout(&self) -> &Arc<LayoutDescriptor> {
        &self.layout
    }

    /// Raw address stored in slot `index`.
    pub fn slot(&self, index: usize) -> Result<usize> {
        if index >= self.len {
            return Err(Error::OutOfBounds {
                field: self.field.clone(),
                index,
                len: self.len,
            });
        }
        if self.base.is_null() {
            return Err(self.null_element(index));
        }
        // SAFETY: `index < len` and the array holds `len` words.
        Ok(unsafe { ptr::read_unaligned(self.base.add(index)) })
    }

    /// Dereference element `index`.
    pub fn get(&self, index: usize) -> Result<StructView<'a>> {
        let addr = self.slot(index)?;
        // SAFETY: non-NULL slots satisfy `from_raw` per the contract of `new`.
        unsafe { StructView::from_raw(Arc::clone(&self.layout), addr as *const u8) }
            .ok_or_else(|| self.null_element(index))
    }

    /// Elements in index order. Every index in `0..len` is yielded, NULL
    /// slots as errors.
    pub fn iter(&self) -> impl Iterator<Item = Result<StructView<'a>>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// Copy every element into host records, failing on the first NULL slot.
    pub fn to_records(&self) -> Result<Vec<Record>> {
        self.iter().map(|view| view?.to_record()).collect()
    }

    fn null_element(&self, index: usize) -> Error {
        Error::NullElement {
            field: self.field.clone(),
            index,
            len: self.len,
        }
    }
}
