//! Primitive kinds and the kind-string grammar
//!
//! The same strings are used by struct field declarations and by function
//! signatures:
//!
//! ```text
//! int8 int16 int32 int64 uint8 uint16 uint32 uint64
//! int uint long ulong size_t ssize_t float double bool
//! pointer string void
//! struct<Name>            nested layout, embedded by value
//! ptr<Name>               pointer to a layout
//! ptr_array<Name, len>    pointer to an array of pointers to Name,
//!                         element count held by sibling field `len`
//! ```

use std::fmt;
use std::mem;
use std::os::raw::c_long;

/// Size in bytes of a native pointer
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// Scalar kinds that fit in a single machine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    /// C `long`
    Long,
    /// C `unsigned long`
    ULong,
    /// `size_t`
    Size,
    /// `ssize_t`
    SSize,
    F32,
    F64,
    /// C `_Bool`
    Bool,
    /// Opaque `void*`
    Pointer,
    /// NUL-terminated `char*`
    String,
}

impl Primitive {
    /// Parse a primitive kind name.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "int8" | "i8" | "char" => Some(Primitive::I8),
            "int16" | "i16" | "short" => Some(Primitive::I16),
            "int32" | "i32" | "int" => Some(Primitive::I32),
            "int64" | "i64" | "longlong" => Some(Primitive::I64),
            "uint8" | "u8" | "uchar" | "byte" => Some(Primitive::U8),
            "uint16" | "u16" | "ushort" => Some(Primitive::U16),
            "uint32" | "u32" | "uint" => Some(Primitive::U32),
            "uint64" | "u64" | "ulonglong" => Some(Primitive::U64),
            "long" => Some(Primitive::Long),
            "ulong" => Some(Primitive::ULong),
            "size_t" | "usize" => Some(Primitive::Size),
            "ssize_t" | "isize" => Some(Primitive::SSize),
            "float" | "f32" => Some(Primitive::F32),
            "double" | "f64" => Some(Primitive::F64),
            "bool" => Some(Primitive::Bool),
            "pointer" | "void*" => Some(Primitive::Pointer),
            "string" | "cstring" => Some(Primitive::String),
            _ => None,
        }
    }

    /// Canonical kind name, accepted back by [`Primitive::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            Primitive::I8 => "int8",
            Primitive::I16 => "int16",
            Primitive::I32 => "int32",
            Primitive::I64 => "int64",
            Primitive::U8 => "uint8",
            Primitive::U16 => "uint16",
            Primitive::U32 => "uint32",
            Primitive::U64 => "uint64",
            Primitive::Long => "long",
            Primitive::ULong => "ulong",
            Primitive::Size => "size_t",
            Primitive::SSize => "ssize_t",
            Primitive::F32 => "float",
            Primitive::F64 => "double",
            Primitive::Bool => "bool",
            Primitive::Pointer => "pointer",
            Primitive::String => "string",
        }
    }

    /// Storage size in bytes.
    pub fn size(self) -> usize {
        match self {
            Primitive::I8 | Primitive::U8 | Primitive::Bool => 1,
            Primitive::I16 | Primitive::U16 => 2,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 4,
            Primitive::I64 | Primitive::U64 | Primitive::F64 => 8,
            Primitive::Long | Primitive::ULong => mem::size_of::<c_long>(),
            Primitive::Size | Primitive::SSize | Primitive::Pointer | Primitive::String => {
                WORD_SIZE
            }
        }
    }

    /// Natural alignment. Integers and floats align to their size, pointers
    /// and word integers to the word size.
    pub fn align(self) -> usize {
        self.size()
    }

    pub fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::I8
                | Primitive::I16
                | Primitive::I32
                | Primitive::I64
                | Primitive::Long
                | Primitive::SSize
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            Primitive::U8
                | Primitive::U16
                | Primitive::U32
                | Primitive::U64
                | Primitive::ULong
                | Primitive::Size
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F64)
    }

    /// Inclusive value range of an integer kind.
    pub(crate) fn int_range(self) -> Option<(i128, i128)> {
        let bits = (self.size() * 8) as u32;
        if self.is_signed() {
            Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1))
        } else if self.is_unsigned() {
            Some((0, (1i128 << bits) - 1))
        } else {
            None
        }
    }

    /// Kinds that C's default argument promotions would widen; they cannot
    /// appear in the variadic part of a call.
    pub(crate) fn is_promotable(self) -> bool {
        matches!(
            self,
            Primitive::I8
                | Primitive::I16
                | Primitive::U8
                | Primitive::U16
                | Primitive::Bool
                | Primitive::F32
        )
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed, not yet resolved, kind string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindSpec {
    Void,
    Primitive(Primitive),
    /// `struct<Name>`
    Struct(String),
    /// `ptr<Name>`
    Ptr(String),
    /// `ptr_array<Name, len>`
    PtrArray { layout: String, len_field: String },
}

impl KindSpec {
    /// Parse a kind string. Returns `None` for anything unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("void") {
            return Some(KindSpec::Void);
        }
        if let Some(p) = Primitive::from_name(s) {
            return Some(KindSpec::Primitive(p));
        }

        let open = s.find('<')?;
        if !s.ends_with('>') {
            return None;
        }
        let head = s[..open].trim();
        let inner = s[open + 1..s.len() - 1].trim();

        match head {
            "struct" => identifier(inner).map(|n| KindSpec::Struct(n.to_string())),
            "ptr" => identifier(inner).map(|n| KindSpec::Ptr(n.to_string())),
            "ptr_array" => {
                let (layout, len_field) = inner.split_once(',')?;
                Some(KindSpec::PtrArray {
                    layout: identifier(layout)?.to_string(),
                    len_field: identifier(len_field)?.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for KindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindSpec::Void => f.write_str("void"),
            KindSpec::Primitive(p) => write!(f, "{}", p),
            KindSpec::Struct(name) => write!(f, "struct<{}>", name),
            KindSpec::Ptr(name) => write!(f, "ptr<{}>", name),
            KindSpec::PtrArray { layout, len_field } => {
                write!(f, "ptr_array<{}, {}>", layout, len_field)
            }
        }
    }
}

fn identifier(s: &str) -> Option<&str> {
    let s = s.trim();
    let mut chars = s.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(s)
    } else {
        None
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
/// `None` on overflow.
pub(crate) fn round_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_aliases() {
        assert_eq!(Primitive::from_name("uint32"), Some(Primitive::U32));
        assert_eq!(Primitive::from_name("int"), Some(Primitive::I32));
        assert_eq!(Primitive::from_name("Double"), Some(Primitive::F64));
        assert_eq!(Primitive::from_name("string"), Some(Primitive::String));
        assert_eq!(Primitive::from_name("quaternion"), None);
    }

    #[test]
    fn test_word_kinds_have_word_size() {
        assert_eq!(Primitive::Pointer.size(), WORD_SIZE);
        assert_eq!(Primitive::String.align(), WORD_SIZE);
        assert_eq!(Primitive::Size.size(), WORD_SIZE);
    }

    #[test]
    fn test_int_ranges() {
        assert_eq!(Primitive::I8.int_range(), Some((-128, 127)));
        assert_eq!(Primitive::U16.int_range(), Some((0, 65535)));
        assert_eq!(
            Primitive::U64.int_range(),
            Some((0, u64::MAX as i128))
        );
        assert_eq!(Primitive::F64.int_range(), None);
    }

    #[test]
    fn test_parse_compound_kinds() {
        assert_eq!(
            KindSpec::parse("ptr<MyCString>"),
            Some(KindSpec::Ptr("MyCString".to_string()))
        );
        assert_eq!(
            KindSpec::parse("struct< TimeVal >"),
            Some(KindSpec::Struct("TimeVal".to_string()))
        );
        assert_eq!(
            KindSpec::parse("ptr_array<MyCString, len>"),
            Some(KindSpec::PtrArray {
                layout: "MyCString".to_string(),
                len_field: "len".to_string(),
            })
        );
        assert_eq!(KindSpec::parse("void"), Some(KindSpec::Void));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(KindSpec::parse("ptr<>"), None);
        assert_eq!(KindSpec::parse("ptr<1abc>"), None);
        assert_eq!(KindSpec::parse("ptr_array<A>"), None);
        assert_eq!(KindSpec::parse("box<A>"), None);
        assert_eq!(KindSpec::parse("ptr<A"), None);
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["uint32", "ptr<A>", "struct<B>", "ptr_array<C, n>", "void"] {
            let kind = KindSpec::parse(s).unwrap();
            assert_eq!(KindSpec::parse(&kind.to_string()), Some(kind));
        }
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), Some(0));
        assert_eq!(round_up(5, 4), Some(8));
        assert_eq!(round_up(12, 8), Some(16));
        assert_eq!(round_up(16, 8), Some(16));
        assert_eq!(round_up(usize::MAX - 2, 8), None);
    }
}
