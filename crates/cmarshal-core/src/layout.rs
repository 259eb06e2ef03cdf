//! Layout registry
//!
//! A [`LayoutDescriptor`] is the byte-level shape of a native struct: ordered
//! fields with offsets and sizes, a total size and an alignment. Layouts are
//! defined once through a [`LayoutRegistry`] and are immutable afterwards;
//! share the finished registry behind an `Arc`.
//!
//! Layout rules follow the C ABI: each field starts at the next offset that
//! satisfies its natural alignment, the layout's alignment is the largest
//! field alignment, and the total size is rounded up to that alignment.
//! Pointer-to-layout and pointer-array fields occupy exactly one word no
//! matter how large the pointee is.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::kind::{round_up, KindSpec, Primitive, WORD_SIZE};

/// Largest total size a layout may have.
pub const MAX_LAYOUT_SIZE: usize = 1 << 24;

/// Declaration of a single field, before layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: String,
    /// Explicit byte offset. When absent the next naturally aligned offset
    /// is used.
    pub offset: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            offset: None,
        }
    }

    /// Pin the field at an explicit byte offset.
    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Resolved kind of a laid-out field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Primitive(Primitive),
    /// Nested layout embedded by value
    Struct(Arc<LayoutDescriptor>),
    /// Pointer to a single instance of a layout
    Ptr(Arc<LayoutDescriptor>),
    /// Pointer to `len` word-sized pointers, each pointing to an instance
    /// of the layout. `len_field` indexes the sibling length field.
    PtrArray {
        layout: Arc<LayoutDescriptor>,
        len_field: usize,
    },
}

impl FieldKind {
    pub fn size(&self) -> usize {
        match self {
            FieldKind::Primitive(p) => p.size(),
            FieldKind::Struct(layout) => layout.size(),
            FieldKind::Ptr(_) | FieldKind::PtrArray { .. } => WORD_SIZE,
        }
    }

    pub fn align(&self) -> usize {
        match self {
            FieldKind::Primitive(p) => p.align(),
            FieldKind::Struct(layout) => layout.align(),
            FieldKind::Ptr(_) | FieldKind::PtrArray { .. } => WORD_SIZE,
        }
    }

    /// Human-readable kind, used in diagnostics.
    pub fn describe(&self, owner: &LayoutDescriptor) -> String {
        match self {
            FieldKind::Primitive(p) => p.name().to_string(),
            FieldKind::Struct(layout) => format!("struct<{}>", layout.name()),
            FieldKind::Ptr(layout) => format!("ptr<{}>", layout.name()),
            FieldKind::PtrArray { layout, len_field } => format!(
                "ptr_array<{}, {}>",
                layout.name(),
                owner.fields[*len_field].name
            ),
        }
    }
}

/// A laid-out field.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    name: String,
    kind: FieldKind,
    offset: usize,
    size: usize,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// First byte past the field.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Byte-level shape of a native struct.
#[derive(Debug)]
pub struct LayoutDescriptor {
    name: String,
    fields: Vec<FieldDescriptor>,
    size: usize,
    align: usize,
}

impl LayoutDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Like [`LayoutDescriptor::field_index`] but reports a missing field as
    /// an error.
    pub fn require_field(&self, name: &str) -> Result<usize> {
        self.field_index(name).ok_or_else(|| Error::UnknownField {
            layout: self.name.clone(),
            field: name.to_string(),
        })
    }
}

impl PartialEq for LayoutDescriptor {
    fn eq(&self, other: &Self) -> bool {
        // Registries reject duplicate names, so a name identifies a layout.
        self.name == other.name && self.size == other.size && self.align == other.align
    }
}

impl fmt::Display for LayoutDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (size {}, align {})",
            self.name, self.size, self.align
        )?;
        for field in &self.fields {
            writeln!(
                f,
                "  {:>4}  {:<16} {} ({} bytes)",
                field.offset,
                field.name,
                field.kind.describe(self),
                field.size
            )?;
        }
        Ok(())
    }
}

/// Registry of named layouts.
#[derive(Debug, Default)]
pub struct LayoutRegistry {
    layouts: HashMap<String, Arc<LayoutDescriptor>>,
    order: Vec<String>,
}

impl LayoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define and register a layout.
    ///
    /// Nested and pointed-to layouts must already be registered. A layout
    /// cannot refer to itself.
    pub fn define_layout<I>(&mut self, name: &str, fields: I) -> Result<Arc<LayoutDescriptor>>
    where
        I: IntoIterator<Item = FieldSpec>,
    {
        if self.layouts.contains_key(name) {
            return Err(Error::DuplicateLayout {
                name: name.to_string(),
            });
        }

        let layout = Arc::new(self.compute_layout(name, fields)?);

        debug!(
            layout = %layout.name,
            size = layout.size,
            align = layout.align,
            fields = layout.fields.len(),
            "defined layout"
        );

        self.order.push(name.to_string());
        self.layouts.insert(name.to_string(), Arc::clone(&layout));
        Ok(layout)
    }

    pub fn get(&self, name: &str) -> Option<Arc<LayoutDescriptor>> {
        self.layouts.get(name).cloned()
    }

    /// Like [`LayoutRegistry::get`] but reports a missing layout as an error.
    pub fn layout(&self, name: &str) -> Result<Arc<LayoutDescriptor>> {
        self.get(name).ok_or_else(|| Error::UnknownLayout {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layouts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Layouts in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LayoutDescriptor>> {
        self.order.iter().filter_map(|name| self.layouts.get(name))
    }

    fn compute_layout<I>(&self, name: &str, fields: I) -> Result<LayoutDescriptor>
    where
        I: IntoIterator<Item = FieldSpec>,
    {
        let mut laid_out: Vec<FieldDescriptor> = Vec::new();
        let mut pending_lengths: Vec<(usize, String)> = Vec::new();
        let mut seen = HashSet::new();
        let mut end = 0usize;
        let mut align = 1usize;

        for spec in fields {
            if !seen.insert(spec.name.clone()) {
                return Err(Error::invalid_field(
                    name,
                    &spec.name,
                    "field name is declared more than once",
                ));
            }

            let kind = self.resolve_field_kind(name, &spec, laid_out.len(), &mut pending_lengths)?;
            let size = kind.size();
            let field_align = kind.align();

            let offset = match spec.offset {
                Some(offset) => {
                    if offset < end {
                        return Err(Error::invalid_field(
                            name,
                            &spec.name,
                            format!(
                                "offset {} overlaps the previous field, which ends at byte {}",
                                offset, end
                            ),
                        ));
                    }
                    if offset % field_align != 0 {
                        return Err(Error::invalid_field(
                            name,
                            &spec.name,
                            format!(
                                "offset {} is not aligned to {} bytes",
                                offset, field_align
                            ),
                        ));
                    }
                    offset
                }
                None => {
                    round_up(end, field_align).ok_or_else(|| overflow(name, &spec.name))?
                }
            };

            end = match offset.checked_add(size) {
                Some(field_end) if field_end <= MAX_LAYOUT_SIZE => field_end,
                Some(_) => return Err(too_large(name, &spec.name)),
                None => return Err(overflow(name, &spec.name)),
            };
            align = align.max(field_align);
            laid_out.push(FieldDescriptor {
                name: spec.name,
                kind,
                offset,
                size,
            });
        }

        if laid_out.is_empty() {
            return Err(Error::invalid_field(name, "", "a layout needs at least one field"));
        }

        for (array_index, len_name) in pending_lengths {
            let array_name = laid_out[array_index].name.clone();
            let len_index = laid_out
                .iter()
                .position(|f| f.name == len_name)
                .ok_or_else(|| {
                    Error::invalid_field(
                        name,
                        &array_name,
                        format!("length field '{}' is not declared", len_name),
                    )
                })?;
            match laid_out[len_index].kind {
                FieldKind::Primitive(p) if p.is_integer() => {}
                _ => {
                    return Err(Error::invalid_field(
                        name,
                        &array_name,
                        format!("length field '{}' must be an integer", len_name),
                    ))
                }
            }
            if let FieldKind::PtrArray { len_field, .. } = &mut laid_out[array_index].kind {
                *len_field = len_index;
            }
        }

        let size = round_up(end, align)
            .filter(|&size| size <= MAX_LAYOUT_SIZE)
            .ok_or_else(|| too_large(name, ""))?;

        Ok(LayoutDescriptor {
            name: name.to_string(),
            size,
            align,
            fields: laid_out,
        })
    }

    fn resolve_field_kind(
        &self,
        layout: &str,
        spec: &FieldSpec,
        index: usize,
        pending_lengths: &mut Vec<(usize, String)>,
    ) -> Result<FieldKind> {
        let parsed = KindSpec::parse(&spec.kind).ok_or_else(|| {
            Error::invalid_field(
                layout,
                &spec.name,
                format!("unrecognized kind '{}'", spec.kind),
            )
        })?;

        let lookup = |target: &str| {
            if target == layout {
                return Err(Error::invalid_field(
                    layout,
                    &spec.name,
                    "a layout cannot refer to itself",
                ));
            }
            self.get(target).ok_or_else(|| {
                Error::invalid_field(
                    layout,
                    &spec.name,
                    format!("refers to unknown layout '{}'", target),
                )
            })
        };

        match parsed {
            KindSpec::Void => Err(Error::invalid_field(
                layout,
                &spec.name,
                "void is only valid as a return type",
            )),
            KindSpec::Primitive(p) => Ok(FieldKind::Primitive(p)),
            KindSpec::Struct(target) => Ok(FieldKind::Struct(lookup(&target)?)),
            KindSpec::Ptr(target) => Ok(FieldKind::Ptr(lookup(&target)?)),
            KindSpec::PtrArray { layout: target, len_field } => {
                let pointee = lookup(&target)?;
                pending_lengths.push((index, len_field));
                Ok(FieldKind::PtrArray {
                    layout: pointee,
                    len_field: usize::MAX,
                })
            }
        }
    }
}

fn overflow(layout: &str, field: &str) -> Error {
    Error::invalid_field(layout, field, "offset overflows the address space")
}

fn too_large(layout: &str, field: &str) -> Error {
    Error::invalid_field(
        layout,
        field,
        format!("layout exceeds the maximum size of {} bytes", MAX_LAYOUT_SIZE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstring_registry() -> LayoutRegistry {
        let mut registry = LayoutRegistry::new();
        registry
            .define_layout(
                "MyCString",
                [FieldSpec::new("len", "uint32"), FieldSpec::new("ptr", "string")],
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_natural_layout_pads_after_u32() {
        let registry = cstring_registry();
        let layout = registry.layout("MyCString").unwrap();
        assert_eq!(layout.fields()[0].offset(), 0);
        assert_eq!(layout.fields()[1].offset(), WORD_SIZE.max(4));
        assert_eq!(layout.size(), WORD_SIZE * 2);
        assert_eq!(layout.align(), WORD_SIZE);
    }

    #[test]
    fn test_pointer_fields_take_one_word() {
        let mut registry = cstring_registry();
        let array = registry
            .define_layout(
                "MyCStringArray",
                [
                    FieldSpec::new("len", "uint32"),
                    FieldSpec::new("ptr", "ptr_array<MyCString, len>"),
                ],
            )
            .unwrap();
        assert_eq!(array.fields()[1].size(), WORD_SIZE);
        match array.fields()[1].kind() {
            FieldKind::PtrArray { layout, len_field } => {
                assert_eq!(layout.name(), "MyCString");
                assert_eq!(*len_field, 0);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_nested_struct_inherits_alignment() {
        let mut registry = cstring_registry();
        let outer = registry
            .define_layout(
                "Outer",
                [
                    FieldSpec::new("tag", "uint8"),
                    FieldSpec::new("inner", "struct<MyCString>"),
                    FieldSpec::new("flag", "bool"),
                ],
            )
            .unwrap();
        assert_eq!(outer.fields()[1].offset(), WORD_SIZE);
        assert_eq!(outer.fields()[2].offset(), WORD_SIZE * 3);
        assert_eq!(outer.size(), WORD_SIZE * 4);
    }

    #[test]
    fn test_duplicate_layout_rejected() {
        let mut registry = cstring_registry();
        let err = registry
            .define_layout("MyCString", [FieldSpec::new("x", "int8")])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateLayout { name } if name == "MyCString"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut registry = LayoutRegistry::new();
        let err = registry
            .define_layout("Bad", [FieldSpec::new("x", "quaternion")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field, .. } if field == "x"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overlapping_offset_rejected() {
        let mut registry = LayoutRegistry::new();
        let err = registry
            .define_layout(
                "Overlap",
                [FieldSpec::new("a", "int64"), FieldSpec::new("b", "int32").at(4)],
            )
            .unwrap_err();
        match err {
            Error::InvalidField { field, reason, .. } => {
                assert_eq!(field, "b");
                assert!(reason.contains("overlaps"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let mut registry = LayoutRegistry::new();
        let err = registry
            .define_layout("Huge", [FieldSpec::new("a", "int32").at(usize::MAX - 3)])
            .unwrap_err();
        match err {
            Error::InvalidField { field, reason, .. } => {
                assert_eq!(field, "a");
                assert!(reason.contains("overflows"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!registry.contains("Huge"));
    }

    #[test]
    fn test_oversized_layout_rejected() {
        let mut registry = LayoutRegistry::new();
        let err = registry
            .define_layout(
                "Sparse",
                [
                    FieldSpec::new("a", "int32"),
                    FieldSpec::new("b", "int32").at(MAX_LAYOUT_SIZE),
                ],
            )
            .unwrap_err();
        match err {
            Error::InvalidField { field, reason, .. } => {
                assert_eq!(field, "b");
                assert!(reason.contains("maximum size"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_misaligned_offset_rejected() {
        let mut registry = LayoutRegistry::new();
        let err = registry
            .define_layout(
                "Misaligned",
                [FieldSpec::new("a", "int8"), FieldSpec::new("b", "int32").at(2)],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field, .. } if field == "b"));
    }

    #[test]
    fn test_explicit_offset_leaves_gap() {
        let mut registry = LayoutRegistry::new();
        let layout = registry
            .define_layout(
                "Gapped",
                [FieldSpec::new("a", "int8"), FieldSpec::new("b", "int32").at(8)],
            )
            .unwrap();
        assert_eq!(layout.fields()[1].offset(), 8);
        assert_eq!(layout.size(), 12);
    }

    #[test]
    fn test_array_length_must_exist_and_be_integer() {
        let mut registry = cstring_registry();
        let err = registry
            .define_layout(
                "NoLen",
                [FieldSpec::new("ptr", "ptr_array<MyCString, count>")],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { ref reason, .. } if reason.contains("count")));

        let err = registry
            .define_layout(
                "FloatLen",
                [
                    FieldSpec::new("count", "double"),
                    FieldSpec::new("ptr", "ptr_array<MyCString, count>"),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { ref reason, .. } if reason.contains("integer")));
    }

    #[test]
    fn test_unknown_pointee_rejected() {
        let mut registry = LayoutRegistry::new();
        let err = registry
            .define_layout("Dangling", [FieldSpec::new("next", "ptr<Node>")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { ref reason, .. } if reason.contains("Node")));
    }

    #[test]
    fn test_iter_preserves_definition_order() {
        let mut registry = cstring_registry();
        registry
            .define_layout("TimeVal", [FieldSpec::new("tv_sec", "long")])
            .unwrap();
        let names: Vec<_> = registry.iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["MyCString", "TimeVal"]);
    }
}
