//! Declaration files
//!
//! Layouts and function tables can be declared in JSON or YAML instead of
//! code. Mapping order is significant: fields are laid out, and functions
//! bound, in the order they are written.
//!
//! ```yaml
//! layouts:
//!   - name: MyCString
//!     fields:
//!       len: uint32
//!       ptr: string
//! libraries:
//!   - name: process          # no path: symbols already in the process
//!     functions:
//!       atoi: { returns: int32, params: [string] }
//!   - name: libm
//!     path: libm.so.6
//!     flags: RESOLVE_NOW | SCOPE_LOCAL
//!     functions:
//!       ceil: { returns: double, params: [double] }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::{FieldSpec, LayoutRegistry};
use crate::library::{LibraryHandle, LoadFlags};
use crate::signature::{CallingConvention, FunctionSignature};
use crate::table::{bind_all, FunctionSpec, FunctionTable};

/// A string-keyed mapping that keeps document order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(serde::de::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// A field's kind, optionally pinned at an explicit offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDecl {
    Kind(String),
    Detailed {
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
    },
}

impl FieldDecl {
    fn to_spec(&self, name: &str) -> FieldSpec {
        match self {
            FieldDecl::Kind(kind) => FieldSpec::new(name, kind.as_str()),
            FieldDecl::Detailed { kind, offset } => FieldSpec {
                name: name.to_string(),
                kind: kind.clone(),
                offset: *offset,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDecl {
    pub name: String,
    pub fields: OrderedMap<FieldDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    #[serde(default = "default_returns")]
    pub returns: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convention: Option<String>,
    /// Number of named parameters of a variadic function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_args: Option<usize>,
    /// Bind onto a background worker
    #[serde(default, rename = "async")]
    pub background: bool,
}

fn default_returns() -> String {
    "void".to_string()
}

impl FunctionDecl {
    pub fn signature(&self, registry: &LayoutRegistry) -> Result<FunctionSignature> {
        let signature = FunctionSignature::parse(registry, &self.returns, &self.params)?;
        match &self.convention {
            Some(name) => {
                signature.with_convention(CallingConvention::from_name(name, self.fixed_args)?)
            }
            None if self.fixed_args.is_some() => Err(Error::declaration(
                "fixed_args is only meaningful with the variadic convention",
            )),
            None => Ok(signature),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Library file. Absent means the running process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub flags: LoadFlags,
    #[serde(default)]
    pub functions: OrderedMap<FunctionDecl>,
}

impl LibraryDecl {
    /// Display label: the declared name, else the path, else `process`.
    pub fn label(&self) -> String {
        match (&self.name, &self.path) {
            (Some(name), _) => name.clone(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => "process".to_string(),
        }
    }

    /// Where the library will be opened from. Relative paths are looked up
    /// in `search_dirs` first; if none contains the file, the path is handed
    /// to the platform loader unchanged.
    pub fn resolve_path(&self, search_dirs: &[PathBuf]) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        if path.is_relative() {
            if let Some(found) = search_dirs.iter().map(|d| d.join(path)).find(|p| p.exists()) {
                return Some(found);
            }
        }
        Some(path.clone())
    }

    pub fn open(&self, search_dirs: &[PathBuf]) -> Result<LibraryHandle> {
        let path = self.resolve_path(search_dirs);
        LibraryHandle::open(path.as_deref(), self.flags)
    }

    pub fn function_specs(&self, registry: &LayoutRegistry) -> Result<Vec<FunctionSpec>> {
        self.functions
            .iter()
            .map(|(symbol, decl)| {
                let signature = decl.signature(registry).map_err(|e| match e {
                    Error::Declaration { message } => {
                        Error::declaration(format!("function '{}': {}", symbol, message))
                    }
                    other => other,
                })?;
                Ok(FunctionSpec {
                    symbol: symbol.to_string(),
                    signature,
                    background: decl.background,
                })
            })
            .collect()
    }
}

/// Contents of a declarations file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Declarations {
    #[serde(default)]
    pub layouts: Vec<LayoutDecl>,
    #[serde(default)]
    pub libraries: Vec<LibraryDecl>,
}

impl Declarations {
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Load a file, choosing the format by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| Error::Io {
            message: format!("cannot read {}: {}", path.display(), e),
            source: e,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&source),
            Some("yaml") | Some("yml") => Self::from_yaml(&source),
            _ => Err(Error::declaration(format!(
                "cannot tell the format of {}; use a .json, .yaml or .yml extension",
                path.display()
            ))),
        }
    }

    /// Define every declared layout, in order.
    pub fn build_registry(&self) -> Result<LayoutRegistry> {
        let mut registry = LayoutRegistry::new();
        for layout in &self.layouts {
            let fields = layout.fields.iter().map(|(name, decl)| decl.to_spec(name));
            registry.define_layout(&layout.name, fields)?;
        }
        Ok(registry)
    }

    /// Build the registry, open every library and bind every function.
    /// Fails on the first error; nothing partially bound is returned.
    pub fn load(&self, search_dirs: &[PathBuf]) -> Result<LoadedDeclarations> {
        let registry = self.build_registry()?;
        let mut tables = Vec::with_capacity(self.libraries.len());
        for library in &self.libraries {
            let specs = library.function_specs(&registry)?;
            let handle = library.open(search_dirs)?;
            debug!(library = %library.label(), functions = specs.len(), "binding library");
            tables.push((library.label(), bind_all(&handle, specs)?));
        }
        Ok(LoadedDeclarations {
            registry: Arc::new(registry),
            tables,
        })
    }
}

/// Layouts and bound tables produced from a declarations file.
#[derive(Debug, Clone)]
pub struct LoadedDeclarations {
    pub registry: Arc<LayoutRegistry>,
    pub tables: Vec<(String, FunctionTable)>,
}

impl LoadedDeclarations {
    pub fn table(&self, label: &str) -> Option<&FunctionTable> {
        self.tables.iter().find(|(l, _)| l == label).map(|(_, t)| t)
    }

    /// First table, in declaration order, that binds `function`.
    pub fn find(&self, function: &str) -> Option<&FunctionTable> {
        self.tables
            .iter()
            .map(|(_, t)| t)
            .find(|t| t.get(function).is_some())
    }
}
