//! Function tables
//!
//! [`bind_all`] turns a declarative table of `symbol -> signature` into
//! bound functions. Binding is all-or-nothing: the first unresolved symbol
//! or null function pointer aborts the whole table.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::binder::BoundFunction;
use crate::error::{Error, Result};
use crate::library::LibraryHandle;
use crate::signature::FunctionSignature;
use crate::worker::WorkerFunction;

/// One entry of a function table declaration.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub symbol: String,
    pub signature: FunctionSignature,
    /// Run calls on a dedicated background worker
    pub background: bool,
}

impl FunctionSpec {
    pub fn new(symbol: impl Into<String>, signature: FunctionSignature) -> Self {
        Self {
            symbol: symbol.into(),
            signature,
            background: false,
        }
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// A bound table entry.
#[derive(Debug, Clone)]
pub enum Binding {
    Sync(BoundFunction),
    Worker(WorkerFunction),
}

impl Binding {
    pub fn signature(&self) -> &FunctionSignature {
        match self {
            Binding::Sync(f) => f.signature(),
            Binding::Worker(w) => w.signature(),
        }
    }
}

/// Functions bound from one library, in declaration order.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    library: LibraryHandle,
    entries: Vec<(String, Binding)>,
    index: HashMap<String, usize>,
}

impl FunctionTable {
    pub fn library(&self) -> &LibraryHandle {
        &self.library
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    /// A synchronously bound function.
    pub fn function(&self, name: &str) -> Option<&BoundFunction> {
        match self.get(name)? {
            Binding::Sync(f) => Some(f),
            Binding::Worker(_) => None,
        }
    }

    /// A function bound to a background worker.
    pub fn worker(&self, name: &str) -> Option<&WorkerFunction> {
        match self.get(name)? {
            Binding::Worker(w) => Some(w),
            Binding::Sync(_) => None,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.entries.iter().map(|(name, b)| (name.as_str(), b))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bind every entry of `specs` against `library`.
///
/// Every symbol is resolved before any worker is started, so a failure
/// leaves nothing running.
pub fn bind_all<I>(library: &LibraryHandle, specs: I) -> Result<FunctionTable>
where
    I: IntoIterator<Item = FunctionSpec>,
{
    let mut resolved = Vec::new();
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.symbol.clone()) {
            return Err(Error::declaration(format!(
                "function '{}' is declared more than once for {}",
                spec.symbol,
                library.name()
            )));
        }
        debug!(function = %spec.symbol, library = library.name(), "defining function");
        let function = BoundFunction::bind(library, &spec.symbol, spec.signature)?;
        resolved.push((spec.symbol, function, spec.background));
    }

    let mut entries = Vec::with_capacity(resolved.len());
    let mut index = HashMap::with_capacity(resolved.len());
    for (symbol, function, background) in resolved {
        let binding = if background {
            Binding::Worker(function.into_worker()?)
        } else {
            Binding::Sync(function)
        };
        index.insert(symbol.clone(), entries.len());
        entries.push((symbol, binding));
    }

    Ok(FunctionTable {
        library: library.clone(),
        entries,
        index,
    })
}
