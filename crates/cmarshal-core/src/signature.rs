//! Function signatures
//!
//! A signature uses the same kind strings as field declarations with two
//! differences: `struct<Name>` passes or returns a struct by value, and
//! `ptr<Name>` passes it by reference. `ptr_array<..>` is only meaningful
//! inside a struct and is rejected here. `void` is allowed as a return type.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kind::{KindSpec, Primitive};
use crate::layout::{LayoutDescriptor, LayoutRegistry};

/// A resolved parameter or return type.
#[derive(Debug, Clone)]
pub enum NativeType {
    Void,
    Primitive(Primitive),
    /// Struct copied into the call
    ByValue(Arc<LayoutDescriptor>),
    /// Address of a struct; re-read after the call when the host passed a
    /// record
    ByRef(Arc<LayoutDescriptor>),
}

impl NativeType {
    /// Resolve a kind string against the registry.
    pub fn resolve(kind: &str, registry: &LayoutRegistry) -> Result<Self> {
        let parsed = KindSpec::parse(kind)
            .ok_or_else(|| Error::declaration(format!("unrecognized kind '{}'", kind)))?;
        match parsed {
            KindSpec::Void => Ok(NativeType::Void),
            KindSpec::Primitive(p) => Ok(NativeType::Primitive(p)),
            KindSpec::Struct(name) => Ok(NativeType::ByValue(registry.layout(&name)?)),
            KindSpec::Ptr(name) => Ok(NativeType::ByRef(registry.layout(&name)?)),
            KindSpec::PtrArray { .. } => Err(Error::declaration(format!(
                "'{}' is only valid as a struct field; pass the enclosing struct instead",
                kind
            ))),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, NativeType::Void)
    }
}

impl PartialEq for NativeType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NativeType::Void, NativeType::Void) => true,
            (NativeType::Primitive(a), NativeType::Primitive(b)) => a == b,
            (NativeType::ByValue(a), NativeType::ByValue(b))
            | (NativeType::ByRef(a), NativeType::ByRef(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeType::Void => f.write_str("void"),
            NativeType::Primitive(p) => write!(f, "{}", p),
            NativeType::ByValue(layout) => write!(f, "struct<{}>", layout.name()),
            NativeType::ByRef(layout) => write!(f, "ptr<{}>", layout.name()),
        }
    }
}

/// Calling convention tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallingConvention {
    #[default]
    Default,
    /// Callee cleans the stack. Only differs from the default on 32-bit
    /// x86 Windows.
    Stdcall,
    /// C variadic call; the first `fixed` parameters are the named ones.
    Variadic { fixed: usize },
}

impl CallingConvention {
    /// Parse a convention name. `variadic` needs the count of fixed
    /// arguments.
    pub fn from_name(name: &str, fixed: Option<usize>) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "default" | "cdecl" | "c" => Ok(CallingConvention::Default),
            "stdcall" => Ok(CallingConvention::Stdcall),
            "variadic" | "varargs" => {
                let fixed = fixed.ok_or_else(|| {
                    Error::declaration("variadic convention requires a fixed argument count")
                })?;
                Ok(CallingConvention::Variadic { fixed })
            }
            other => Err(Error::declaration(format!(
                "unknown calling convention '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Default => f.write_str("default"),
            CallingConvention::Stdcall => f.write_str("stdcall"),
            CallingConvention::Variadic { fixed } => write!(f, "variadic({})", fixed),
        }
    }
}

/// Return type, ordered parameter types and calling convention.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    returns: NativeType,
    params: Vec<NativeType>,
    convention: CallingConvention,
}

impl FunctionSignature {
    /// A signature with the default calling convention.
    pub fn new(returns: NativeType, params: Vec<NativeType>) -> Result<Self> {
        if let Some(index) = params.iter().position(NativeType::is_void) {
            return Err(Error::declaration(format!(
                "parameter {} is void; void is only valid as a return type",
                index
            )));
        }
        Ok(Self {
            returns,
            params,
            convention: CallingConvention::Default,
        })
    }

    /// Parse kind strings against the registry.
    pub fn parse<I, S>(registry: &LayoutRegistry, returns: &str, params: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let returns = NativeType::resolve(returns, registry)?;
        let params = params
            .into_iter()
            .map(|p| NativeType::resolve(p.as_ref(), registry))
            .collect::<Result<Vec<_>>>()?;
        Self::new(returns, params)
    }

    /// Replace the calling convention.
    ///
    /// A variadic signature must declare at most as many fixed parameters as
    /// it has, and its variable part cannot contain kinds that C would
    /// promote (`int8`, `int16`, `uint8`, `uint16`, `bool`, `float`); declare
    /// them as `int32` or `double` instead.
    pub fn with_convention(mut self, convention: CallingConvention) -> Result<Self> {
        if let CallingConvention::Variadic { fixed } = convention {
            if fixed > self.params.len() {
                return Err(Error::declaration(format!(
                    "variadic signature declares {} fixed argument(s) but only {} parameter(s)",
                    fixed,
                    self.params.len()
                )));
            }
            for (index, param) in self.params.iter().enumerate().skip(fixed) {
                if let NativeType::Primitive(p) = param {
                    if p.is_promotable() {
                        return Err(Error::declaration(format!(
                            "variadic parameter {} has kind '{}', which C promotes; \
                             declare it as a wider kind",
                            index, p
                        )));
                    }
                }
            }
        }
        self.convention = convention;
        Ok(self)
    }

    pub fn returns(&self) -> &NativeType {
        &self.returns
    }

    pub fn params(&self) -> &[NativeType] {
        &self.params
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if let CallingConvention::Variadic { fixed } = self.convention {
                if i == fixed {
                    f.write_str("... ")?;
                }
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.returns)?;
        if self.convention == CallingConvention::Stdcall {
            f.write_str(" [stdcall]")?;
        }
        Ok(())
    }
}
