//! cmarshal Core Library
//!
//! Declarative marshaling between host values and the memory layout of
//! native C structs, for calls into shared libraries.
//!
//! The pieces compose in this order:
//!
//! 1. Declare struct layouts in a [`LayoutRegistry`].
//! 2. Open a [`LibraryHandle`] and bind symbols with their
//!    [`FunctionSignature`]s, one at a time ([`BoundFunction::bind`]) or as a
//!    table ([`bind_all`]).
//! 3. Build host [`Record`]s and call. Structs are passed by value
//!    (`struct<Name>`) or by reference (`ptr<Name>`); struct returns come
//!    back as records whose pointer fields are followed lazily through
//!    [`StructView`] and [`PointerArray`].
//!
//! ```no_run
//! use cmarshal_core::{FieldSpec, FunctionSignature, LayoutRegistry, LibraryHandle, Record, Value};
//! use cmarshal_core::BoundFunction;
//!
//! # fn main() -> cmarshal_core::Result<()> {
//! let mut registry = LayoutRegistry::new();
//! let timeval = registry.define_layout(
//!     "TimeVal",
//!     [FieldSpec::new("tv_sec", "long"), FieldSpec::new("tv_usec", "long")],
//! )?;
//!
//! let process = LibraryHandle::current_process()?;
//! let signature = FunctionSignature::parse(&registry, "int32", ["ptr<TimeVal>", "pointer"])?;
//! let gettimeofday = BoundFunction::bind(&process, "gettimeofday", signature)?;
//!
//! let mut args = [Value::Record(Record::new(timeval)), Value::null()];
//! let status = unsafe { gettimeofday.call(&mut args)? };
//! println!("{} {}", status, args[0]);
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod declarations;
pub mod error;
pub mod kind;
pub mod layout;
pub mod library;
pub mod marshal;
pub mod signature;
pub mod table;
pub mod value;
pub mod worker;

// Re-export commonly used types
pub use binder::BoundFunction;
pub use declarations::{Declarations, LoadedDeclarations};
pub use error::{Error, Result};
pub use kind::{KindSpec, Primitive};
pub use layout::{
    FieldDescriptor, FieldKind, FieldSpec, LayoutDescriptor, LayoutRegistry, MAX_LAYOUT_SIZE,
};
pub use library::{platform_lib_name, LibraryHandle, LoadFlags};
pub use marshal::{marshal, unmarshal, NativeBuffer, PointerArray, StructView};
pub use signature::{CallingConvention, FunctionSignature, NativeType};
pub use table::{bind_all, Binding, FunctionSpec, FunctionTable};
pub use value::{Record, Value};
pub use worker::{CallOutcome, WorkerFunction};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
