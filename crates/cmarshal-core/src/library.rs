//! Native library handles

use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

#[cfg(unix)]
use libloading::os::unix::Library as RawLibrary;
#[cfg(windows)]
use libloading::os::windows::Library as RawLibrary;

bitflags! {
    /// Loader flags. One resolution mode and one scope may be combined.
    ///
    /// In declaration files the flags are written as text, for example
    /// `"RESOLVE_NOW | SCOPE_GLOBAL"`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct LoadFlags: u32 {
        /// Resolve every undefined symbol when the library is opened
        const RESOLVE_NOW = 1;
        /// Resolve function symbols on first use
        const RESOLVE_LAZY = 1 << 1;
        /// Make the library's symbols available to libraries loaded later
        const SCOPE_GLOBAL = 1 << 2;
        /// Keep the library's symbols private to this handle
        const SCOPE_LOCAL = 1 << 3;
    }
}

impl Default for LoadFlags {
    fn default() -> Self {
        LoadFlags::RESOLVE_NOW | LoadFlags::SCOPE_LOCAL
    }
}

impl LoadFlags {
    /// Reject contradictory combinations and fill in missing halves with
    /// their defaults.
    fn normalized(self, library: &str) -> Result<Self> {
        let conflict = |what: &str| Error::LibraryLoad {
            library: library.to_string(),
            message: format!("conflicting load flags: {}", what),
            source: None,
        };
        if self.contains(LoadFlags::RESOLVE_NOW | LoadFlags::RESOLVE_LAZY) {
            return Err(conflict("RESOLVE_NOW and RESOLVE_LAZY"));
        }
        if self.contains(LoadFlags::SCOPE_GLOBAL | LoadFlags::SCOPE_LOCAL) {
            return Err(conflict("SCOPE_GLOBAL and SCOPE_LOCAL"));
        }

        let mut flags = self;
        if !flags.intersects(LoadFlags::RESOLVE_NOW | LoadFlags::RESOLVE_LAZY) {
            flags |= LoadFlags::RESOLVE_NOW;
        }
        if !flags.intersects(LoadFlags::SCOPE_GLOBAL | LoadFlags::SCOPE_LOCAL) {
            flags |= LoadFlags::SCOPE_LOCAL;
        }
        Ok(flags)
    }

    #[cfg(unix)]
    fn to_dlopen(self) -> std::os::raw::c_int {
        use libloading::os::unix::{RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

        let mut mode = if self.contains(LoadFlags::RESOLVE_LAZY) {
            RTLD_LAZY
        } else {
            RTLD_NOW
        };
        mode |= if self.contains(LoadFlags::SCOPE_GLOBAL) {
            RTLD_GLOBAL
        } else {
            RTLD_LOCAL
        };
        mode
    }
}

struct Inner {
    library: RawLibrary,
    name: String,
    flags: LoadFlags,
}

/// An opened native library, or the running process itself.
///
/// Handles are cheap to clone and keep the library loaded for as long as any
/// clone, or any function bound from it, is alive.
#[derive(Clone)]
pub struct LibraryHandle {
    inner: Arc<Inner>,
}

impl LibraryHandle {
    /// Open a library. `None` gives access to the symbols already loaded in
    /// the process: the executable and everything it links against.
    ///
    /// Path search for bare file names follows the platform loader.
    pub fn open(path: Option<&Path>, flags: LoadFlags) -> Result<Self> {
        let name = match path {
            Some(path) => path.display().to_string(),
            None => "<current process>".to_string(),
        };
        let flags = flags.normalized(&name)?;

        let library = Self::open_raw(path, flags).map_err(|e| Error::LibraryLoad {
            library: name.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;

        debug!(library = %name, flags = ?flags, "opened library");

        Ok(Self {
            inner: Arc::new(Inner {
                library,
                name,
                flags,
            }),
        })
    }

    /// Shorthand for `open(None, LoadFlags::default())`.
    pub fn current_process() -> Result<Self> {
        Self::open(None, LoadFlags::default())
    }

    #[cfg(unix)]
    fn open_raw(
        path: Option<&Path>,
        flags: LoadFlags,
    ) -> std::result::Result<RawLibrary, libloading::Error> {
        // SAFETY: running a library's initializers is inherently trusted;
        // callers choose which libraries to load.
        unsafe { RawLibrary::open(path, flags.to_dlopen()) }
    }

    #[cfg(windows)]
    fn open_raw(
        path: Option<&Path>,
        _flags: LoadFlags,
    ) -> std::result::Result<RawLibrary, libloading::Error> {
        match path {
            // SAFETY: see the unix variant.
            Some(path) => unsafe { RawLibrary::new(path) },
            None => RawLibrary::this(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn flags(&self) -> LoadFlags {
        self.inner.flags
    }

    /// Resolve `symbol` to its address.
    ///
    /// A symbol that exists but resolves to address zero (a weak, undefined
    /// symbol) is reported as [`Error::NullFunctionPointer`].
    pub fn resolve(&self, symbol: &str) -> Result<*mut c_void> {
        let not_found = |source| Error::SymbolNotFound {
            symbol: symbol.to_string(),
            library: self.inner.name.clone(),
            source,
        };
        if symbol.is_empty() || symbol.contains('\0') {
            return Err(not_found(None));
        }

        // SAFETY: the symbol is only read as an address, never called here.
        let address = unsafe {
            self.inner
                .library
                .get::<*mut c_void>(symbol.as_bytes())
                .map(|sym| *sym)
                .map_err(|e| not_found(Some(e)))?
        };

        if address.is_null() {
            return Err(Error::NullFunctionPointer {
                symbol: symbol.to_string(),
                library: self.inner.name.clone(),
            });
        }
        Ok(address)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.inner.name)
            .field("flags", &self.inner.flags)
            .finish()
    }
}

/// Platform file name for a library base name, e.g. `m` -> `libm.so`.
pub fn platform_lib_name(name: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        format!("{}.dll", name)
    }
    #[cfg(target_os = "macos")]
    {
        format!("lib{}.dylib", name)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        format!("lib{}.so", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        assert_eq!(
            LoadFlags::default(),
            LoadFlags::RESOLVE_NOW | LoadFlags::SCOPE_LOCAL
        );
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        let err = LoadFlags::all().normalized("libx").unwrap_err();
        assert!(matches!(err, Error::LibraryLoad { .. }));
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn test_missing_half_is_filled() {
        assert_eq!(
            LoadFlags::SCOPE_GLOBAL.normalized("libx").unwrap(),
            LoadFlags::RESOLVE_NOW | LoadFlags::SCOPE_GLOBAL
        );
        assert_eq!(
            LoadFlags::RESOLVE_LAZY.normalized("libx").unwrap(),
            LoadFlags::RESOLVE_LAZY | LoadFlags::SCOPE_LOCAL
        );
    }

    #[test]
    fn test_flags_deserialize_from_text() {
        let flags: LoadFlags = serde_json::from_str("\"RESOLVE_NOW | SCOPE_GLOBAL\"").unwrap();
        assert_eq!(flags, LoadFlags::RESOLVE_NOW | LoadFlags::SCOPE_GLOBAL);
    }

    #[test]
    fn test_missing_library() {
        let err = LibraryHandle::open(
            Some(Path::new("/nonexistent/libcmarshal-missing.so")),
            LoadFlags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::LibraryLoad { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_resolves_libc() {
        let process = LibraryHandle::current_process().unwrap();
        assert!(!process.resolve("atoi").unwrap().is_null());

        let err = process.resolve("cmarshal_no_such_symbol").unwrap_err();
        assert!(matches!(err, Error::SymbolNotFound { .. }));
    }

    #[test]
    fn test_platform_lib_name() {
        let name = platform_lib_name("m");
        #[cfg(target_os = "windows")]
        assert_eq!(name, "m.dll");
        #[cfg(target_os = "macos")]
        assert_eq!(name, "libm.dylib");
        #[cfg(target_os = "linux")]
        assert_eq!(name, "libm.so");
    }
}
