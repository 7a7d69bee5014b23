//! Dynamic Library Loader
//!
//! Safe wrapper around libloading for loading shared libraries.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::LoaderConfig;
use crate::error::{MarshalError, MarshalResult};

use super::trampoline::NativeFunctionPointer;

/// A dynamically loaded library
pub struct DynamicLibrary {
    /// Name the library was requested by
    name: String,
    /// Path (or bare name) handed to the system loader
    path: PathBuf,
    /// The loaded library handle; `None` once unloaded
    library: RwLock<Option<Library>>,
    /// Cached function symbols
    symbols: Mutex<HashMap<String, NativeFunctionPointer>>,
}

impl DynamicLibrary {
    /// Load a library from the given path. Bare file names are resolved
    /// by the system loader's own search rules.
    pub fn load(path: impl AsRef<Path>) -> MarshalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        // Safety: loading a library runs its initializers. We trust that the
        // caller has named a genuine shared library.
        let library = unsafe {
            Library::new(&path).map_err(|e| MarshalError::Load {
                name: name.clone(),
                reason: e.to_string(),
            })?
        };
        log::debug!("[loader] loaded {} from {}", name, path.display());

        Ok(Self {
            name,
            path,
            library: RwLock::new(Some(library)),
            symbols: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the path to this library
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.library.read().is_some()
    }

    /// Keep the library mapped while the returned guard lives
    pub fn pin(&self) -> MarshalResult<PinnedLibrary<'_>> {
        let guard = self.library.read();
        if guard.is_none() {
            return Err(MarshalError::Load {
                name: self.name.clone(),
                reason: "library has been unloaded".to_string(),
            });
        }
        Ok(PinnedLibrary { owner: self, guard })
    }

    /// Resolve a function symbol, caching the address
    pub fn resolve_symbol(&self, name: &str) -> MarshalResult<NativeFunctionPointer> {
        self.pin()?.resolve(name)
    }

    /// Unload the library. Returns false if it was already unloaded.
    ///
    /// Waits for pinned calls to finish. Entry points resolved earlier
    /// become dangling.
    pub fn unload(&self) -> bool {
        let mut guard = self.library.write();
        match guard.take() {
            Some(library) => {
                self.symbols.lock().clear();
                drop(library);
                log::debug!("[loader] unloaded {}", self.name);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// A library held mapped for the span of a native call
pub struct PinnedLibrary<'a> {
    owner: &'a DynamicLibrary,
    guard: RwLockReadGuard<'a, Option<Library>>,
}

impl PinnedLibrary<'_> {
    /// Get a function symbol by name
    pub fn resolve(&self, name: &str) -> MarshalResult<NativeFunctionPointer> {
        // Check cache first
        if let Some(&entry) = self.owner.symbols.lock().get(name) {
            return Ok(entry);
        }

        let symbol_error = |reason: String| MarshalError::Symbol {
            library: self.owner.name.clone(),
            symbol: name.to_string(),
            reason,
        };
        let library = self
            .guard
            .as_ref()
            .ok_or_else(|| symbol_error("library has been unloaded".to_string()))?;
        let c_name = CString::new(name).map_err(|_| symbol_error("invalid symbol name".to_string()))?;

        // Safety: the symbol is only ever used as an untyped address; its
        // real signature is enforced by the binding that calls it.
        let symbol: Symbol<*const ()> = unsafe {
            library
                .get(c_name.as_bytes_with_nul())
                .map_err(|e| symbol_error(e.to_string()))?
        };

        let entry = NativeFunctionPointer::new(*symbol as usize)
            .ok_or_else(|| symbol_error("symbol resolved to null".to_string()))?;
        self.owner.symbols.lock().insert(name.to_string(), entry);
        log::debug!("[loader] resolved {}!{} at {:?}", self.owner.name, name, entry);
        Ok(entry)
    }
}

/// Library loader with search paths
pub struct LibraryLoader {
    /// Search paths for libraries
    search_paths: Vec<PathBuf>,
    /// Loaded libraries
    libraries: Mutex<HashMap<String, Arc<DynamicLibrary>>>,
}

impl LibraryLoader {
    /// Create a new library loader
    pub fn new() -> Self {
        Self::with_config(&LoaderConfig::default())
    }

    pub fn with_config(config: &LoaderConfig) -> Self {
        let mut search_paths = config.search_paths.clone();
        if config.include_default_paths {
            search_paths.extend(default_search_paths());
        }
        Self {
            search_paths,
            libraries: Mutex::new(HashMap::new()),
        }
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find a library by name
    pub fn find_library(&self, name: &str) -> Option<PathBuf> {
        // If it's already a path, check if it exists
        let path = Path::new(name);
        if path.exists() {
            return Some(path.to_path_buf());
        }

        let candidates = [name.to_string(), library_filename(name)];
        for search_path in &self.search_paths {
            for candidate in &candidates {
                let full_path = search_path.join(candidate);
                if full_path.is_file() {
                    return Some(full_path);
                }
            }
        }

        None
    }

    /// Load a library by name, reusing an already loaded instance
    pub fn load(&self, name: &str) -> MarshalResult<Arc<DynamicLibrary>> {
        let mut libraries = self.libraries.lock();
        if let Some(lib) = libraries.get(name) {
            if lib.is_loaded() {
                return Ok(Arc::clone(lib));
            }
        }

        // Fall back to the system loader for names like "libc.so.6"
        let library = match self.find_library(name) {
            Some(path) => DynamicLibrary::load(path)?,
            None => DynamicLibrary::load(name)?,
        };
        let lib = Arc::new(library);
        libraries.insert(name.to_string(), Arc::clone(&lib));
        Ok(lib)
    }

    /// Get a loaded library
    pub fn get(&self, name: &str) -> Option<Arc<DynamicLibrary>> {
        self.libraries.lock().get(name).cloned()
    }

    /// Unload a library. Idempotent.
    pub fn unload(&self, name: &str) -> bool {
        match self.libraries.lock().remove(name) {
            Some(lib) => lib.unload(),
            None => false,
        }
    }

    /// List loaded libraries
    pub fn loaded_libraries(&self) -> Vec<String> {
        self.libraries.lock().keys().cloned().collect()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the default library search paths for this platform
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/lib64"));
        paths.push(PathBuf::from("/usr/lib64"));

        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(ld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));

        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(dyld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Windows\\System32"));

        if let Ok(path) = std::env::var("PATH") {
            paths.extend(path.split(';').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
    }

    paths
}

/// Construct the platform-specific library filename
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if name.starts_with("lib") && name.contains(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.to_ascii_lowercase().ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        name.to_string()
    }
}
