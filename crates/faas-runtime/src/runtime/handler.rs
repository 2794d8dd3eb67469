//! Dynamic handler loading
//!
//! Loads the handler function from a shared library (.so/.dylib/.dll) on
//! every change-triggered cycle, so a rebuilt library takes effect on the
//! next run without restarting the process.
//!
//! # Architecture
//!
//! Handlers are compiled against the SDK, which defines the context type
//! and the C ABI (see `faas_runtime_sdk::abi`). When a handler is called:
//! 1. The runtime encodes the input snapshot and context as JSON
//! 2. The library entry point decodes them and runs the user function
//! 3. The library returns the output and the updated environment as JSON
//! 4. The runtime adopts the environment and frees the library's buffer
//!
//! Each load opens a private copy of the library file. The platform loader
//! caches libraries by path, so opening the source path again would hand
//! back the code that was loaded first.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use libloading::{Library, Symbol};
use serde::Serialize;
use serde_json::Value;
use tempfile::TempPath;

use faas_runtime_sdk::abi::{
    self, AbiVersionFn, FreeBufferFn, HandlerEntryFn, InvocationRequest, InvocationResponse,
    ABI_VERSION, ABI_VERSION_SYMBOL, FREE_BUFFER_SYMBOL,
};
use faas_runtime_sdk::{Context, Failure, FailureKind, HandlerError, Snapshot};

use crate::bundle::{is_shared_library, ResolvedModule};
use crate::error::LoadError;

/// A loaded handler, ready for one invocation
pub trait Handler: Send {
    /// Entry name the handler was resolved from
    fn name(&self) -> &str;

    /// Run the handler; on success `ctx.environment` holds the state the
    /// handler left behind
    fn invoke(&self, input: &Snapshot, ctx: &mut Context) -> Result<Value, Failure>;
}

/// Resolves a handler entry from a module path
pub trait HandlerLoader: Send + Sync {
    fn load(&self, path: &Path, entry: &str) -> Result<Box<dyn Handler>, LoadError>;
}

impl<L: HandlerLoader + ?Sized> HandlerLoader for Arc<L> {
    fn load(&self, path: &Path, entry: &str) -> Result<Box<dyn Handler>, LoadError> {
        (**self).load(path, entry)
    }
}

/// A handler loaded from a shared library
pub struct DylibHandler {
    entry: HandlerEntryFn,
    free: FreeBufferFn,

    /// The loaded library (must outlive every call through `entry`)
    _library: Library,

    /// Private copy the library was opened from; removed on drop, after the library
    _copy: TempPath,

    /// Entry symbol name
    name: String,

    /// Path the library was copied from
    pub path: PathBuf,

    /// When the handler was loaded
    pub loaded_at: Instant,
}

impl DylibHandler {
    /// Load a handler from a shared library
    ///
    /// # Safety
    /// This loads and runs initialisation code from the library. The library
    /// must export `entry` with the SDK's `HandlerEntryFn` signature.
    pub unsafe fn open(path: &Path, entry: &str) -> Result<Self, LoadError> {
        let library_error = |reason: String| LoadError::Library {
            path: path.to_path_buf(),
            reason,
        };

        let copy = private_copy(path).map_err(|e| library_error(e.to_string()))?;

        let library = Library::new(&*copy).map_err(|e| library_error(e.to_string()))?;

        let found = {
            let version: Symbol<AbiVersionFn> = library.get(ABI_VERSION_SYMBOL).map_err(|e| {
                library_error(format!("not built with faas-runtime-sdk ({})", e))
            })?;
            version()
        };
        if found != ABI_VERSION {
            return Err(LoadError::AbiMismatch { expected: ABI_VERSION, found });
        }

        let entry_fn: HandlerEntryFn = {
            let symbol: Symbol<HandlerEntryFn> =
                library.get(entry.as_bytes()).map_err(|_| LoadError::EntryMissing {
                    entry: entry.to_string(),
                    path: path.to_path_buf(),
                })?;
            *symbol
        };

        let free_fn: FreeBufferFn = {
            let symbol: Symbol<FreeBufferFn> = library
                .get(FREE_BUFFER_SYMBOL)
                .map_err(|e| library_error(e.to_string()))?;
            *symbol
        };

        Ok(Self {
            entry: entry_fn,
            free: free_fn,
            _library: library,
            _copy: copy,
            name: entry.to_string(),
            path: path.to_path_buf(),
            loaded_at: Instant::now(),
        })
    }
}

impl Handler for DylibHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: &Snapshot, ctx: &mut Context) -> Result<Value, Failure> {
        let request = InvocationRequest {
            input: input.clone(),
            context: ctx.clone(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| Failure::new(FailureKind::Protocol, e.to_string()))?;

        // Safety: `entry` and `free` come from `_library`, which is alive for
        // as long as `self`, and the buffer is released exactly once.
        let bytes = unsafe {
            let buffer = (self.entry)(payload.as_ptr(), payload.len());
            let bytes = buffer.as_slice().to_vec();
            (self.free)(buffer);
            bytes
        };

        let response: InvocationResponse = serde_json::from_slice(&bytes).map_err(|e| {
            Failure::new(FailureKind::Protocol, format!("Failed to parse handler response: {}", e))
        })?;

        match response {
            InvocationResponse::Ok { output, environment } => {
                ctx.environment = environment;
                Ok(output)
            }
            InvocationResponse::Failed(failure) => Err(failure),
        }
    }
}

fn private_copy(path: &Path) -> std::io::Result<TempPath> {
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let copy = tempfile::Builder::new()
        .prefix("faas-handler-")
        .suffix(&suffix)
        .tempfile()?
        .into_temp_path();
    fs::copy(path, &copy)?;
    Ok(copy)
}

/// Loads handlers from shared libraries
///
/// On creation, every shared library found in the module's search path
/// (other than the handler itself) is opened once and kept for the process
/// lifetime, with its symbols made globally visible. Handler libraries that
/// link against those companions then resolve them when they are opened.
pub struct DylibLoader {
    companions: Vec<(PathBuf, Library)>,
}

impl DylibLoader {
    pub fn new(module: &ResolvedModule) -> Self {
        let mut companions = Vec::new();

        for dir in module.search_path.dirs() {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = ?dir, error = %e, "Cannot read search path directory");
                    continue;
                }
            };

            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && is_shared_library(path) && *path != module.path)
                .collect();
            paths.sort();

            for path in paths {
                if companions.iter().any(|(loaded, _)| *loaded == path) {
                    continue;
                }
                match unsafe { open_global(&path) } {
                    Ok(library) => {
                        tracing::info!(library = ?path, "Loaded companion library");
                        companions.push((path, library));
                    }
                    Err(e) => {
                        tracing::warn!(library = ?path, error = %e, "Failed to load companion library");
                    }
                }
            }
        }

        Self { companions }
    }

    /// Number of companion libraries kept loaded
    pub fn companion_count(&self) -> usize {
        self.companions.len()
    }
}

impl HandlerLoader for DylibLoader {
    fn load(&self, path: &Path, entry: &str) -> Result<Box<dyn Handler>, LoadError> {
        let handler = unsafe { DylibHandler::open(path, entry)? };
        tracing::debug!(handler = entry, path = ?path, "Loaded handler library");
        Ok(Box::new(handler))
    }
}

#[cfg(unix)]
unsafe fn open_global(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
    UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL).map(Library::from)
}

#[cfg(not(unix))]
unsafe fn open_global(path: &Path) -> Result<Library, libloading::Error> {
    Library::new(path)
}

type StaticFn = Arc<dyn Fn(&Snapshot, &mut Context) -> Result<Value, Failure> + Send + Sync>;

/// Loader serving in-process functions, for tests and embedding
///
/// Functions run through the same panic and encoding checks as library
/// handlers. The module path is ignored; the entry name selects the function.
#[derive(Default)]
pub struct StaticLoader {
    handlers: Mutex<HashMap<String, StaticFn>>,
    loads: AtomicU64,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler function under an entry name
    pub fn register<F, T>(&self, entry: &str, func: F)
    where
        F: Fn(&Snapshot, &mut Context) -> Result<T, HandlerError> + Send + Sync + 'static,
        T: Serialize + 'static,
    {
        let wrapped: StaticFn =
            Arc::new(move |input: &Snapshot, ctx: &mut Context| abi::invoke(&func, input, ctx));
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(entry.to_string(), wrapped);
    }

    /// Number of successful loads so far
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

struct StaticHandler {
    name: String,
    func: StaticFn,
}

impl Handler for StaticHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: &Snapshot, ctx: &mut Context) -> Result<Value, Failure> {
        (self.func)(input, ctx)
    }
}

impl HandlerLoader for StaticLoader {
    fn load(&self, path: &Path, entry: &str) -> Result<Box<dyn Handler>, LoadError> {
        let func = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(entry)
            .cloned()
            .ok_or_else(|| LoadError::EntryMissing {
                entry: entry.to_string(),
                path: path.to_path_buf(),
            })?;

        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticHandler {
            name: entry.to_string(),
            func,
        }))
    }
}
