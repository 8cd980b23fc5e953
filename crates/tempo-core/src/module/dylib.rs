//! Native-library modules loaded through libloading.
//!
//! Every export is a C-ABI function exchanging JSON:
//!
//! ```text
//! _name(input_ptr, input_len, out_ptr, out_len) -> i32
//! ```
//!
//! The output buffer is allocated by the library with `malloc` and released
//! here with `libc::free`. On a non-zero status it holds a UTF-8 message.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use serde_json::Value;

use crate::error::LoadError;
use crate::types::Record;

use super::{Callable, CompiledModule, ModuleExports, ModuleLoader, OutputFn};

/// Status code returned by an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecutionResult {
    /// Output computed
    Success = 0,
    /// Input JSON could not be decoded
    DeserializationError = -1,
    /// The function reported an error
    OutputError = -2,
    /// Output could not be encoded
    SerializationError = -3,
    /// The function panicked
    Panic = -4,
}

impl From<i32> for ExecutionResult {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::DeserializationError,
            -2 => Self::OutputError,
            -3 => Self::SerializationError,
            -4 => Self::Panic,
            _ => Self::OutputError, // Unknown codes treated as output errors
        }
    }
}

/// Signature of an exported output function.
pub type OutputEntryFn = unsafe extern "C" fn(
    *const u8, usize,  // input JSON
    *mut *mut u8, *mut usize,
) -> i32;

/// RAII guard for library-allocated output memory.
struct FfiMemoryGuard {
    ptr: *mut u8,
}

impl FfiMemoryGuard {
    fn as_slice(&self, len: usize) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, len) }
    }
}

impl Drop for FfiMemoryGuard {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::free(self.ptr as *mut libc::c_void);
            }
        }
    }
}

/// An opened library and the on-disk copy it was opened from.
struct LoadedLibrary {
    library: Library,
    path: PathBuf,
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

struct DylibExports {
    loaded: Arc<LoadedLibrary>,
}

impl ModuleExports for DylibExports {
    fn resolve(&self, export: &str) -> Option<Callable> {
        let entry: OutputEntryFn = unsafe {
            let symbol = self
                .loaded
                .library
                .get::<OutputEntryFn>(export.as_bytes())
                .ok()?;
            *symbol
        };

        Some(Arc::new(DylibFn {
            _library: Arc::clone(&self.loaded),
            entry,
            name: export.to_string(),
        }))
    }
}

struct DylibFn {
    // Keeps the library mapped for as long as `entry` may be called.
    _library: Arc<LoadedLibrary>,
    entry: OutputEntryFn,
    name: String,
}

impl OutputFn for DylibFn {
    fn call(&self, input: &Record) -> Result<Value, String> {
        let input_bytes = serde_json::to_vec(input).map_err(|e| e.to_string())?;

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;

        let code = unsafe {
            (self.entry)(
                input_bytes.as_ptr(), input_bytes.len(),
                &mut out_ptr, &mut out_len,
            )
        };

        let guard = FfiMemoryGuard { ptr: out_ptr };
        let bytes = guard.as_slice(out_len);

        match ExecutionResult::from(code) {
            ExecutionResult::Success => serde_json::from_slice(bytes)
                .map_err(|e| format!("{} returned invalid JSON: {}", self.name, e)),
            ExecutionResult::Panic => Err(format!(
                "{} panicked: {}",
                self.name,
                String::from_utf8_lossy(bytes)
            )),
            status => {
                let message = String::from_utf8_lossy(bytes);
                if message.is_empty() {
                    Err(format!("{} failed with {:?}", self.name, status))
                } else {
                    Err(message.into_owned())
                }
            }
        }
    }
}

/// Opens native-library payloads.
///
/// Payload bytes are written to a uniquely named file in `module_dir` before
/// being opened; the file is removed when the module is dropped.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    module_dir: PathBuf,
}

impl DylibLoader {
    pub fn new(module_dir: impl Into<PathBuf>) -> Self {
        Self {
            module_dir: module_dir.into(),
        }
    }

    /// Loader writing into the user cache directory (`<cache>/tempo/modules`).
    pub fn in_cache_dir() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("tempo").join("modules"))
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }
}

impl ModuleLoader for DylibLoader {
    fn evaluate(&self, location: &str, bytes: Vec<u8>) -> Result<CompiledModule, LoadError> {
        let eval_error = |message: String| LoadError::Eval {
            location: location.to_string(),
            message,
        };

        fs::create_dir_all(&self.module_dir)
            .map_err(|e| eval_error(format!("cannot create {}: {}", self.module_dir.display(), e)))?;

        let path = self.module_dir.join(format!(
            "{}{}.{}",
            std::env::consts::DLL_PREFIX,
            uuid::Uuid::new_v4().simple(),
            std::env::consts::DLL_EXTENSION
        ));
        fs::write(&path, &bytes)
            .map_err(|e| eval_error(format!("cannot write {}: {}", path.display(), e)))?;

        let library = match unsafe { Library::new(&path) } {
            Ok(library) => library,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(eval_error(e.to_string()));
            }
        };

        tracing::info!("Opened native module {} from {}", path.display(), location);
        Ok(CompiledModule::new(
            location,
            DylibExports {
                loaded: Arc::new(LoadedLibrary { library, path }),
            },
        ))
    }
}
