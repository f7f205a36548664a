//! Runtime loaded from a shared library and resolved by symbol name.
//!
//! Tensors cross the boundary as the C layout:
//!
//! ```c
//! typedef struct tensors_struct {
//!     size_t num_tensors;
//!     char **names;
//!     tensor_data_type *data_types;
//!     size_t *ranks;
//!     size_t **shapes;
//!     void **data;
//! } tensors_struct;
//! ```

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use crate::engine::runtime::{InferenceRuntime, RuntimeArgs, RuntimeError};
use crate::tensor::{DataType, Tensor, TensorBatch};

#[repr(C)]
struct RawTensors {
    num_tensors: usize,
    names: *mut *mut c_char,
    data_types: *mut c_int,
    ranks: *mut usize,
    shapes: *mut *mut usize,
    data: *mut *mut c_void,
}

impl RawTensors {
    fn empty() -> Self {
        Self {
            num_tensors: 0,
            names: ptr::null_mut(),
            data_types: ptr::null_mut(),
            ranks: ptr::null_mut(),
            shapes: ptr::null_mut(),
            data: ptr::null_mut(),
        }
    }
}

type InitFn = unsafe extern "C" fn() -> c_int;
type InitArgsFn =
    unsafe extern "C" fn(c_int, *const *const c_char, *const *const c_void) -> c_int;
type LoadFn = unsafe extern "C" fn(*const c_char) -> c_int;
type ExecFn = unsafe extern "C" fn(*mut RawTensors, *mut RawTensors) -> c_int;
type StatusFn = unsafe extern "C" fn() -> c_int;
type TextFn = unsafe extern "C" fn() -> *const c_char;

struct EntryPoints {
    initialize: InitFn,
    initialize_with_args: InitArgsFn,
    load_model: LoadFn,
    execute: ExecFn,
    cleanup: StatusFn,
    destroy: StatusFn,
    error_message: TextFn,
    version: TextFn,
    name: TextFn,
}

fn dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic loader error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

/// Resolve `symbol` as a function pointer of type `F`.
///
/// # Safety
/// `F` must be a function pointer type matching the exported symbol.
unsafe fn resolve<F: Copy>(
    handle: NonNull<c_void>,
    path: &Path,
    symbol: &'static str,
) -> Result<F, RuntimeError> {
    let name = CString::new(symbol).map_err(|e| RuntimeError::Argument(e.to_string()))?;
    let address = libc::dlsym(handle.as_ptr(), name.as_ptr());
    if address.is_null() {
        return Err(RuntimeError::MissingSymbol {
            path: path.to_path_buf(),
            symbol,
        });
    }
    log::debug!("Resolved `{}` at {:p}", symbol, address);
    Ok(std::mem::transmute_copy::<*mut c_void, F>(&address))
}

impl EntryPoints {
    fn resolve(handle: NonNull<c_void>, path: &Path) -> Result<Self, RuntimeError> {
        unsafe {
            Ok(Self {
                initialize: resolve(handle, path, "runtime_initialization")?,
                initialize_with_args: resolve(handle, path, "runtime_initialization_with_args")?,
                load_model: resolve(handle, path, "runtime_model_loading")?,
                execute: resolve(handle, path, "runtime_inference_execution")?,
                cleanup: resolve(handle, path, "runtime_inference_cleanup")?,
                destroy: resolve(handle, path, "runtime_destruction")?,
                error_message: resolve(handle, path, "runtime_error_message")?,
                version: resolve(handle, path, "runtime_version")?,
                name: resolve(handle, path, "runtime_name")?,
            })
        }
    }
}

/// Owned C-layout copy of an input batch, kept alive until `cleanup`.
struct InputArena {
    _names: Vec<CString>,
    name_ptrs: Vec<*mut c_char>,
    types: Vec<c_int>,
    ranks: Vec<usize>,
    _shapes: Vec<Vec<usize>>,
    shape_ptrs: Vec<*mut usize>,
    _data: Vec<Vec<u8>>,
    data_ptrs: Vec<*mut c_void>,
}

impl InputArena {
    fn new(batch: TensorBatch) -> Result<Self, RuntimeError> {
        let count = batch.count();
        let mut arena = Self {
            _names: Vec::with_capacity(count),
            name_ptrs: Vec::with_capacity(count),
            types: Vec::with_capacity(count),
            ranks: Vec::with_capacity(count),
            _shapes: Vec::with_capacity(count),
            shape_ptrs: Vec::with_capacity(count),
            _data: Vec::with_capacity(count),
            data_ptrs: Vec::with_capacity(count),
        };

        for tensor in batch {
            match tensor.name {
                Some(name) => {
                    let name =
                        CString::new(name).map_err(|e| RuntimeError::Argument(e.to_string()))?;
                    arena.name_ptrs.push(name.as_ptr() as *mut c_char);
                    arena._names.push(name);
                }
                None => arena.name_ptrs.push(ptr::null_mut()),
            }
            arena.types.push(tensor.data_type.tag());
            arena.ranks.push(tensor.shape.len());

            let mut shape: Vec<usize> = tensor.shape.iter().map(|&d| d as usize).collect();
            arena.shape_ptrs.push(shape.as_mut_ptr());
            arena._shapes.push(shape);

            let mut data = tensor.data;
            arena.data_ptrs.push(data.as_mut_ptr() as *mut c_void);
            arena._data.push(data);
        }

        Ok(arena)
    }

    fn raw(&mut self) -> RawTensors {
        RawTensors {
            num_tensors: self.types.len(),
            names: self.name_ptrs.as_mut_ptr(),
            data_types: self.types.as_mut_ptr(),
            ranks: self.ranks.as_mut_ptr(),
            shapes: self.shape_ptrs.as_mut_ptr(),
            data: self.data_ptrs.as_mut_ptr(),
        }
    }
}

/// Copy a runtime-owned C batch into an owned one.
///
/// # Safety
/// Every non-null array in `raw` must hold `num_tensors` valid entries, and
/// every data buffer must span `product(shape) * width(type)` bytes.
unsafe fn copy_out(raw: &RawTensors) -> TensorBatch {
    let count = raw.num_tensors;
    if count == 0 || raw.data_types.is_null() || raw.ranks.is_null() || raw.shapes.is_null() {
        return TensorBatch::default();
    }

    let mut tensors = Vec::with_capacity(count);
    for i in 0..count {
        let name = if raw.names.is_null() || (*raw.names.add(i)).is_null() {
            None
        } else {
            Some(CStr::from_ptr(*raw.names.add(i)).to_string_lossy().into_owned())
        };
        let data_type = DataType::from_tag(*raw.data_types.add(i));
        let rank = *raw.ranks.add(i);
        let dims = *raw.shapes.add(i);
        let shape: Vec<u64> = if dims.is_null() || rank == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(dims, rank)
                .iter()
                .map(|&d| d as u64)
                .collect()
        };

        let mut tensor = Tensor::new(name, data_type, shape, Vec::new());
        let source = if raw.data.is_null() {
            ptr::null_mut()
        } else {
            *raw.data.add(i)
        };
        match tensor.expected_len() {
            Some(len) if !source.is_null() && len <= isize::MAX as usize => {
                tensor.data = std::slice::from_raw_parts(source as *const u8, len).to_vec();
            }
            Some(_) => {}
            None => log::warn!(
                "Output {} has shape {:?} with no representable size; data skipped",
                i,
                tensor.shape
            ),
        }
        tensors.push(tensor);
    }

    TensorBatch::new(tensors)
}

fn text(entry: TextFn) -> String {
    let message = unsafe { entry() };
    if message.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

/// Inference runtime backed by a dynamically loaded library.
pub struct DynamicRuntime {
    path: PathBuf,
    handle: NonNull<c_void>,
    entries: EntryPoints,
    pending_input: Option<InputArena>,
    destroyed: bool,
}

impl DynamicRuntime {
    /// Open the library and resolve every entry point.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let library_error = |reason| RuntimeError::Library {
            path: path.to_path_buf(),
            reason,
        };
        let name = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| library_error(e.to_string()))?;

        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        let handle = NonNull::new(handle).ok_or_else(|| library_error(dl_error()))?;

        let entries = match EntryPoints::resolve(handle, path) {
            Ok(entries) => entries,
            Err(e) => {
                unsafe { libc::dlclose(handle.as_ptr()) };
                return Err(e);
            }
        };

        log::info!("Loaded runtime library {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            handle,
            entries,
            pending_input: None,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, entry: &'static str, code: c_int) -> Result<(), RuntimeError> {
        if code == 0 {
            return Ok(());
        }
        Err(RuntimeError::Status {
            entry,
            code,
            message: self.error_message(),
        })
    }
}

impl InferenceRuntime for DynamicRuntime {
    fn initialize(&mut self) -> Result<(), RuntimeError> {
        let code = unsafe { (self.entries.initialize)() };
        self.check("runtime_initialization", code)
    }

    fn initialize_with_args(&mut self, args: &RuntimeArgs) -> Result<(), RuntimeError> {
        let to_c = |s: &str| CString::new(s).map_err(|e| RuntimeError::Argument(e.to_string()));
        let mut keys = Vec::with_capacity(args.len());
        let mut values = Vec::with_capacity(args.len());
        for (key, value) in args.iter() {
            keys.push(to_c(key)?);
            values.push(to_c(value)?);
        }
        let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
        let value_ptrs: Vec<*const c_void> =
            values.iter().map(|v| v.as_ptr() as *const c_void).collect();
        let length = c_int::try_from(args.len())
            .map_err(|_| RuntimeError::Argument("too many runtime arguments".into()))?;

        let code = unsafe {
            (self.entries.initialize_with_args)(length, key_ptrs.as_ptr(), value_ptrs.as_ptr())
        };
        self.check("runtime_initialization_with_args", code)
    }

    fn load_model(&mut self, path: &Path) -> Result<(), RuntimeError> {
        let name = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| RuntimeError::Argument(e.to_string()))?;
        let code = unsafe { (self.entries.load_model)(name.as_ptr()) };
        self.check("runtime_model_loading", code)
    }

    fn run_inference(
        &mut self,
        input: TensorBatch,
        output: &mut TensorBatch,
    ) -> Result<(), RuntimeError> {
        let arena = self.pending_input.insert(InputArena::new(input)?);
        let mut raw_input = arena.raw();
        let mut raw_output = RawTensors::empty();

        let code = unsafe { (self.entries.execute)(&mut raw_input, &mut raw_output) };
        *output = unsafe { copy_out(&raw_output) };
        self.check("runtime_inference_execution", code)
    }

    fn cleanup(&mut self) -> Result<(), RuntimeError> {
        let code = unsafe { (self.entries.cleanup)() };
        self.pending_input = None;
        self.check("runtime_inference_cleanup", code)
    }

    fn destroy(&mut self) -> Result<(), RuntimeError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        let code = unsafe { (self.entries.destroy)() };
        self.check("runtime_destruction", code)
    }

    fn error_message(&self) -> String {
        text(self.entries.error_message)
    }

    fn version(&self) -> String {
        text(self.entries.version)
    }

    fn name(&self) -> String {
        text(self.entries.name)
    }
}

impl Drop for DynamicRuntime {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::warn!("Runtime destruction failed: {}", e);
        }
        self.pending_input = None;
        if unsafe { libc::dlclose(self.handle.as_ptr()) } != 0 {
            log::warn!("Failed to close {:?}: {}", self.path, dl_error());
        }
    }
}
