//! Runtime binding of the OpenCL driver.
//!
//! The driver library is opened with `libloading` and every entry point the
//! session uses is resolved up front. A single missing symbol fails the
//! whole load; there is no partially bound [`ClApi`]. The library stays
//! mapped for as long as any handle created through it is alive.

use std::{
    ffi::{CString, c_char, c_void},
    ptr,
    sync::Arc,
};

use libloading::Library;
use opencl3::{
    device::CL_DEVICE_TYPE_GPU,
    memory::{CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_WRITE_ONLY},
    types::{
        CL_BLOCKING, cl_bool, cl_command_queue, cl_command_queue_properties, cl_context,
        cl_context_properties, cl_device_id, cl_device_type, cl_event, cl_int, cl_kernel, cl_mem,
        cl_mem_flags, cl_platform_id, cl_program, cl_uint,
    },
};
use tracing::{debug, warn};

use crate::{
    ClError,
    backend::{ComputeBackend, KernelArg, MemAccess},
    cl_try,
    config::BackendConfig,
};

const CL_DEVICE_NOT_FOUND: cl_int = -1;
const CL_DEVICE_NAME: cl_uint = 0x102B;
const CL_PROGRAM_BUILD_LOG: cl_uint = 0x1183;

// ─── Entry-Point-Tabelle ──────────────────────────────────────────────

macro_rules! cl_api {
    ($($field:ident = $symbol:literal : $ty:ty;)*) => {
        /// Resolved driver entry points. Dropping the last reference unloads
        /// the library.
        pub struct ClApi {
            $(pub(crate) $field: $ty,)*
            _lib: Library,
        }

        impl ClApi {
            fn bind(lib: Library) -> Result<Self, ClError> {
                $(
                    // Safety: the signature matches the OpenCL 1.2 C prototype.
                    let $field: $ty = unsafe {
                        *lib.get::<$ty>($symbol.as_bytes())
                            .map_err(|_| ClError::MissingSymbol($symbol))?
                    };
                )*
                Ok(Self { $($field,)* _lib: lib })
            }

            /// Names of every entry point a usable driver must export.
            pub const SYMBOLS: &'static [&'static str] = &[$($symbol,)*];
        }
    };
}

cl_api! {
    get_platform_ids = "clGetPlatformIDs":
        unsafe extern "system" fn(cl_uint, *mut cl_platform_id, *mut cl_uint) -> cl_int;
    get_device_ids = "clGetDeviceIDs":
        unsafe extern "system" fn(cl_platform_id, cl_device_type, cl_uint, *mut cl_device_id, *mut cl_uint) -> cl_int;
    create_context = "clCreateContext":
        unsafe extern "system" fn(*const cl_context_properties, cl_uint, *const cl_device_id, *const c_void, *mut c_void, *mut cl_int) -> cl_context;
    create_command_queue = "clCreateCommandQueue":
        unsafe extern "system" fn(cl_context, cl_device_id, cl_command_queue_properties, *mut cl_int) -> cl_command_queue;
    create_program_with_source = "clCreateProgramWithSource":
        unsafe extern "system" fn(cl_context, cl_uint, *const *const c_char, *const usize, *mut cl_int) -> cl_program;
    build_program = "clBuildProgram":
        unsafe extern "system" fn(cl_program, cl_uint, *const cl_device_id, *const c_char, *const c_void, *mut c_void) -> cl_int;
    get_program_build_info = "clGetProgramBuildInfo":
        unsafe extern "system" fn(cl_program, cl_device_id, cl_uint, usize, *mut c_void, *mut usize) -> cl_int;
    create_kernel = "clCreateKernel":
        unsafe extern "system" fn(cl_program, *const c_char, *mut cl_int) -> cl_kernel;
    create_buffer = "clCreateBuffer":
        unsafe extern "system" fn(cl_context, cl_mem_flags, usize, *mut c_void, *mut cl_int) -> cl_mem;
    set_kernel_arg = "clSetKernelArg":
        unsafe extern "system" fn(cl_kernel, cl_uint, usize, *const c_void) -> cl_int;
    enqueue_nd_range_kernel = "clEnqueueNDRangeKernel":
        unsafe extern "system" fn(cl_command_queue, cl_kernel, cl_uint, *const usize, *const usize, *const usize, cl_uint, *const cl_event, *mut cl_event) -> cl_int;
    finish = "clFinish":
        unsafe extern "system" fn(cl_command_queue) -> cl_int;
    enqueue_read_buffer = "clEnqueueReadBuffer":
        unsafe extern "system" fn(cl_command_queue, cl_mem, cl_bool, usize, usize, *mut c_void, cl_uint, *const cl_event, *mut cl_event) -> cl_int;
    release_mem_object = "clReleaseMemObject":
        unsafe extern "system" fn(cl_mem) -> cl_int;
    release_command_queue = "clReleaseCommandQueue":
        unsafe extern "system" fn(cl_command_queue) -> cl_int;
    release_kernel = "clReleaseKernel":
        unsafe extern "system" fn(cl_kernel) -> cl_int;
    release_program = "clReleaseProgram":
        unsafe extern "system" fn(cl_program) -> cl_int;
    release_context = "clReleaseContext":
        unsafe extern "system" fn(cl_context) -> cl_int;
    get_device_info = "clGetDeviceInfo":
        unsafe extern "system" fn(cl_device_id, cl_uint, usize, *mut c_void, *mut usize) -> cl_int;
}

impl ClApi {
    /// Opens the first candidate library that loads and binds all entry points.
    pub fn load(config: &BackendConfig) -> Result<Self, ClError> {
        for candidate in &config.library_candidates {
            // Safety: loading the ICD loader runs its initialisers, nothing else.
            match unsafe { Library::new(candidate) } {
                Ok(lib) => {
                    debug!(library = %candidate.display(), "OpenCL driver library opened");
                    return Self::bind(lib);
                }
                Err(err) => {
                    debug!(library = %candidate.display(), %err, "OpenCL driver library not loadable");
                }
            }
        }
        Err(ClError::LibraryNotFound(config.describe_candidates()))
    }
}

/// `true` when a driver library can be opened and fully bound.
pub fn is_driver_available(config: &BackendConfig) -> bool {
    ClApi::load(config).is_ok()
}

// ─── Handles ──────────────────────────────────────────────────────────

macro_rules! cl_handle {
    ($(#[$doc:meta])* $name:ident, $raw:ty, $release:ident) => {
        $(#[$doc])*
        pub struct $name {
            raw: $raw,
            api: Arc<ClApi>,
        }

        // Safety: OpenCL objects may be used from any thread. The only
        // non-thread-safe call, clSetKernelArg, runs under the session's
        // per-kernel mutex.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            pub fn raw(&self) -> $raw {
                self.raw
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                let status = unsafe { (self.api.$release)(self.raw) };
                if status != 0 {
                    warn!(status, object = stringify!($name), "release failed");
                }
            }
        }
    };
}

cl_handle!(ClContext, cl_context, release_context);
cl_handle!(ClQueue, cl_command_queue, release_command_queue);
cl_handle!(ClProgram, cl_program, release_program);
cl_handle!(ClKernel, cl_kernel, release_kernel);
cl_handle!(
    /// Device memory object.
    ClMem, cl_mem, release_mem_object
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformId(cl_platform_id);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(cl_device_id);

// Safety: platform and device ids are process-wide opaque identifiers.
unsafe impl Send for PlatformId {}
unsafe impl Sync for PlatformId {}
unsafe impl Send for DeviceId {}
unsafe impl Sync for DeviceId {}

fn non_null<T>(raw: *mut T, status: cl_int) -> Result<*mut T, ClError> {
    if status != 0 {
        Err(ClError::Api(status))
    } else if raw.is_null() {
        Err(ClError::Api(-1))
    } else {
        Ok(raw)
    }
}

// ─── DynamicBackend ───────────────────────────────────────────────────

/// [`ComputeBackend`] over the driver library bound at runtime.
pub struct DynamicBackend {
    api: Arc<ClApi>,
}

impl DynamicBackend {
    pub fn load(config: &BackendConfig) -> Result<Self, ClError> {
        Ok(Self { api: Arc::new(ClApi::load(config)?) })
    }

    fn build_log(&self, program: cl_program, device: cl_device_id) -> String {
        let mut len = 0usize;
        let status = unsafe {
            (self.api.get_program_build_info)(
                program, device, CL_PROGRAM_BUILD_LOG, 0, ptr::null_mut(), &mut len,
            )
        };
        if status != 0 || len == 0 {
            return format!("build status unavailable ({status})");
        }
        let mut log = vec![0u8; len];
        let status = unsafe {
            (self.api.get_program_build_info)(
                program, device, CL_PROGRAM_BUILD_LOG, len, log.as_mut_ptr().cast(), ptr::null_mut(),
            )
        };
        if status != 0 {
            return format!("build log unavailable ({status})");
        }
        trim_nul(&log)
    }
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_owned()
}

impl ComputeBackend for DynamicBackend {
    type Platform = PlatformId;
    type Device = DeviceId;
    type Context = ClContext;
    type Queue = ClQueue;
    type Program = ClProgram;
    type Kernel = ClKernel;
    type Mem = ClMem;

    fn platform(&self) -> Result<PlatformId, ClError> {
        let mut platform: cl_platform_id = ptr::null_mut();
        let mut count: cl_uint = 0;
        cl_try!((self.api.get_platform_ids)(1, &mut platform, &mut count));
        if count == 0 || platform.is_null() {
            return Err(ClError::NoPlatform);
        }
        Ok(PlatformId(platform))
    }

    fn gpu_devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>, ClError> {
        let mut count: cl_uint = 0;
        let status = unsafe {
            (self.api.get_device_ids)(platform.0, CL_DEVICE_TYPE_GPU, 0, ptr::null_mut(), &mut count)
        };
        if status == CL_DEVICE_NOT_FOUND || (status == 0 && count == 0) {
            return Err(ClError::NoDevices);
        }
        if status != 0 {
            return Err(ClError::Api(status));
        }
        let mut ids: Vec<cl_device_id> = vec![ptr::null_mut(); count as usize];
        cl_try!((self.api.get_device_ids)(
            platform.0,
            CL_DEVICE_TYPE_GPU,
            count,
            ids.as_mut_ptr(),
            ptr::null_mut(),
        ));
        Ok(ids.into_iter().map(DeviceId).collect())
    }

    fn create_context(&self, devices: &[DeviceId]) -> Result<ClContext, ClError> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.0).collect();
        let mut status: cl_int = 0;
        let raw = unsafe {
            (self.api.create_context)(
                ptr::null(),
                ids.len() as cl_uint,
                ids.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
                &mut status,
            )
        };
        let raw = non_null(raw, status)?;
        Ok(ClContext { raw, api: Arc::clone(&self.api) })
    }

    fn create_queue(&self, context: &ClContext, device: DeviceId) -> Result<ClQueue, ClError> {
        let mut status: cl_int = 0;
        let raw = unsafe { (self.api.create_command_queue)(context.raw, device.0, 0, &mut status) };
        let raw = non_null(raw, status)?;
        Ok(ClQueue { raw, api: Arc::clone(&self.api) })
    }

    fn build_program(
        &self,
        context: &ClContext,
        devices: &[DeviceId],
        source: &str,
    ) -> Result<ClProgram, ClError> {
        let src_ptr = source.as_ptr() as *const c_char;
        let src_len = source.len();
        let mut status: cl_int = 0;
        let raw = unsafe {
            (self.api.create_program_with_source)(context.raw, 1, &src_ptr, &src_len, &mut status)
        };
        let raw = non_null(raw, status)?;
        let program = ClProgram { raw, api: Arc::clone(&self.api) };

        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.0).collect();
        let status = unsafe {
            (self.api.build_program)(
                program.raw,
                ids.len() as cl_uint,
                ids.as_ptr(),
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if status != 0 {
            let log = match ids.first() {
                Some(&device) => self.build_log(program.raw, device),
                None => String::new(),
            };
            return Err(ClError::Build(format!("status {status}: {log}")));
        }
        Ok(program)
    }

    fn create_kernel(&self, program: &ClProgram, name: &str) -> Result<ClKernel, ClError> {
        let c_name =
            CString::new(name).map_err(|_| ClError::InvalidArgument("kernel name contains NUL"))?;
        let mut status: cl_int = 0;
        let raw = unsafe { (self.api.create_kernel)(program.raw, c_name.as_ptr(), &mut status) };
        let raw = non_null(raw, status)?;
        Ok(ClKernel { raw, api: Arc::clone(&self.api) })
    }

    fn create_buffer(&self, context: &ClContext, access: MemAccess<'_>) -> Result<ClMem, ClError> {
        let (flags, len, host) = match access {
            MemAccess::ReadOnly(data) => (
                CL_MEM_READ_ONLY | CL_MEM_COPY_HOST_PTR,
                data.len(),
                data.as_ptr() as *mut c_void,
            ),
            MemAccess::WriteOnly(len) => (CL_MEM_WRITE_ONLY, len, ptr::null_mut()),
        };
        let mut status: cl_int = 0;
        let raw = unsafe { (self.api.create_buffer)(context.raw, flags, len, host, &mut status) };
        let raw = non_null(raw, status)?;
        Ok(ClMem { raw, api: Arc::clone(&self.api) })
    }

    fn set_kernel_arg(
        &self,
        kernel: &mut ClKernel,
        index: u32,
        arg: KernelArg<'_, ClMem>,
    ) -> Result<(), ClError> {
        match arg {
            KernelArg::Mem(mem) => {
                let handle = mem.raw;
                cl_try!((self.api.set_kernel_arg)(
                    kernel.raw,
                    index,
                    size_of::<cl_mem>(),
                    (&handle as *const cl_mem).cast(),
                ));
            }
            KernelArg::Int(value) => {
                cl_try!((self.api.set_kernel_arg)(
                    kernel.raw,
                    index,
                    size_of::<cl_int>(),
                    (&value as *const cl_int).cast(),
                ));
            }
        }
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: &ClQueue,
        kernel: &ClKernel,
        global_size: usize,
    ) -> Result<(), ClError> {
        let global = [global_size];
        cl_try!((self.api.enqueue_nd_range_kernel)(
            queue.raw,
            kernel.raw,
            1,
            ptr::null(),
            global.as_ptr(),
            ptr::null(),
            0,
            ptr::null(),
            ptr::null_mut(),
        ));
        Ok(())
    }

    fn finish(&self, queue: &ClQueue) -> Result<(), ClError> {
        cl_try!((self.api.finish)(queue.raw));
        Ok(())
    }

    fn read_buffer(&self, queue: &ClQueue, mem: &ClMem, out: &mut [u8]) -> Result<(), ClError> {
        cl_try!((self.api.enqueue_read_buffer)(
            queue.raw,
            mem.raw,
            CL_BLOCKING,
            0,
            out.len(),
            out.as_mut_ptr().cast(),
            0,
            ptr::null(),
            ptr::null_mut(),
        ));
        Ok(())
    }

    fn device_name(&self, device: DeviceId) -> Result<String, ClError> {
        let mut len = 0usize;
        cl_try!((self.api.get_device_info)(device.0, CL_DEVICE_NAME, 0, ptr::null_mut(), &mut len));
        let mut name = vec![0u8; len];
        cl_try!((self.api.get_device_info)(
            device.0,
            CL_DEVICE_NAME,
            len,
            name.as_mut_ptr().cast(),
            ptr::null_mut(),
        ));
        Ok(trim_nul(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_reported_with_candidates() {
        let config = BackendConfig {
            library_candidates: vec!["/nonexistent/libOpenCL-clmath-test.so".into()],
        };
        match ClApi::load(&config) {
            Err(ClError::LibraryNotFound(tried)) => {
                assert!(tried.contains("libOpenCL-clmath-test.so"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("a nonexistent path must not load"),
        }
        assert!(!is_driver_available(&config));
    }

    #[test]
    fn empty_candidate_list_fails() {
        let config = BackendConfig { library_candidates: Vec::new() };
        assert!(matches!(ClApi::load(&config), Err(ClError::LibraryNotFound(_))));
    }

    #[test]
    fn symbol_table_covers_release_entry_points() {
        assert_eq!(ClApi::SYMBOLS.len(), 19);
        for name in [
            "clReleaseMemObject",
            "clReleaseCommandQueue",
            "clReleaseKernel",
            "clReleaseProgram",
            "clReleaseContext",
        ] {
            assert!(ClApi::SYMBOLS.contains(&name), "{name} missing");
        }
    }

    #[test]
    fn trim_nul_stops_at_terminator() {
        assert_eq!(trim_nul(b"Radeon RX\0\0junk"), "Radeon RX");
        assert_eq!(trim_nul(b"no terminator"), "no terminator");
    }
}
