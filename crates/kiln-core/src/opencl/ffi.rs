//! Runtime-loaded OpenCL function pointers via dlopen.
//!
//! Only the ICD loader is needed at run time; nothing links against an
//! OpenCL SDK at build time.

use std::ffi::{c_char, c_void};
use std::sync::OnceLock;

use libloading::Library;

// ---------------------------------------------------------------------------
// Types and constants
// ---------------------------------------------------------------------------

pub type ClInt = i32;
pub type ClUint = u32;
pub type ClBitfield = u64;
pub type ClBool = ClUint;

pub type ClPlatformId = *mut c_void;
pub type ClDeviceId = *mut c_void;
pub type ClContext = *mut c_void;
pub type ClCommandQueue = *mut c_void;
pub type ClProgram = *mut c_void;
pub type ClKernel = *mut c_void;
pub type ClMem = *mut c_void;
pub type ClEvent = *mut c_void;

pub const CL_TRUE: ClBool = 1;

pub const CL_PLATFORM_NOT_FOUND_KHR: ClInt = -1001;

pub const CL_DEVICE_TYPE_CPU: ClBitfield = 1 << 1;
pub const CL_DEVICE_TYPE_GPU: ClBitfield = 1 << 2;

pub const CL_DEVICE_GLOBAL_MEM_SIZE: ClUint = 0x101F;
pub const CL_DEVICE_ENDIAN_LITTLE: ClUint = 0x1026;
pub const CL_DEVICE_NAME: ClUint = 0x102B;
pub const CL_DRIVER_VERSION: ClUint = 0x102D;

pub const CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE: ClBitfield = 1 << 0;

pub const CL_MEM_READ_WRITE: ClBitfield = 1 << 0;
pub const CL_MEM_WRITE_ONLY: ClBitfield = 1 << 1;
pub const CL_MEM_READ_ONLY: ClBitfield = 1 << 2;

pub const CL_PROGRAM_BUILD_LOG: ClUint = 0x1183;

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnGetPlatformIds = unsafe extern "C" fn(ClUint, *mut ClPlatformId, *mut ClUint) -> ClInt;
type FnGetDeviceIds = unsafe extern "C" fn(
    ClPlatformId, ClBitfield, ClUint, *mut ClDeviceId, *mut ClUint,
) -> ClInt;
type FnGetDeviceInfo = unsafe extern "C" fn(
    ClDeviceId, ClUint, usize, *mut c_void, *mut usize,
) -> ClInt;
type FnCreateContext = unsafe extern "C" fn(
    *const isize,                 // properties
    ClUint,
    *const ClDeviceId,
    *const c_void,                // notify callback (null)
    *mut c_void,                  // user data
    *mut ClInt,
) -> ClContext;
type FnCreateCommandQueue = unsafe extern "C" fn(
    ClContext, ClDeviceId, ClBitfield, *mut ClInt,
) -> ClCommandQueue;
type FnCreateProgramWithSource = unsafe extern "C" fn(
    ClContext, ClUint, *const *const c_char, *const usize, *mut ClInt,
) -> ClProgram;
type FnBuildProgram = unsafe extern "C" fn(
    ClProgram,
    ClUint,
    *const ClDeviceId,
    *const c_char,                // options
    *const c_void,                // notify callback (null)
    *mut c_void,
) -> ClInt;
type FnGetProgramBuildInfo = unsafe extern "C" fn(
    ClProgram, ClDeviceId, ClUint, usize, *mut c_void, *mut usize,
) -> ClInt;
type FnCreateKernel = unsafe extern "C" fn(ClProgram, *const c_char, *mut ClInt) -> ClKernel;
type FnCreateBuffer = unsafe extern "C" fn(
    ClContext, ClBitfield, usize, *mut c_void, *mut ClInt,
) -> ClMem;
type FnSetKernelArg = unsafe extern "C" fn(ClKernel, ClUint, usize, *const c_void) -> ClInt;
type FnEnqueueWriteBuffer = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClBool,                       // blocking
    usize,                        // offset
    usize,                        // size
    *const c_void,
    ClUint,
    *const ClEvent,
    *mut ClEvent,
) -> ClInt;
type FnEnqueueReadBuffer = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClBool,
    usize,
    usize,
    *mut c_void,
    ClUint,
    *const ClEvent,
    *mut ClEvent,
) -> ClInt;
type FnEnqueueNdRangeKernel = unsafe extern "C" fn(
    ClCommandQueue,
    ClKernel,
    ClUint,                       // work dim
    *const usize,                 // global offset (null)
    *const usize,                 // global size
    *const usize,                 // local size
    ClUint,
    *const ClEvent,
    *mut ClEvent,
) -> ClInt;
type FnQueueOp = unsafe extern "C" fn(ClCommandQueue) -> ClInt;
type FnRelease = unsafe extern "C" fn(*mut c_void) -> ClInt;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct OpenClApi {
    _lib: Library,
    pub get_platform_ids: FnGetPlatformIds,
    pub get_device_ids: FnGetDeviceIds,
    pub get_device_info: FnGetDeviceInfo,
    pub create_context: FnCreateContext,
    pub create_command_queue: FnCreateCommandQueue,
    pub create_program_with_source: FnCreateProgramWithSource,
    pub build_program: FnBuildProgram,
    pub get_program_build_info: FnGetProgramBuildInfo,
    pub create_kernel: FnCreateKernel,
    pub create_buffer: FnCreateBuffer,
    pub set_kernel_arg: FnSetKernelArg,
    pub enqueue_write_buffer: FnEnqueueWriteBuffer,
    pub enqueue_read_buffer: FnEnqueueReadBuffer,
    pub enqueue_nd_range_kernel: FnEnqueueNdRangeKernel,
    pub flush: FnQueueOp,
    pub finish: FnQueueOp,
    pub release_mem_object: FnRelease,
    pub release_kernel: FnRelease,
    pub release_program: FnRelease,
    pub release_command_queue: FnRelease,
    pub release_context: FnRelease,
}

// Safety: OpenCL entry points are thread-safe except clSetKernelArg on a
// shared kernel, which callers serialize.
unsafe impl Send for OpenClApi {}
unsafe impl Sync for OpenClApi {}

// ---------------------------------------------------------------------------
// Library loading
// ---------------------------------------------------------------------------

const LIBRARY_NAMES: &[&str] = &[
    "libOpenCL.so.1",
    "libOpenCL.so",
    "OpenCL.dll",
    "/System/Library/Frameworks/OpenCL.framework/OpenCL",
];

static OPENCL_API: OnceLock<Option<OpenClApi>> = OnceLock::new();

impl OpenClApi {
    fn try_load() -> Option<Self> {
        let lib = LIBRARY_NAMES
            .iter()
            .find_map(|name| unsafe { Library::new(name) }.ok())?;
        unsafe {
            let api = OpenClApi {
                get_platform_ids: *lib.get::<FnGetPlatformIds>(b"clGetPlatformIDs\0").ok()?,
                get_device_ids: *lib.get::<FnGetDeviceIds>(b"clGetDeviceIDs\0").ok()?,
                get_device_info: *lib.get::<FnGetDeviceInfo>(b"clGetDeviceInfo\0").ok()?,
                create_context: *lib.get::<FnCreateContext>(b"clCreateContext\0").ok()?,
                create_command_queue: *lib.get::<FnCreateCommandQueue>(b"clCreateCommandQueue\0").ok()?,
                create_program_with_source: *lib
                    .get::<FnCreateProgramWithSource>(b"clCreateProgramWithSource\0")
                    .ok()?,
                build_program: *lib.get::<FnBuildProgram>(b"clBuildProgram\0").ok()?,
                get_program_build_info: *lib.get::<FnGetProgramBuildInfo>(b"clGetProgramBuildInfo\0").ok()?,
                create_kernel: *lib.get::<FnCreateKernel>(b"clCreateKernel\0").ok()?,
                create_buffer: *lib.get::<FnCreateBuffer>(b"clCreateBuffer\0").ok()?,
                set_kernel_arg: *lib.get::<FnSetKernelArg>(b"clSetKernelArg\0").ok()?,
                enqueue_write_buffer: *lib.get::<FnEnqueueWriteBuffer>(b"clEnqueueWriteBuffer\0").ok()?,
                enqueue_read_buffer: *lib.get::<FnEnqueueReadBuffer>(b"clEnqueueReadBuffer\0").ok()?,
                enqueue_nd_range_kernel: *lib
                    .get::<FnEnqueueNdRangeKernel>(b"clEnqueueNDRangeKernel\0")
                    .ok()?,
                flush: *lib.get::<FnQueueOp>(b"clFlush\0").ok()?,
                finish: *lib.get::<FnQueueOp>(b"clFinish\0").ok()?,
                release_mem_object: *lib.get::<FnRelease>(b"clReleaseMemObject\0").ok()?,
                release_kernel: *lib.get::<FnRelease>(b"clReleaseKernel\0").ok()?,
                release_program: *lib.get::<FnRelease>(b"clReleaseProgram\0").ok()?,
                release_command_queue: *lib.get::<FnRelease>(b"clReleaseCommandQueue\0").ok()?,
                release_context: *lib.get::<FnRelease>(b"clReleaseContext\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// Get the runtime-loaded OpenCL API. Returns None if no ICD loader is found.
pub fn opencl_api() -> Option<&'static OpenClApi> {
    OPENCL_API.get_or_init(OpenClApi::try_load).as_ref()
}
