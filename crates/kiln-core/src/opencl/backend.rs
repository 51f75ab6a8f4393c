//! [`ComputeBackend`] over the runtime-loaded OpenCL API.

use std::ffi::{c_char, c_void, CString};
use std::ptr;

use super::ffi::{self, ClBitfield, ClContext, ClDeviceId, ClInt, ClKernel, ClMem, ClPlatformId, ClProgram, ClUint, OpenClApi};
use crate::backend::{check_status, ComputeBackend, DeviceClass, DeviceInfo, MemAccess, WorkSize};
use crate::{KilnError, Result};

/// The system OpenCL runtime.
#[derive(Clone, Copy)]
pub struct OpenClBackend {
    api: &'static OpenClApi,
}

impl OpenClBackend {
    /// Load the ICD loader.
    pub fn load() -> Result<Self> {
        let api = ffi::opencl_api()
            .ok_or_else(|| KilnError::RuntimeUnavailable("no OpenCL ICD loader found".into()))?;
        Ok(Self { api })
    }

    fn device_info_bytes(&self, device: ClDeviceId, param: ClUint) -> Option<Vec<u8>> {
        let mut size = 0usize;
        let status = unsafe { (self.api.get_device_info)(device, param, 0, ptr::null_mut(), &mut size) };
        if status != 0 || size == 0 {
            return None;
        }
        let mut bytes = vec![0u8; size];
        let status = unsafe {
            (self.api.get_device_info)(device, param, size, bytes.as_mut_ptr() as *mut c_void, ptr::null_mut())
        };
        (status == 0).then_some(bytes)
    }

    fn device_info_string(&self, device: ClDeviceId, param: ClUint) -> String {
        self.device_info_bytes(device, param)
            .map(|bytes| c_bytes_to_string(&bytes))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OpenClBackend")
    }
}

/// Text up to the first NUL.
fn c_bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn device_type(class: DeviceClass) -> ClBitfield {
    match class {
        DeviceClass::Gpu => ffi::CL_DEVICE_TYPE_GPU,
        DeviceClass::Cpu => ffi::CL_DEVICE_TYPE_CPU,
    }
}

fn mem_flags(access: MemAccess) -> ClBitfield {
    match access {
        MemAccess::ReadWrite => ffi::CL_MEM_READ_WRITE,
        MemAccess::WriteOnly => ffi::CL_MEM_WRITE_ONLY,
        MemAccess::ReadOnly => ffi::CL_MEM_READ_ONLY,
    }
}

fn to_cstring(text: &str, what: &str) -> Result<CString> {
    CString::new(text).map_err(|_| KilnError::Config(format!("{what} contains a NUL byte")))
}

impl ComputeBackend for OpenClBackend {
    type Platform = ClPlatformId;
    type Device = ClDeviceId;
    type Context = ClContext;
    type Queue = ffi::ClCommandQueue;
    type Program = ClProgram;
    type Kernel = ClKernel;
    type Memory = ClMem;

    fn platforms(&self) -> Result<Vec<ClPlatformId>> {
        let mut count: ClUint = 0;
        let status = unsafe { (self.api.get_platform_ids)(0, ptr::null_mut(), &mut count) };
        if status == ffi::CL_PLATFORM_NOT_FOUND_KHR {
            return Ok(Vec::new());
        }
        check_status(status, "clGetPlatformIDs")?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut ids = vec![ptr::null_mut(); count as usize];
        check_status(
            unsafe { (self.api.get_platform_ids)(count, ids.as_mut_ptr(), ptr::null_mut()) },
            "clGetPlatformIDs",
        )?;
        Ok(ids)
    }

    fn devices(&self, platform: ClPlatformId, class: DeviceClass) -> Result<Vec<ClDeviceId>> {
        let kind = device_type(class);
        let mut count: ClUint = 0;
        check_status(
            unsafe { (self.api.get_device_ids)(platform, kind, 0, ptr::null_mut(), &mut count) },
            "clGetDeviceIDs",
        )?;
        let mut ids = vec![ptr::null_mut(); count as usize];
        if count > 0 {
            check_status(
                unsafe { (self.api.get_device_ids)(platform, kind, count, ids.as_mut_ptr(), ptr::null_mut()) },
                "clGetDeviceIDs",
            )?;
        }
        Ok(ids)
    }

    fn device_info(&self, device: ClDeviceId) -> DeviceInfo {
        let little_endian = self
            .device_info_bytes(device, ffi::CL_DEVICE_ENDIAN_LITTLE)
            .and_then(|b| b.get(..4).map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) != 0))
            .unwrap_or(false);
        let global_memory = self
            .device_info_bytes(device, ffi::CL_DEVICE_GLOBAL_MEM_SIZE)
            .and_then(|b| b.get(..8).map(|b| u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])))
            .unwrap_or(0);
        DeviceInfo {
            name: self.device_info_string(device, ffi::CL_DEVICE_NAME),
            driver_version: self.device_info_string(device, ffi::CL_DRIVER_VERSION),
            little_endian,
            global_memory,
        }
    }

    fn create_context(&self, device: ClDeviceId) -> Result<ClContext> {
        let mut status: ClInt = 0;
        let context = unsafe {
            (self.api.create_context)(ptr::null(), 1, &device, ptr::null(), ptr::null_mut(), &mut status)
        };
        check_status(status, "clCreateContext")?;
        Ok(context)
    }

    fn create_queue(&self, context: &ClContext, device: ClDeviceId) -> Result<ffi::ClCommandQueue> {
        let mut status: ClInt = 0;
        let queue = unsafe {
            (self.api.create_command_queue)(
                *context,
                device,
                ffi::CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE,
                &mut status,
            )
        };
        check_status(status, "clCreateCommandQueue")?;
        Ok(queue)
    }

    fn create_program(&self, context: &ClContext, source: &str) -> Result<ClProgram> {
        let mut status: ClInt = 0;
        let text = source.as_ptr() as *const c_char;
        let len = source.len();
        let program =
            unsafe { (self.api.create_program_with_source)(*context, 1, &text, &len, &mut status) };
        check_status(status, "clCreateProgramWithSource")?;
        Ok(program)
    }

    fn compile_program(&self, program: &ClProgram, device: ClDeviceId, options: &str) -> Result<()> {
        let options = to_cstring(options, "build options")?;
        check_status(
            unsafe {
                (self.api.build_program)(*program, 1, &device, options.as_ptr(), ptr::null(), ptr::null_mut())
            },
            "clBuildProgram",
        )
    }

    fn build_log(&self, program: &ClProgram, device: ClDeviceId) -> Result<String> {
        let mut size = 0usize;
        check_status(
            unsafe {
                (self.api.get_program_build_info)(
                    *program,
                    device,
                    ffi::CL_PROGRAM_BUILD_LOG,
                    0,
                    ptr::null_mut(),
                    &mut size,
                )
            },
            "clGetProgramBuildInfo",
        )?;
        let mut log = vec![0u8; size];
        if size > 0 {
            check_status(
                unsafe {
                    (self.api.get_program_build_info)(
                        *program,
                        device,
                        ffi::CL_PROGRAM_BUILD_LOG,
                        size,
                        log.as_mut_ptr() as *mut c_void,
                        ptr::null_mut(),
                    )
                },
                "clGetProgramBuildInfo",
            )?;
        }
        Ok(c_bytes_to_string(&log))
    }

    fn create_kernel(&self, program: &ClProgram, entry_point: &str) -> Result<ClKernel> {
        let entry = to_cstring(entry_point, "entry point")?;
        let mut status: ClInt = 0;
        let kernel = unsafe { (self.api.create_kernel)(*program, entry.as_ptr(), &mut status) };
        check_status(status, "clCreateKernel")?;
        Ok(kernel)
    }

    fn create_buffer(&self, context: &ClContext, access: MemAccess, size: usize) -> Result<ClMem> {
        let mut status: ClInt = 0;
        let memory =
            unsafe { (self.api.create_buffer)(*context, mem_flags(access), size, ptr::null_mut(), &mut status) };
        check_status(status, "clCreateBuffer")?;
        Ok(memory)
    }

    fn set_arg_memory(&self, kernel: &ClKernel, slot: u32, memory: ClMem) -> Result<()> {
        check_status(
            unsafe {
                (self.api.set_kernel_arg)(
                    *kernel,
                    slot,
                    std::mem::size_of::<ClMem>(),
                    &memory as *const ClMem as *const c_void,
                )
            },
            "clSetKernelArg",
        )
    }

    fn set_arg_bytes(&self, kernel: &ClKernel, slot: u32, bytes: &[u8]) -> Result<()> {
        check_status(
            unsafe { (self.api.set_kernel_arg)(*kernel, slot, bytes.len(), bytes.as_ptr() as *const c_void) },
            "clSetKernelArg",
        )
    }

    fn write_buffer(&self, queue: &ffi::ClCommandQueue, memory: ClMem, data: &[u8]) -> Result<()> {
        check_status(
            unsafe {
                (self.api.enqueue_write_buffer)(
                    *queue,
                    memory,
                    ffi::CL_TRUE,
                    0,
                    data.len(),
                    data.as_ptr() as *const c_void,
                    0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "clEnqueueWriteBuffer",
        )
    }

    fn read_buffer(&self, queue: &ffi::ClCommandQueue, memory: ClMem, out: &mut [u8]) -> Result<()> {
        check_status(
            unsafe {
                (self.api.enqueue_read_buffer)(
                    *queue,
                    memory,
                    ffi::CL_TRUE,
                    0,
                    out.len(),
                    out.as_mut_ptr() as *mut c_void,
                    0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "clEnqueueReadBuffer",
        )
    }

    fn enqueue_kernel(&self, queue: &ffi::ClCommandQueue, kernel: &ClKernel, work: &WorkSize) -> Result<()> {
        check_status(
            unsafe {
                (self.api.enqueue_nd_range_kernel)(
                    *queue,
                    *kernel,
                    work.dimensions(),
                    ptr::null(),
                    work.global.as_ptr(),
                    work.local.as_ptr(),
                    0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "clEnqueueNDRangeKernel",
        )
    }

    fn flush(&self, queue: &ffi::ClCommandQueue) -> Result<()> {
        check_status(unsafe { (self.api.flush)(*queue) }, "clFlush")
    }

    fn finish(&self, queue: &ffi::ClCommandQueue) -> Result<()> {
        check_status(unsafe { (self.api.finish)(*queue) }, "clFinish")
    }

    fn release_memory(&self, memory: ClMem) -> Result<()> {
        check_status(unsafe { (self.api.release_mem_object)(memory) }, "clReleaseMemObject")
    }

    fn release_kernel(&self, kernel: ClKernel) -> Result<()> {
        check_status(unsafe { (self.api.release_kernel)(kernel) }, "clReleaseKernel")
    }

    fn release_program(&self, program: ClProgram) -> Result<()> {
        check_status(unsafe { (self.api.release_program)(program) }, "clReleaseProgram")
    }

    fn release_queue(&self, queue: ffi::ClCommandQueue) -> Result<()> {
        check_status(unsafe { (self.api.release_command_queue)(queue) }, "clReleaseCommandQueue")
    }

    fn release_context(&self, context: ClContext) -> Result<()> {
        check_status(unsafe { (self.api.release_context)(context) }, "clReleaseContext")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_bytes_to_string() {
        assert_eq!(c_bytes_to_string(b"Intel(R) UHD\0\0"), "Intel(R) UHD");
        assert_eq!(c_bytes_to_string(b"no nul"), "no nul");
        assert_eq!(c_bytes_to_string(b""), "");
    }

    #[test]
    fn test_flags() {
        assert_eq!(mem_flags(MemAccess::WriteOnly), 2);
        assert_eq!(mem_flags(MemAccess::ReadOnly), 4);
        assert_eq!(device_type(DeviceClass::Gpu), 4);
        assert_eq!(device_type(DeviceClass::Cpu), 2);
    }
}
