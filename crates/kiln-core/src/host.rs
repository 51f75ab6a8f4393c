//! In-process emulated compute backend.
//!
//! `HostBackend` keeps device memory as byte vectors and records every
//! argument binding, so the registry, build and transfer protocols can be
//! exercised without a native runtime. Kernels are never executed: an
//! enqueue is recorded and nothing else.
//!
//! Program compile fails when the source contains an `#error` line, and the
//! offending lines become the build log. An entry point exists when the
//! source declares `void <entry>(`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    ComputeBackend, DeviceClass, DeviceInfo, MemAccess, WorkSize, STATUS_BUILD_PROGRAM_FAILURE,
    STATUS_DEVICE_NOT_FOUND, STATUS_INVALID_COMMAND_QUEUE, STATUS_INVALID_CONTEXT,
    STATUS_INVALID_DEVICE, STATUS_INVALID_KERNEL, STATUS_INVALID_KERNEL_NAME,
    STATUS_INVALID_MEM_OBJECT, STATUS_INVALID_PROGRAM, STATUS_INVALID_PROGRAM_EXECUTABLE,
    STATUS_INVALID_VALUE, STATUS_OUT_OF_RESOURCES,
};
use crate::{KilnError, Result};

/// Opaque handle to an emulated runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostHandle(u64);

/// An emulated device: platform index plus device index on that platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostDevice {
    pub platform: usize,
    pub index: usize,
}

/// A recorded kernel argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostArg {
    Memory(HostHandle),
    Bytes(Vec<u8>),
}

/// Counters of runtime calls, for asserting exactly-once behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub contexts_created: usize,
    pub queues_created: usize,
    pub programs_created: usize,
    pub compiles: usize,
    pub kernels_created: usize,
    pub buffers_allocated: usize,
    pub buffers_released: usize,
    pub kernels_released: usize,
    pub programs_released: usize,
    pub queues_released: usize,
    pub contexts_released: usize,
    pub writes: usize,
    pub reads: usize,
    pub launches: usize,
    pub flushes: usize,
    pub finishes: usize,
}

#[derive(Debug, Clone)]
struct DeviceSpec {
    class: DeviceClass,
    info: DeviceInfo,
}

#[derive(Debug)]
struct ProgramState {
    source: String,
    built: bool,
    options: Option<String>,
    log: String,
}

#[derive(Debug)]
struct KernelState {
    entry: String,
    args: BTreeMap<u32, HostArg>,
}

#[derive(Debug)]
struct MemoryState {
    access: MemAccess,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct HostState {
    platforms: Vec<Vec<DeviceSpec>>,
    next_handle: u64,
    contexts: HashSet<HostHandle>,
    queues: HashSet<HostHandle>,
    programs: HashMap<HostHandle, ProgramState>,
    kernels: HashMap<HostHandle, KernelState>,
    memories: HashMap<HostHandle, MemoryState>,
    launches: Vec<(String, WorkSize)>,
    stats: HostStats,
    allocations_left: Option<usize>,
    fail_context: bool,
    fail_finish: bool,
    memory_release_failures: usize,
    fail_build_log: bool,
    teardown: Vec<&'static str>,
}

impl HostState {
    fn handle(&mut self) -> HostHandle {
        self.next_handle += 1;
        HostHandle(self.next_handle)
    }

    fn device(&self, device: HostDevice) -> Option<&DeviceSpec> {
        self.platforms.get(device.platform)?.get(device.index)
    }
}

/// Emulated compute runtime. Clones share the same state.
#[derive(Debug, Clone)]
pub struct HostBackend {
    state: Arc<Mutex<HostState>>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// One platform exposing one GPU-class device.
    pub fn new() -> Self {
        Self::with_platforms(vec![vec![(DeviceClass::Gpu, Self::default_device_info())]])
    }

    /// Platforms, each with its list of devices.
    pub fn with_platforms(platforms: Vec<Vec<(DeviceClass, DeviceInfo)>>) -> Self {
        let platforms = platforms
            .into_iter()
            .map(|devices| {
                devices
                    .into_iter()
                    .map(|(class, info)| DeviceSpec { class, info })
                    .collect()
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(HostState { platforms, ..Default::default() })),
        }
    }

    pub fn default_device_info() -> DeviceInfo {
        DeviceInfo {
            name: "Host emulated device".into(),
            driver_version: "kiln-host 1.0".into(),
            little_endian: cfg!(target_endian = "little"),
            global_memory: 1 << 30,
        }
    }

    /// Let `n` more allocations succeed, then fail every one after.
    pub fn fail_allocations_after(&self, n: usize) {
        self.state.lock().allocations_left = Some(n);
    }

    pub fn fail_context_creation(&self, fail: bool) {
        self.state.lock().fail_context = fail;
    }

    pub fn fail_finish(&self, fail: bool) {
        self.state.lock().fail_finish = fail;
    }

    /// Fail the next `n` memory releases. A failed release leaves the memory live.
    pub fn fail_memory_releases(&self, n: usize) {
        self.state.lock().memory_release_failures = n;
    }

    pub fn fail_build_log(&self, fail: bool) {
        self.state.lock().fail_build_log = fail;
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().stats.clone()
    }

    /// Argument recorded in `slot` of `kernel`.
    pub fn arg(&self, kernel: HostHandle, slot: u32) -> Option<HostArg> {
        self.state.lock().kernels.get(&kernel)?.args.get(&slot).cloned()
    }

    /// Number of argument slots recorded on `kernel`.
    pub fn arg_count(&self, kernel: HostHandle) -> usize {
        self.state.lock().kernels.get(&kernel).map_or(0, |k| k.args.len())
    }

    pub fn memory_bytes(&self, memory: HostHandle) -> Option<Vec<u8>> {
        self.state.lock().memories.get(&memory).map(|m| m.bytes.clone())
    }

    pub fn memory_access(&self, memory: HostHandle) -> Option<MemAccess> {
        self.state.lock().memories.get(&memory).map(|m| m.access)
    }

    /// Device allocations not yet released.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().memories.len()
    }

    /// Kernel objects not yet released.
    pub fn live_kernels(&self) -> usize {
        self.state.lock().kernels.len()
    }

    /// Compile options of the most recently compiled program for `entry`.
    pub fn build_options(&self, entry: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .programs
            .iter()
            .filter(|(_, p)| declares_entry(&p.source, entry))
            .max_by_key(|(h, _)| **h)
            .and_then(|(_, p)| p.options.clone())
    }

    /// Successful flush, finish and release calls, in call order.
    pub fn teardown_calls(&self) -> Vec<&'static str> {
        self.state.lock().teardown.clone()
    }

    /// Every recorded launch: entry point and work size.
    pub fn launches(&self) -> Vec<(String, WorkSize)> {
        self.state.lock().launches.clone()
    }
}

/// Whether `source` declares `void <entry>(`, allowing whitespace around the name.
fn declares_entry(source: &str, entry: &str) -> bool {
    source.match_indices(entry).any(|(at, _)| {
        let before = source[..at].trim_end();
        let after = source[at + entry.len()..].trim_start();
        before.ends_with("void") && after.starts_with('(')
    })
}

impl ComputeBackend for HostBackend {
    type Platform = usize;
    type Device = HostDevice;
    type Context = HostHandle;
    type Queue = HostHandle;
    type Program = HostHandle;
    type Kernel = HostHandle;
    type Memory = HostHandle;

    fn platforms(&self) -> Result<Vec<usize>> {
        Ok((0..self.state.lock().platforms.len()).collect())
    }

    fn devices(&self, platform: usize, class: DeviceClass) -> Result<Vec<HostDevice>> {
        let state = self.state.lock();
        let devices: Vec<HostDevice> = state
            .platforms
            .get(platform)
            .ok_or_else(|| KilnError::native("clGetDeviceIDs", STATUS_INVALID_VALUE))?
            .iter()
            .enumerate()
            .filter(|(_, d)| d.class == class)
            .map(|(index, _)| HostDevice { platform, index })
            .collect();
        if devices.is_empty() {
            return Err(KilnError::native("clGetDeviceIDs", STATUS_DEVICE_NOT_FOUND));
        }
        Ok(devices)
    }

    fn device_info(&self, device: HostDevice) -> DeviceInfo {
        self.state
            .lock()
            .device(device)
            .map(|d| d.info.clone())
            .unwrap_or_default()
    }

    fn create_context(&self, device: HostDevice) -> Result<HostHandle> {
        let mut state = self.state.lock();
        if state.fail_context {
            return Err(KilnError::native("clCreateContext", STATUS_OUT_OF_RESOURCES));
        }
        if state.device(device).is_none() {
            return Err(KilnError::native("clCreateContext", STATUS_INVALID_DEVICE));
        }
        let handle = state.handle();
        state.contexts.insert(handle);
        state.stats.contexts_created += 1;
        Ok(handle)
    }

    fn create_queue(&self, context: &HostHandle, device: HostDevice) -> Result<HostHandle> {
        let mut state = self.state.lock();
        if !state.contexts.contains(context) {
            return Err(KilnError::native("clCreateCommandQueue", STATUS_INVALID_CONTEXT));
        }
        if state.device(device).is_none() {
            return Err(KilnError::native("clCreateCommandQueue", STATUS_INVALID_DEVICE));
        }
        let handle = state.handle();
        state.queues.insert(handle);
        state.stats.queues_created += 1;
        Ok(handle)
    }

    fn create_program(&self, context: &HostHandle, source: &str) -> Result<HostHandle> {
        let mut state = self.state.lock();
        if !state.contexts.contains(context) {
            return Err(KilnError::native("clCreateProgramWithSource", STATUS_INVALID_CONTEXT));
        }
        let handle = state.handle();
        state.programs.insert(
            handle,
            ProgramState {
                source: source.to_string(),
                built: false,
                options: None,
                log: String::new(),
            },
        );
        state.stats.programs_created += 1;
        Ok(handle)
    }

    fn compile_program(&self, program: &HostHandle, _device: HostDevice, options: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.stats.compiles += 1;
        let program = state
            .programs
            .get_mut(program)
            .ok_or_else(|| KilnError::native("clBuildProgram", STATUS_INVALID_PROGRAM))?;
        program.options = Some(options.to_string());
        let errors: Vec<&str> = program
            .source
            .lines()
            .filter(|line| line.trim_start().starts_with("#error"))
            .collect();
        if errors.is_empty() {
            program.built = true;
            program.log.clear();
            Ok(())
        } else {
            program.built = false;
            program.log = errors.join("\n");
            Err(KilnError::native("clBuildProgram", STATUS_BUILD_PROGRAM_FAILURE))
        }
    }

    fn build_log(&self, program: &HostHandle, _device: HostDevice) -> Result<String> {
        let state = self.state.lock();
        if state.fail_build_log {
            return Err(KilnError::native("clGetProgramBuildInfo", STATUS_INVALID_VALUE));
        }
        state
            .programs
            .get(program)
            .map(|p| p.log.clone())
            .ok_or_else(|| KilnError::native("clGetProgramBuildInfo", STATUS_INVALID_PROGRAM))
    }

    fn create_kernel(&self, program: &HostHandle, entry_point: &str) -> Result<HostHandle> {
        let mut state = self.state.lock();
        let program = state
            .programs
            .get(program)
            .ok_or_else(|| KilnError::native("clCreateKernel", STATUS_INVALID_PROGRAM))?;
        if !program.built {
            return Err(KilnError::native("clCreateKernel", STATUS_INVALID_PROGRAM_EXECUTABLE));
        }
        if !declares_entry(&program.source, entry_point) {
            return Err(KilnError::native("clCreateKernel", STATUS_INVALID_KERNEL_NAME));
        }
        let handle = state.handle();
        state.kernels.insert(
            handle,
            KernelState {
                entry: entry_point.to_string(),
                args: BTreeMap::new(),
            },
        );
        state.stats.kernels_created += 1;
        Ok(handle)
    }

    fn create_buffer(&self, context: &HostHandle, access: MemAccess, size: usize) -> Result<HostHandle> {
        let mut state = self.state.lock();
        if !state.contexts.contains(context) {
            return Err(KilnError::native("clCreateBuffer", STATUS_INVALID_CONTEXT));
        }
        if let Some(left) = state.allocations_left.as_mut() {
            if *left == 0 {
                return Err(KilnError::native("clCreateBuffer", STATUS_OUT_OF_RESOURCES));
            }
            *left -= 1;
        }
        if size == 0 {
            return Err(KilnError::native("clCreateBuffer", STATUS_INVALID_VALUE));
        }
        let handle = state.handle();
        state.memories.insert(handle, MemoryState { access, bytes: vec![0; size] });
        state.stats.buffers_allocated += 1;
        Ok(handle)
    }

    fn set_arg_memory(&self, kernel: &HostHandle, slot: u32, memory: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.memories.contains_key(&memory) {
            return Err(KilnError::native("clSetKernelArg", STATUS_INVALID_MEM_OBJECT));
        }
        let kernel = state
            .kernels
            .get_mut(kernel)
            .ok_or_else(|| KilnError::native("clSetKernelArg", STATUS_INVALID_KERNEL))?;
        kernel.args.insert(slot, HostArg::Memory(memory));
        Ok(())
    }

    fn set_arg_bytes(&self, kernel: &HostHandle, slot: u32, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let kernel = state
            .kernels
            .get_mut(kernel)
            .ok_or_else(|| KilnError::native("clSetKernelArg", STATUS_INVALID_KERNEL))?;
        kernel.args.insert(slot, HostArg::Bytes(bytes.to_vec()));
        Ok(())
    }

    fn write_buffer(&self, queue: &HostHandle, memory: HostHandle, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.contains(queue) {
            return Err(KilnError::native("clEnqueueWriteBuffer", STATUS_INVALID_COMMAND_QUEUE));
        }
        let target = state
            .memories
            .get_mut(&memory)
            .ok_or_else(|| KilnError::native("clEnqueueWriteBuffer", STATUS_INVALID_MEM_OBJECT))?;
        if data.len() > target.bytes.len() {
            return Err(KilnError::native("clEnqueueWriteBuffer", STATUS_INVALID_VALUE));
        }
        target.bytes[..data.len()].copy_from_slice(data);
        state.stats.writes += 1;
        Ok(())
    }

    fn read_buffer(&self, queue: &HostHandle, memory: HostHandle, out: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.contains(queue) {
            return Err(KilnError::native("clEnqueueReadBuffer", STATUS_INVALID_COMMAND_QUEUE));
        }
        let source = state
            .memories
            .get(&memory)
            .ok_or_else(|| KilnError::native("clEnqueueReadBuffer", STATUS_INVALID_MEM_OBJECT))?;
        if out.len() > source.bytes.len() {
            return Err(KilnError::native("clEnqueueReadBuffer", STATUS_INVALID_VALUE));
        }
        out.copy_from_slice(&source.bytes[..out.len()]);
        state.stats.reads += 1;
        Ok(())
    }

    fn enqueue_kernel(&self, queue: &HostHandle, kernel: &HostHandle, work: &WorkSize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.contains(queue) {
            return Err(KilnError::native("clEnqueueNDRangeKernel", STATUS_INVALID_COMMAND_QUEUE));
        }
        let entry = state
            .kernels
            .get(kernel)
            .map(|k| k.entry.clone())
            .ok_or_else(|| KilnError::native("clEnqueueNDRangeKernel", STATUS_INVALID_KERNEL))?;
        state.launches.push((entry, *work));
        state.stats.launches += 1;
        Ok(())
    }

    fn flush(&self, queue: &HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.contains(queue) {
            return Err(KilnError::native("clFlush", STATUS_INVALID_COMMAND_QUEUE));
        }
        state.stats.flushes += 1;
        state.teardown.push("clFlush");
        Ok(())
    }

    fn finish(&self, queue: &HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_finish || !state.queues.contains(queue) {
            return Err(KilnError::native("clFinish", STATUS_INVALID_COMMAND_QUEUE));
        }
        state.stats.finishes += 1;
        state.teardown.push("clFinish");
        Ok(())
    }

    fn release_memory(&self, memory: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.memory_release_failures > 0 {
            state.memory_release_failures -= 1;
            return Err(KilnError::native("clReleaseMemObject", STATUS_OUT_OF_RESOURCES));
        }
        state
            .memories
            .remove(&memory)
            .ok_or_else(|| KilnError::native("clReleaseMemObject", STATUS_INVALID_MEM_OBJECT))?;
        state.stats.buffers_released += 1;
        state.teardown.push("clReleaseMemObject");
        Ok(())
    }

    fn release_kernel(&self, kernel: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .kernels
            .remove(&kernel)
            .ok_or_else(|| KilnError::native("clReleaseKernel", STATUS_INVALID_KERNEL))?;
        state.stats.kernels_released += 1;
        state.teardown.push("clReleaseKernel");
        Ok(())
    }

    fn release_program(&self, program: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .programs
            .remove(&program)
            .ok_or_else(|| KilnError::native("clReleaseProgram", STATUS_INVALID_PROGRAM))?;
        state.stats.programs_released += 1;
        state.teardown.push("clReleaseProgram");
        Ok(())
    }

    fn release_queue(&self, queue: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.remove(&queue) {
            return Err(KilnError::native("clReleaseCommandQueue", STATUS_INVALID_COMMAND_QUEUE));
        }
        state.stats.queues_released += 1;
        state.teardown.push("clReleaseCommandQueue");
        Ok(())
    }

    fn release_context(&self, context: HostHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.contexts.remove(&context) {
            return Err(KilnError::native("clReleaseContext", STATUS_INVALID_CONTEXT));
        }
        state.stats.contexts_released += 1;
        state.teardown.push("clReleaseContext");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declares_entry() {
        assert!(declares_entry("__kernel void sha256GPU(__global uchar* r) {}", "sha256GPU"));
        assert!(declares_entry("__kernel void\n  testBuffer (int a)", "testBuffer"));
        assert!(!declares_entry("__kernel void sha256GPU_v2(int a)", "sha256GPU"));
        assert!(!declares_entry("// sha256GPU(", "sha256GPU"));
    }

    #[test]
    fn test_device_selection_by_class() {
        let backend = HostBackend::with_platforms(vec![
            vec![(DeviceClass::Cpu, HostBackend::default_device_info())],
            vec![(DeviceClass::Gpu, HostBackend::default_device_info())],
        ]);
        let err = backend.devices(0, DeviceClass::Gpu).unwrap_err();
        assert_eq!(err.status(), Some(STATUS_DEVICE_NOT_FOUND));
        assert_eq!(backend.devices(1, DeviceClass::Gpu).unwrap(), vec![HostDevice { platform: 1, index: 0 }]);
    }

    #[test]
    fn test_compile_failure_log() {
        let backend = HostBackend::new();
        let device = backend.devices(0, DeviceClass::Gpu).unwrap()[0];
        let context = backend.create_context(device).unwrap();
        let program = backend
            .create_program(&context, "__kernel void k() {}\n#error missing secp256k1.h")
            .unwrap();
        let err = backend.compile_program(&program, device, "-I .").unwrap_err();
        assert_eq!(err.status(), Some(STATUS_BUILD_PROGRAM_FAILURE));
        assert_eq!(backend.build_log(&program, device).unwrap(), "#error missing secp256k1.h");
        assert_eq!(
            backend.create_kernel(&program, "k").unwrap_err().status(),
            Some(STATUS_INVALID_PROGRAM_EXECUTABLE)
        );
    }

    #[test]
    fn test_buffer_transfer_and_release() {
        let backend = HostBackend::new();
        let device = backend.devices(0, DeviceClass::Gpu).unwrap()[0];
        let context = backend.create_context(device).unwrap();
        let queue = backend.create_queue(&context, device).unwrap();
        let mem = backend.create_buffer(&context, MemAccess::ReadOnly, 8).unwrap();

        backend.write_buffer(&queue, mem, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        backend.read_buffer(&queue, mem, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 0]);
        assert!(backend.write_buffer(&queue, mem, &[0; 9]).is_err());

        backend.release_memory(mem).unwrap();
        assert_eq!(
            backend.release_memory(mem).unwrap_err().status(),
            Some(STATUS_INVALID_MEM_OBJECT)
        );
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_allocation_failure_injection() {
        let backend = HostBackend::new();
        let device = backend.devices(0, DeviceClass::Gpu).unwrap()[0];
        let context = backend.create_context(device).unwrap();
        backend.fail_allocations_after(1);
        assert!(backend.create_buffer(&context, MemAccess::ReadWrite, 4).is_ok());
        assert_eq!(
            backend.create_buffer(&context, MemAccess::ReadWrite, 4).unwrap_err().status(),
            Some(STATUS_OUT_OF_RESOURCES)
        );
    }

    #[test]
    fn test_memory_release_failure_injection() {
        let backend = HostBackend::new();
        let device = backend.devices(0, DeviceClass::Gpu).unwrap()[0];
        let context = backend.create_context(device).unwrap();
        let mem = backend.create_buffer(&context, MemAccess::ReadWrite, 4).unwrap();
        backend.fail_memory_releases(1);

        assert!(backend.release_memory(mem).is_err());
        assert_eq!(backend.live_buffers(), 1);
        backend.release_memory(mem).unwrap();
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.teardown_calls(), vec!["clReleaseMemObject"]);
    }
}
