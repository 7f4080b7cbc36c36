//! Device abstraction the stages are dispatched through.

use std::fmt;

use crate::stages::StageLaunch;
use crate::{Error, Result};

/// How stages may use a buffer. The host may always upload into and read back from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn stage_writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Opaque reference to a buffer owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) usize);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Backend {
    /// rayon thread pool
    Cpu,
    /// wgpu compute (Vulkan, Metal, DX12, GL)
    Webgpu,
}

/// Information about a compute device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub backend: Backend,
    /// Index accepted by [`open_device`].
    pub index: usize,
    pub name: String,
    /// Whether this is a GPU rather than a CPU or software adapter.
    pub is_gpu: bool,
    /// Threads for CPU devices, maximum workgroup size for GPUs.
    pub parallelism: usize,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?} {}] {} ({}, parallelism {})",
            self.backend,
            self.index,
            self.name,
            if self.is_gpu { "gpu" } else { "cpu" },
            self.parallelism
        )
    }
}

/// A data-parallel executor for the equalization stages.
///
/// Storage returned by [`allocate_buffer`](Self::allocate_buffer) is zero-filled.
/// [`dispatch_stage`](Self::dispatch_stage) returns only once every work item
/// has finished and its writes are visible to the next stage and to
/// [`read_buffer`](Self::read_buffer).
pub trait ComputeDevice: Send {
    fn info(&self) -> DeviceInfo;

    fn allocate_buffer(&mut self, label: &str, size_bytes: usize, access: Access)
        -> Result<BufferHandle>;

    /// Upload `data` to the start of the buffer.
    fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()>;

    fn dispatch_stage(&mut self, launch: &StageLaunch) -> Result<()>;

    /// Copy of the buffer's first `size_bytes` bytes, as requested at allocation.
    fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>>;

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<()>;
}

/// All devices this build can run on, CPU first.
pub fn list_devices() -> Vec<DeviceInfo> {
    #[allow(unused_mut)]
    let mut devices = vec![crate::cpu::CpuDevice::describe(None)];
    #[cfg(feature = "webgpu")]
    devices.extend(crate::webgpu::probe_devices());
    devices
}

/// Open a device. `index` picks a WebGPU adapter from [`list_devices`]; `threads` sizes the CPU pool.
pub fn open_device(
    backend: Backend,
    index: Option<usize>,
    threads: Option<usize>,
) -> Result<Box<dyn ComputeDevice>> {
    match backend {
        Backend::Cpu => Ok(Box::new(crate::cpu::CpuDevice::new(threads)?)),
        #[cfg(feature = "webgpu")]
        Backend::Webgpu => Ok(Box::new(crate::webgpu::WebGpuDevice::new(index)?)),
        #[cfg(not(feature = "webgpu"))]
        Backend::Webgpu => {
            let _ = index;
            Err(Error::device(
                "WebGPU backend not compiled in; rebuild with --features webgpu",
            ))
        }
    }
}

/// Store `value` in the first released slot, or a new one. Returns its handle.
pub(crate) fn insert_slot<T>(slots: &mut Vec<Option<T>>, value: T) -> BufferHandle {
    match slots.iter().position(Option::is_none) {
        Some(i) => {
            slots[i] = Some(value);
            BufferHandle(i)
        }
        None => {
            slots.push(Some(value));
            BufferHandle(slots.len() - 1)
        }
    }
}

pub(crate) fn check_fits(handle: BufferHandle, size_bytes: usize, data: &[u8]) -> Result<()> {
    if data.len() > size_bytes {
        return Err(Error::device(format!(
            "{handle}: upload of {} bytes exceeds its {size_bytes} bytes",
            data.len()
        )));
    }
    Ok(())
}

/// Check a launch against the size and access of the buffers it names.
pub(crate) fn validate_launch(
    launch: &StageLaunch,
    lookup: impl Fn(BufferHandle) -> Result<(usize, Access)>,
) -> Result<()> {
    let (in_bytes, out_bytes) = launch.required_bytes();
    let bindings = launch
        .inputs
        .iter()
        .zip(in_bytes)
        .map(|(&h, need)| (h, need, false))
        .chain(
            launch
                .outputs
                .iter()
                .zip(out_bytes)
                .map(|(&h, need)| (h, need, true)),
        );
    for (handle, need, written) in bindings {
        let (size, access) = lookup(handle)?;
        if size < need {
            return Err(Error::device(format!(
                "{}: {handle} holds {size} bytes, needs {need}",
                launch.stage
            )));
        }
        if written && !access.stage_writable() {
            return Err(Error::device(format!(
                "{}: {handle} is read-only",
                launch.stage
            )));
        }
    }
    Ok(())
}
