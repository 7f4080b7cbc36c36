//! WebGPU device: the four stages as wgpu compute pipelines.
//!
//! All kernels live in one WGSL module (`kernels/histeq.wgsl`) with an entry
//! point per stage. Every stage is its own queue submission followed by a
//! blocking device poll, so a stage never observes a partially written table.
//!
//! Validation and out-of-memory errors are caught with error scopes and
//! returned as [`Error::Device`] instead of reaching wgpu's uncaptured error
//! handler.

use wgpu::util::DeviceExt;

use crate::device::{check_fits, insert_slot, validate_launch, Access, Backend, BufferHandle, ComputeDevice, DeviceInfo};
use crate::stages::{StageId, StageLaunch, WORKGROUP_SIZE};
use crate::{Error, Result};

const HISTEQ_KERNEL_SOURCE: &str = include_str!("../../kernels/histeq.wgsl");

/// Uniform block shared by every entry point. Matches `Params` in the WGSL.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    pixel_count: u32,
    dispatch_width: u32,
    _pad: [u32; 2],
}

const PARAMS_BINDING: u32 = 0;

/// WGSL binding numbers of a stage's inputs and outputs, in launch order.
fn binding_slots(stage: StageId) -> (&'static [u32], &'static [u32]) {
    match stage {
        StageId::AccumulateHistogram => (&[1], &[2]),
        StageId::ReduceCumulative => (&[2], &[3]),
        StageId::BuildLut => (&[3], &[4]),
        StageId::BackProject => (&[1, 4], &[5]),
    }
}

fn uses_params(stage: StageId) -> bool {
    stage != StageId::ReduceCumulative
}

fn entry_point(stage: StageId) -> &'static str {
    match stage {
        StageId::AccumulateHistogram => "accumulate_histogram",
        StageId::ReduceCumulative => "reduce_cumulative",
        StageId::BuildLut => "build_lut",
        StageId::BackProject => "back_project",
    }
}

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

fn is_gpu(info: &wgpu::AdapterInfo) -> bool {
    matches!(
        info.device_type,
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
    )
}

fn describe(index: usize, adapter: &wgpu::Adapter) -> DeviceInfo {
    let info = adapter.get_info();
    DeviceInfo {
        backend: Backend::Webgpu,
        index,
        name: format!("{} ({:?})", info.name, info.backend),
        is_gpu: is_gpu(&info),
        parallelism: adapter.limits().max_compute_workgroup_size_x as usize,
    }
}

/// Probe all available adapters without creating a device.
pub fn probe_devices() -> Vec<DeviceInfo> {
    new_instance()
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .enumerate()
        .map(|(i, adapter)| describe(i, adapter))
        .collect()
}

/// Adapter preference when none was picked: discrete, integrated, then anything but a CPU.
fn preference(info: &wgpu::AdapterInfo) -> Option<u8> {
    match info.device_type {
        wgpu::DeviceType::DiscreteGpu => Some(0),
        wgpu::DeviceType::IntegratedGpu => Some(1),
        wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => Some(2),
        wgpu::DeviceType::Cpu => None,
    }
}

struct StagePipelines {
    accumulate_histogram: wgpu::ComputePipeline,
    reduce_cumulative: wgpu::ComputePipeline,
    build_lut: wgpu::ComputePipeline,
    back_project: wgpu::ComputePipeline,
}

impl StagePipelines {
    fn get(&self, stage: StageId) -> &wgpu::ComputePipeline {
        match stage {
            StageId::AccumulateHistogram => &self.accumulate_histogram,
            StageId::ReduceCumulative => &self.reduce_cumulative,
            StageId::BuildLut => &self.build_lut,
            StageId::BackProject => &self.back_project,
        }
    }
}

struct GpuBuffer {
    label: String,
    access: Access,
    size_bytes: usize,
    buffer: wgpu::Buffer,
}

pub struct WebGpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    max_workgroups_per_dim: u32,
    max_buffer_size: u64,
    pipelines: StagePipelines,
    buffers: Vec<Option<GpuBuffer>>,
}

impl WebGpuDevice {
    /// Open adapter `index` as listed by [`probe_devices`], or the best GPU when `None`.
    pub fn new(index: Option<usize>) -> Result<Self> {
        let instance = new_instance();
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let index = match index {
            Some(i) if i < adapters.len() => i,
            Some(i) => {
                return Err(Error::device(format!(
                    "no WebGPU adapter {i}; {} available",
                    adapters.len()
                )))
            }
            None => adapters
                .iter()
                .enumerate()
                .filter_map(|(i, a)| preference(&a.get_info()).map(|p| (p, i)))
                .min()
                .map(|(_, i)| i)
                .ok_or_else(|| Error::device("no WebGPU GPU adapter available"))?,
        };
        let adapter = &adapters[index];
        let info = describe(index, adapter);

        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("histeq-webgpu"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| Error::device(format!("{}: cannot open device: {e}", info.name)))?;

        if limits.max_compute_workgroup_size_x < WORKGROUP_SIZE
            || limits.max_compute_invocations_per_workgroup < WORKGROUP_SIZE
        {
            return Err(Error::device(format!(
                "{}: workgroups of {WORKGROUP_SIZE} invocations not supported",
                info.name
            )));
        }

        let pipelines = Self::compile(&device)?;
        log::info!("WebGPU device {info}");
        Ok(Self {
            device,
            queue,
            info,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
            max_buffer_size: u64::from(limits.max_storage_buffer_binding_size)
                .min(limits.max_buffer_size),
            pipelines,
            buffers: Vec::new(),
        })
    }

    fn compile(device: &wgpu::Device) -> Result<StagePipelines> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("histeq"),
            source: wgpu::ShaderSource::Wgsl(HISTEQ_KERNEL_SOURCE.into()),
        });
        let make = |stage: StageId| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(stage.name()),
                layout: None,
                module: &module,
                entry_point: Some(entry_point(stage)),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let pipelines = StagePipelines {
            accumulate_histogram: make(StageId::AccumulateHistogram),
            reduce_cumulative: make(StageId::ReduceCumulative),
            build_lut: make(StageId::BuildLut),
            back_project: make(StageId::BackProject),
        };
        match pollster::block_on(device.pop_error_scope()) {
            Some(e) => Err(Error::device(format!("kernel compilation failed: {e}"))),
            None => Ok(pipelines),
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer> {
        self.buffers
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::device(format!("{handle} is not allocated")))
    }

    /// Run `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, what: &str, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(e) => Err(Error::device(format!("{what}: {e}"))),
            None => Ok(value),
        }
    }

    fn wait(&self, what: &str) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| Error::device(format!("{what}: {e}")))
    }
}

/// Split `workgroups_x` into a 2-D grid no wider or taller than `max` per dimension.
/// Kernels linearise with `gid.x + gid.y * dispatch_width`.
fn tile_workgroups(workgroups_x: u32, max: u32) -> Result<(u32, u32)> {
    if workgroups_x <= max {
        Ok((workgroups_x, 1))
    } else {
        let wy = workgroups_x.div_ceil(max);
        if wy > max {
            return Err(Error::device(format!(
                "{workgroups_x} workgroups exceed the dispatch limit"
            )));
        }
        Ok((max, wy))
    }
}

fn padded_len(size_bytes: usize) -> u64 {
    (size_bytes.max(1).div_ceil(4) * 4) as u64
}

impl ComputeDevice for WebGpuDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn allocate_buffer(
        &mut self,
        label: &str,
        size_bytes: usize,
        access: Access,
    ) -> Result<BufferHandle> {
        let size = padded_len(size_bytes);
        if size > self.max_buffer_size {
            return Err(Error::device(format!(
                "cannot allocate {label} ({size_bytes} bytes): device limit is {} bytes",
                self.max_buffer_size
            )));
        }
        // wgpu zero-initializes new buffers
        let buffer = self.scoped(&format!("allocate {label}"), || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;

        let handle = insert_slot(
            &mut self.buffers,
            GpuBuffer {
                label: label.to_owned(),
                access,
                size_bytes,
                buffer,
            },
        );
        log::debug!("allocated {handle} {label}: {size_bytes} bytes, {access:?}");
        Ok(handle)
    }

    fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        check_fits(handle, buffer.size_bytes, data)?;
        if data.is_empty() {
            return Ok(());
        }
        let mut padded = data.to_vec();
        padded.resize(data.len().div_ceil(4) * 4, 0);
        self.scoped(&format!("upload {}", buffer.label), || {
            self.queue.write_buffer(&buffer.buffer, 0, &padded);
            self.queue.submit(None);
        })?;
        self.wait("upload")
    }

    fn dispatch_stage(&mut self, launch: &StageLaunch) -> Result<()> {
        validate_launch(launch, |h| self.buffer(h).map(|b| (b.size_bytes, b.access)))?;
        let stage = launch.stage;
        let (wx, wy) = tile_workgroups(launch.workgroups(), self.max_workgroups_per_dim)?;

        let params = Params {
            pixel_count: launch.pixel_count,
            dispatch_width: wx * WORKGROUP_SIZE,
            _pad: [0; 2],
        };
        let params_buf = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let (in_slots, out_slots) = binding_slots(stage);
        let mut bound = Vec::with_capacity(in_slots.len() + out_slots.len());
        for (&slot, &handle) in in_slots
            .iter()
            .zip(&launch.inputs)
            .chain(out_slots.iter().zip(&launch.outputs))
        {
            bound.push((slot, &self.buffer(handle)?.buffer));
        }
        let mut entries: Vec<wgpu::BindGroupEntry> = bound
            .iter()
            .map(|&(binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        if uses_params(stage) {
            entries.push(wgpu::BindGroupEntry {
                binding: PARAMS_BINDING,
                resource: params_buf.as_entire_binding(),
            });
        }

        let pipeline = self.pipelines.get(stage);
        let t0 = std::time::Instant::now();
        self.scoped(stage.name(), || {
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(stage.name()),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(stage.name()),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(stage.name()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(wx, wy, 1);
            }
            self.queue.submit(Some(encoder.finish()));
        })?;
        self.wait(stage.name())?;
        log::debug!(
            "[webgpu] {stage}: {wx}x{wy} workgroups, {:.3} ms",
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let source = self.buffer(handle)?;
        let size = padded_len(source.size_bytes);
        let staging = self.scoped("read-back", || {
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("read_buffer"),
                });
            encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
            self.queue.submit(Some(encoder.finish()));
            staging
        })?;

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait("read-back")?;
        rx.recv()
            .map_err(|e| Error::device(format!("read-back of {handle}: {e}")))?
            .map_err(|e| Error::device(format!("read-back of {handle}: {e}")))?;

        let mut data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data.truncate(source.size_bytes);
        Ok(data)
    }

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::device(format!("{handle} is not allocated")))?;
        buffer.buffer.destroy();
        log::debug!("released {handle} {}", buffer.label);
        Ok(())
    }
}
