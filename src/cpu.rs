//! CPU device: a rayon pool running the stages with the same work-item shape as the GPU kernels.
//!
//! Buffers are arrays of `AtomicU32` words. Every stage runs inside
//! `ThreadPool::install` and returns only after its parallel iterators have
//! joined, which is the barrier between stages; rayon's join makes the
//! workers' relaxed stores visible to whoever runs next.
//!
//! - accumulate-histogram: work groups of [`WORKGROUP_SIZE`] pixels count into
//!   a private histogram, then merge it with one atomic add per populated bin.
//! - reduce-cumulative: Hillis–Steele inclusive scan, 8 rounds of 256 workers
//!   ping-ponging between two arrays. More additions than a sequential scan,
//!   but every round is fully parallel and the depth is log2(256).
//! - build-lut: atomic minimum for `cdf_min`, then one worker per bin.
//! - back-project: one worker per pixel, OR-ing its byte lane into the
//!   zero-filled packed output word.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use rayon::prelude::*;

use crate::device::{check_fits, insert_slot, validate_launch, Access, Backend, BufferHandle, ComputeDevice, DeviceInfo};
use crate::histogram::BINS;
use crate::stages::{equalize_bin, lane, StageId, StageLaunch, WORKGROUP_SIZE};
use crate::{Error, Result};

struct CpuBuffer {
    label: String,
    access: Access,
    size_bytes: usize,
    words: Box<[AtomicU32]>,
}

pub struct CpuDevice {
    pool: rayon::ThreadPool,
    buffers: Vec<Option<CpuBuffer>>,
}

impl CpuDevice {
    /// Start a pool of `threads` workers (all cores when `None`).
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("histeq-cpu-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::device(format!("cannot start CPU pool: {e}")))?;
        log::info!("CPU device with {} threads", pool.current_num_threads());
        Ok(Self {
            pool,
            buffers: Vec::new(),
        })
    }

    pub(crate) fn describe(threads: Option<usize>) -> DeviceInfo {
        let threads = threads.unwrap_or_else(rayon::current_num_threads);
        DeviceInfo {
            backend: Backend::Cpu,
            index: 0,
            name: format!("CPU ({threads} threads)"),
            is_gpu: false,
            parallelism: threads,
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&CpuBuffer> {
        self.buffers
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::device(format!("{handle} is not allocated")))
    }

    fn words(&self, handles: &[BufferHandle]) -> Result<Vec<&[AtomicU32]>> {
        handles
            .iter()
            .map(|&h| self.buffer(h).map(|b| &*b.words))
            .collect()
    }
}

impl ComputeDevice for CpuDevice {
    fn info(&self) -> DeviceInfo {
        Self::describe(Some(self.pool.current_num_threads()))
    }

    fn allocate_buffer(
        &mut self,
        label: &str,
        size_bytes: usize,
        access: Access,
    ) -> Result<BufferHandle> {
        let len = size_bytes.div_ceil(4).max(1);
        let mut words: Vec<AtomicU32> = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|e| Error::device(format!("cannot allocate {label} ({size_bytes} bytes): {e}")))?;
        words.extend((0..len).map(|_| AtomicU32::new(0)));

        let handle = insert_slot(
            &mut self.buffers,
            CpuBuffer {
                label: label.to_owned(),
                access,
                size_bytes,
                words: words.into_boxed_slice(),
            },
        );
        log::debug!("allocated {handle} {label}: {size_bytes} bytes, {access:?}");
        Ok(handle)
    }

    fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        check_fits(handle, buffer.size_bytes, data)?;
        let mut padded = data.to_vec();
        padded.resize(data.len().div_ceil(4) * 4, 0);
        self.pool.install(|| {
            buffer
                .words
                .par_iter()
                .zip(padded.par_chunks_exact(4))
                .for_each(|(slot, chunk)| slot.store(LittleEndian::read_u32(chunk), Ordering::Relaxed));
        });
        Ok(())
    }

    fn dispatch_stage(&mut self, launch: &StageLaunch) -> Result<()> {
        validate_launch(launch, |h| self.buffer(h).map(|b| (b.size_bytes, b.access)))?;
        let inputs = self.words(&launch.inputs)?;
        let outputs = self.words(&launch.outputs)?;
        let n = launch.pixel_count;

        let t0 = Instant::now();
        self.pool.install(|| match launch.stage {
            StageId::AccumulateHistogram => accumulate_histogram(inputs[0], outputs[0], n as usize),
            StageId::ReduceCumulative => reduce_cumulative(inputs[0], outputs[0]),
            StageId::BuildLut => build_lut(inputs[0], outputs[0], n),
            StageId::BackProject => back_project(inputs[0], inputs[1], outputs[0], n as usize),
        });
        log::debug!(
            "[cpu] {}: {} work items, {:.3} ms",
            launch.stage,
            launch.work_items,
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let buffer = self.buffer(handle)?;
        let mut bytes = Vec::with_capacity(buffer.words.len() * 4);
        for word in buffer.words.iter() {
            bytes.write_u32::<LittleEndian>(word.load(Ordering::Relaxed))?;
        }
        bytes.truncate(buffer.size_bytes);
        Ok(bytes)
    }

    fn release_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::device(format!("{handle} is not allocated")))?;
        log::debug!("released {handle} {}", buffer.label);
        Ok(())
    }
}

fn accumulate_histogram(pixels: &[AtomicU32], histogram: &[AtomicU32], n: usize) {
    let group = WORKGROUP_SIZE as usize;
    (0..n.div_ceil(group)).into_par_iter().for_each(|g| {
        let mut local = [0u32; BINS];
        for i in g * group..((g + 1) * group).min(n) {
            local[lane(pixels[i >> 2].load(Ordering::Relaxed), i) as usize] += 1;
        }
        for (bin, &count) in local.iter().enumerate() {
            if count > 0 {
                histogram[bin].fetch_add(count, Ordering::Relaxed);
            }
        }
    });
}

fn reduce_cumulative(histogram: &[AtomicU32], cumulative: &[AtomicU32]) {
    let mut scan: Vec<u32> = histogram[..BINS]
        .par_iter()
        .map(|c| c.load(Ordering::Relaxed))
        .collect();
    let mut next = vec![0u32; BINS];
    let mut offset = 1;
    while offset < BINS {
        next.par_iter_mut().enumerate().for_each(|(i, slot)| {
            *slot = if i >= offset {
                scan[i] + scan[i - offset]
            } else {
                scan[i]
            };
        });
        std::mem::swap(&mut scan, &mut next);
        offset <<= 1;
    }
    cumulative[..BINS]
        .par_iter()
        .zip(scan.par_iter())
        .for_each(|(slot, &v)| slot.store(v, Ordering::Relaxed));
}

fn build_lut(cumulative: &[AtomicU32], lut: &[AtomicU32], n: u32) {
    let cdf_min = AtomicU32::new(u32::MAX);
    cumulative[..BINS].par_iter().for_each(|c| {
        let c = c.load(Ordering::Relaxed);
        if c > 0 {
            cdf_min.fetch_min(c, Ordering::Relaxed);
        }
    });
    let cdf_min = cdf_min.into_inner();
    lut[..BINS]
        .par_iter()
        .zip(cumulative[..BINS].par_iter())
        .enumerate()
        .for_each(|(bin, (slot, c))| {
            slot.store(
                equalize_bin(bin as u32, c.load(Ordering::Relaxed), cdf_min, n),
                Ordering::Relaxed,
            );
        });
}

fn back_project(pixels: &[AtomicU32], lut: &[AtomicU32], output: &[AtomicU32], n: usize) {
    (0..n).into_par_iter().for_each(|i| {
        let value = lut[lane(pixels[i >> 2].load(Ordering::Relaxed), i) as usize]
            .load(Ordering::Relaxed)
            .min(255);
        output[i >> 2].fetch_or(value << ((i & 3) * 8), Ordering::Relaxed);
    });
}
