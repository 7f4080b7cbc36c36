//! The four equalization stages and what each one needs from a device.
//!
//! Devices keep every buffer as little-endian `u32` words. Pixels are packed
//! four per word (pixel `i` lives in byte lane `i % 4` of word `i / 4`); the
//! histogram, cumulative histogram and LUT store one word per bin.

use std::fmt;

use crate::device::BufferHandle;
use crate::histogram::BINS;
use crate::{Error, Result};

/// Work items per work group, for every stage and backend.
pub const WORKGROUP_SIZE: u32 = 256;

/// Largest image the stages accept. Keeps `2 * (N - cdf_min)` inside a `u32`.
pub const MAX_PIXELS: usize = (1 << 31) - 1;

/// Byte size of a 256-entry table on the device.
pub const TABLE_BYTES: usize = BINS * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    AccumulateHistogram,
    ReduceCumulative,
    BuildLut,
    BackProject,
}

impl StageId {
    /// Dispatch order. Each stage starts only after the previous one fully completed.
    pub const SEQUENCE: [StageId; 4] = [
        StageId::AccumulateHistogram,
        StageId::ReduceCumulative,
        StageId::BuildLut,
        StageId::BackProject,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::AccumulateHistogram => "accumulate-histogram",
            Self::ReduceCumulative => "reduce-cumulative",
            Self::BuildLut => "build-lut",
            Self::BackProject => "back-project",
        }
    }

    /// Names of the input and output buffers, in binding order.
    pub fn signature(self) -> (&'static [&'static str], &'static [&'static str]) {
        match self {
            Self::AccumulateHistogram => (&["pixels"], &["histogram"]),
            Self::ReduceCumulative => (&["histogram"], &["cumulative"]),
            Self::BuildLut => (&["cumulative"], &["lut"]),
            Self::BackProject => (&["pixels", "lut"], &["output"]),
        }
    }

    /// One work item per pixel, or one per bin.
    pub fn work_items(self, pixel_count: u32) -> u32 {
        match self {
            Self::AccumulateHistogram | Self::BackProject => pixel_count,
            Self::ReduceCumulative | Self::BuildLut => BINS as u32,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fully parameterized stage, ready for [`ComputeDevice::dispatch_stage`](crate::ComputeDevice::dispatch_stage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLaunch {
    pub stage: StageId,
    pub inputs: Vec<BufferHandle>,
    pub outputs: Vec<BufferHandle>,
    pub work_items: u32,
    pub pixel_count: u32,
}

impl StageLaunch {
    pub fn new(
        stage: StageId,
        inputs: &[BufferHandle],
        outputs: &[BufferHandle],
        pixel_count: u32,
    ) -> Result<Self> {
        let (ins, outs) = stage.signature();
        if inputs.len() != ins.len() || outputs.len() != outs.len() {
            return Err(Error::device(format!(
                "{stage} takes {} inputs and {} outputs, got {} and {}",
                ins.len(),
                outs.len(),
                inputs.len(),
                outputs.len()
            )));
        }
        if pixel_count == 0 || pixel_count as usize > MAX_PIXELS {
            return Err(Error::device(format!(
                "{stage}: pixel count {pixel_count} outside 1..={MAX_PIXELS}"
            )));
        }
        Ok(Self {
            stage,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            work_items: stage.work_items(pixel_count),
            pixel_count,
        })
    }

    pub fn workgroups(&self) -> u32 {
        self.work_items.div_ceil(WORKGROUP_SIZE)
    }

    /// Minimum byte size of each input and output buffer.
    pub fn required_bytes(&self) -> (Vec<usize>, Vec<usize>) {
        let (ins, outs) = self.stage.signature();
        let size = |name: &&str| match *name {
            "pixels" | "output" => self.pixel_count as usize,
            _ => TABLE_BYTES,
        };
        (ins.iter().map(size).collect(), outs.iter().map(size).collect())
    }
}

/// Intensity of `pixel` inside a packed word buffer.
#[inline]
pub(crate) fn lane(word: u32, pixel: usize) -> u32 {
    (word >> ((pixel & 3) * 8)) & 0xff
}

/// Equalized value of one bin.
///
/// `round((cumulative - cdf_min) / (pixel_count - cdf_min) * 255)` with ties
/// rounded up, clamped to 255. Bins below the first populated one map to 0.
/// A single populated intensity (`cdf_min == pixel_count`) gives the identity.
pub fn equalize_bin(bin: u32, cumulative: u32, cdf_min: u32, pixel_count: u32) -> u32 {
    if cdf_min >= pixel_count {
        return bin;
    }
    let den = (pixel_count - cdf_min) as u64;
    let num = cumulative.saturating_sub(cdf_min) as u64;
    ((num * 255 + den / 2) / den).min(255) as u32
}
