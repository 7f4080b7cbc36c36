//! Histogram equalization of 8-bit grayscale images on data-parallel compute devices.
//!
//! The work is split into four stages that run in strict sequence on a
//! [`ComputeDevice`]: histogram accumulation, cumulative reduction, LUT
//! construction and back-projection. [`Equalizer`] allocates the device
//! buffers, dispatches the stages with a full barrier between each and reads
//! every intermediate table back to the host.
//!
//! ```rust,no_run
//! use histeq_gpu::{CpuDevice, Equalizer, load_grayscale_image, save_grayscale_image};
//!
//! # fn main() -> histeq_gpu::Result<()> {
//! let image = load_grayscale_image("test.pgm")?;
//! let mut equalizer = Equalizer::new(Box::new(CpuDevice::new(None)?));
//! let result = equalizer.run(&image)?;
//! save_grayscale_image("output.pgm", &result.output)?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

pub mod cpu;
pub mod device;
pub mod diagnostics;
pub mod histogram;
pub mod pipeline;
pub mod raster;
pub mod stages;

#[cfg(feature = "webgpu")]
pub mod webgpu;

pub use cpu::CpuDevice;
pub use device::{list_devices, open_device, Access, Backend, BufferHandle, ComputeDevice, DeviceInfo};
pub use histogram::{CumulativeHistogram, Histogram, Lut, BINS};
pub use pipeline::{Equalization, Equalizer};
pub use raster::{load_grayscale_image, save_grayscale_image, Image};
pub use stages::{StageId, StageLaunch};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input raster is missing, malformed or not 8-bit single-channel.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Buffer allocation or stage dispatch failed; the run produced nothing.
    #[error("Device error: {0}")]
    Device(String),

    /// Writing a result failed. Already computed data is unaffected.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub(crate) fn io_other(msg: impl Into<String>) -> Self {
        Self::Io(std::io::Error::other(msg.into()))
    }
}

/// Equalize `filename_in` on `device` and write the result to `filename_out`.
pub fn equalize_file(
    filename_in: impl AsRef<Path>,
    filename_out: impl AsRef<Path>,
    device: Box<dyn ComputeDevice>,
) -> Result<Equalization> {
    let image = load_grayscale_image(filename_in)?;
    let mut equalizer = Equalizer::new(device);
    let result = equalizer.run(&image)?;
    save_grayscale_image(filename_out, &result.output)?;
    Ok(result)
}
