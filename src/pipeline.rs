//! Dispatch orchestration: buffers, stage sequence, read-back and invariant checks.

use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use crate::device::{Access, BufferHandle, ComputeDevice, DeviceInfo};
use crate::histogram::{CumulativeHistogram, Histogram, Lut, BINS};
use crate::raster::Image;
use crate::stages::{StageId, StageLaunch, MAX_PIXELS, TABLE_BYTES};
use crate::{Error, Result};

/// Everything one run produced, read back to host memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equalization {
    pub histogram: Histogram,
    pub cumulative: CumulativeHistogram,
    pub lut: Lut,
    pub output: Image,
}

/// Device buffers of a single run. Allocated fresh, released at the end.
struct RunBuffers {
    pixels: BufferHandle,
    histogram: BufferHandle,
    cumulative: BufferHandle,
    lut: BufferHandle,
    output: BufferHandle,
}

impl RunBuffers {
    fn allocate(device: &mut dyn ComputeDevice, pixel_count: usize) -> Result<Self> {
        let layout = [
            ("pixels", pixel_count, Access::ReadOnly),
            ("histogram", TABLE_BYTES, Access::ReadWrite),
            ("cumulative", TABLE_BYTES, Access::ReadWrite),
            ("lut", TABLE_BYTES, Access::ReadWrite),
            ("output", pixel_count, Access::WriteOnly),
        ];
        let mut handles = Vec::with_capacity(layout.len());
        for (label, size, access) in layout {
            match device.allocate_buffer(label, size, access) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    release_all(device, &handles);
                    return Err(e);
                }
            }
        }
        Ok(Self {
            pixels: handles[0],
            histogram: handles[1],
            cumulative: handles[2],
            lut: handles[3],
            output: handles[4],
        })
    }

    fn handles(&self) -> [BufferHandle; 5] {
        [self.pixels, self.histogram, self.cumulative, self.lut, self.output]
    }

    fn bindings(&self, stage: StageId) -> (Vec<BufferHandle>, Vec<BufferHandle>) {
        match stage {
            StageId::AccumulateHistogram => (vec![self.pixels], vec![self.histogram]),
            StageId::ReduceCumulative => (vec![self.histogram], vec![self.cumulative]),
            StageId::BuildLut => (vec![self.cumulative], vec![self.lut]),
            StageId::BackProject => (vec![self.pixels, self.lut], vec![self.output]),
        }
    }
}

fn release_all(device: &mut dyn ComputeDevice, handles: &[BufferHandle]) {
    for &h in handles {
        if let Err(e) = device.release_buffer(h) {
            log::warn!("failed to release {h}: {e}");
        }
    }
}

fn read_table(device: &dyn ComputeDevice, handle: BufferHandle) -> Result<Vec<u32>> {
    let bytes = device.read_buffer(handle)?;
    if bytes.len() != TABLE_BYTES {
        return Err(Error::device(format!(
            "{handle}: read back {} bytes, expected {TABLE_BYTES}",
            bytes.len()
        )));
    }
    let mut words = vec![0u32; BINS];
    LittleEndian::read_u32_into(&bytes, &mut words);
    Ok(words)
}

/// Runs the four stages on one device, strictly in sequence.
pub struct Equalizer {
    device: Box<dyn ComputeDevice>,
}

impl Equalizer {
    pub fn new(device: Box<dyn ComputeDevice>) -> Self {
        log::info!("equalizing on {}", device.info());
        Self { device }
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device.info()
    }

    /// Equalize `image`. Any stage failure aborts the run and nothing is returned.
    pub fn run(&mut self, image: &Image) -> Result<Equalization> {
        let n = image.pixel_count();
        if n > MAX_PIXELS {
            return Err(Error::device(format!(
                "{}x{} image has {n} pixels, limit is {MAX_PIXELS}",
                image.width(),
                image.height()
            )));
        }

        let device = self.device.as_mut();
        let buffers = RunBuffers::allocate(device, n)?;
        let result = execute(device, &buffers, image);
        release_all(device, &buffers.handles());
        result
    }
}

fn dispatch(device: &mut dyn ComputeDevice, buffers: &RunBuffers, stage: StageId, n: u32) -> Result<()> {
    let (inputs, outputs) = buffers.bindings(stage);
    let launch = StageLaunch::new(stage, &inputs, &outputs, n)?;
    let t0 = Instant::now();
    device
        .dispatch_stage(&launch)
        .map_err(|e| Error::device(format!("{stage} failed: {e}")))?;
    log::debug!(
        "{stage}: {} work items in {:.3} ms",
        launch.work_items,
        t0.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Runs the stages in order. Each table is read back and checked before the
/// stage that consumes it is dispatched.
fn execute(device: &mut dyn ComputeDevice, buffers: &RunBuffers, image: &Image) -> Result<Equalization> {
    let n = image.pixel_count() as u32;
    let t0 = Instant::now();
    device.write_buffer(buffers.pixels, image.as_raw())?;

    dispatch(device, buffers, StageId::AccumulateHistogram, n)?;
    let histogram = Histogram::from_counts(&read_table(device, buffers.histogram)?)?;
    if histogram.total() != n as u64 {
        return Err(Error::device(format!(
            "histogram counted {} pixels, image has {n}",
            histogram.total()
        )));
    }

    dispatch(device, buffers, StageId::ReduceCumulative, n)?;
    let cumulative = CumulativeHistogram::from_values(&read_table(device, buffers.cumulative)?)?;
    if !cumulative.matches(&histogram) || cumulative.total() != n {
        return Err(Error::device(
            "cumulative histogram is not the prefix sum of the histogram",
        ));
    }

    dispatch(device, buffers, StageId::BuildLut, n)?;
    let lut = Lut::from_words(&read_table(device, buffers.lut)?)?;
    if !lut.is_monotonic() {
        return Err(Error::device("LUT is not monotonic"));
    }
    if lut.is_identity() {
        log::debug!("LUT is the identity, output equals input");
    }

    dispatch(device, buffers, StageId::BackProject, n)?;
    let output = device.read_buffer(buffers.output)?;
    let output = Image::from_raw(image.width(), image.height(), output)
        .map_err(|e| Error::device(format!("output read back: {e}")))?;

    log::info!(
        "equalized {}x{} ({} intensities) in {:.3} ms",
        image.width(),
        image.height(),
        histogram.used(),
        t0.elapsed().as_secs_f64() * 1000.0
    );
    Ok(Equalization {
        histogram,
        cumulative,
        lut,
        output,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use more_asserts::{assert_ge, assert_le};
    use proptest::prelude::*;

    use super::*;
    use crate::cpu::CpuDevice;

    fn equalize(width: u32, height: u32, pixels: Vec<u8>) -> Equalization {
        let image = Image::from_raw(width, height, pixels).unwrap();
        let mut equalizer = Equalizer::new(Box::new(CpuDevice::new(Some(4)).unwrap()));
        equalizer.run(&image).unwrap()
    }

    /// Sequential equalization used as the expected result.
    fn reference(pixels: &[u8]) -> Vec<u8> {
        let mut hist = [0u64; BINS];
        pixels.iter().for_each(|&p| hist[p as usize] += 1);
        let mut cum = [0u64; BINS];
        let mut acc = 0;
        for (c, h) in cum.iter_mut().zip(hist) {
            acc += h;
            *c = acc;
        }
        let n = pixels.len() as u64;
        let cdf_min = cum.iter().copied().find(|&c| c > 0).unwrap();
        let lut: Vec<u8> = (0..BINS)
            .map(|i| {
                if n == cdf_min {
                    i as u8
                } else {
                    let x = (cum[i].saturating_sub(cdf_min) * 255) as f64 / (n - cdf_min) as f64;
                    (x + 0.5).floor().min(255.0) as u8
                }
            })
            .collect();
        pixels.iter().map(|&p| lut[p as usize]).collect()
    }

    #[test]
    fn test_scenario_a_two_levels() {
        let result = equalize(2, 2, vec![0, 0, 255, 255]);
        assert_eq!(result.histogram.get(0), 2);
        assert_eq!(result.histogram.get(255), 2);
        assert_eq!(result.histogram.used(), 2);
        assert!(result.cumulative.values().iter().take(255).all(|&c| c == 2));
        assert_eq!(result.cumulative.get(255), 4);
        assert_eq!(result.lut.apply(0), 0);
        assert_eq!(result.lut.apply(255), 255);
        assert_eq!(result.output.as_raw(), &[0, 0, 255, 255]);
    }

    #[test]
    fn test_scenario_b_single_pixel() {
        let result = equalize(1, 1, vec![128]);
        assert_eq!(result.histogram.get(128), 1);
        assert_eq!(result.histogram.total(), 1);
        assert!(result.lut.is_identity());
        assert_eq!(result.lut.apply(128), 128);
        assert_eq!(result.output.as_raw(), &[128]);
    }

    #[test]
    fn test_scenario_c_uniform_image() {
        let result = equalize(4, 4, vec![10; 16]);
        assert_eq!(result.histogram.get(10), 16);
        assert_eq!(result.cumulative.cdf_min(), Some(16));
        assert!(result.lut.is_identity());
        assert_eq!(result.output.as_raw(), &[10; 16]);
    }

    #[test]
    fn test_flat_histogram_gives_identity() {
        let pixels: Vec<u8> = (0..4).flat_map(|_| 0..=255u8).collect();
        let result = equalize(32, 32, pixels.clone());
        assert!(result.lut.is_identity());
        assert_eq!(result.output.as_raw(), pixels.as_slice());
    }

    #[test]
    fn test_low_contrast_is_stretched() {
        let pixels: Vec<u8> = (0..64 * 64).map(|i| 100 + (i % 20) as u8).collect();
        let result = equalize(64, 64, pixels);
        assert_eq!(result.lut.apply(100), 0);
        assert_eq!(result.lut.apply(119), 255);
        let out = result.output.as_raw();
        assert_eq!(*out.iter().min().unwrap(), 0);
        assert_eq!(*out.iter().max().unwrap(), 255);
    }

    #[test]
    fn test_matches_sequential_reference() {
        let pixels: Vec<u8> = (0..317 * 211u32)
            .map(|i| ((i.wrapping_mul(2654435761) >> 24) % 97 + 40) as u8)
            .collect();
        let result = equalize(317, 211, pixels.clone());
        assert_eq!(result.output.as_raw(), reference(&pixels).as_slice());
    }

    #[test]
    fn test_buffers_are_released_after_run() {
        let image = Image::from_raw(3, 1, vec![1, 2, 3]).unwrap();
        let device = Recording::new();
        let (released, dispatched) = (device.released.clone(), device.dispatched.clone());
        let mut equalizer = Equalizer::new(Box::new(device));
        equalizer.run(&image).unwrap();
        assert_eq!(released.lock().unwrap().len(), 5);
        assert_eq!(*dispatched.lock().unwrap(), StageId::SEQUENCE);
    }

    #[test]
    fn test_stage_failure_aborts_and_releases() {
        let image = Image::from_raw(3, 1, vec![1, 2, 3]).unwrap();
        let mut device = Recording::new();
        device.fail_on = Some(StageId::BuildLut);
        let released = device.released.clone();
        let mut equalizer = Equalizer::new(Box::new(device));
        let err = equalizer.run(&image).unwrap_err();
        assert!(matches!(err, Error::Device(ref msg) if msg.contains("build-lut")), "{err}");
        assert_eq!(released.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_broken_scan_stops_before_lut() {
        let image = Image::from_raw(3, 1, vec![1, 2, 3]).unwrap();
        let mut device = Recording::new();
        device.zero_output_of = Some(StageId::ReduceCumulative);
        let (released, dispatched) = (device.released.clone(), device.dispatched.clone());
        let mut equalizer = Equalizer::new(Box::new(device));
        let err = equalizer.run(&image).unwrap_err();
        assert!(matches!(err, Error::Device(ref msg) if msg.contains("prefix sum")), "{err}");
        assert_eq!(
            *dispatched.lock().unwrap(),
            [StageId::AccumulateHistogram, StageId::ReduceCumulative]
        );
        assert_eq!(released.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_lost_counts_stop_before_scan() {
        let image = Image::from_raw(2, 2, vec![9, 9, 9, 9]).unwrap();
        let mut device = Recording::new();
        device.zero_output_of = Some(StageId::AccumulateHistogram);
        let dispatched = device.dispatched.clone();
        let mut equalizer = Equalizer::new(Box::new(device));
        let err = equalizer.run(&image).unwrap_err();
        assert!(matches!(err, Error::Device(ref msg) if msg.contains("counted 0 pixels")), "{err}");
        assert_eq!(*dispatched.lock().unwrap(), [StageId::AccumulateHistogram]);
    }

    #[test]
    fn test_repeated_runs_reuse_buffer_handles() {
        let image = Image::from_raw(3, 1, vec![1, 2, 3]).unwrap();
        let device = Recording::new();
        let released = device.released.clone();
        let mut equalizer = Equalizer::new(Box::new(device));
        for _ in 0..4 {
            equalizer.run(&image).unwrap();
        }
        let released = released.lock().unwrap();
        assert_eq!(released.len(), 20);
        assert!(released.iter().all(|h| h.0 < 5), "{released:?}");
    }

    /// Wraps a device to record dispatches and releases, and to inject faults.
    struct Recording {
        inner: CpuDevice,
        released: Arc<Mutex<Vec<BufferHandle>>>,
        dispatched: Arc<Mutex<Vec<StageId>>>,
        fail_on: Option<StageId>,
        zero_output_of: Option<StageId>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                inner: CpuDevice::new(Some(1)).unwrap(),
                released: Arc::default(),
                dispatched: Arc::default(),
                fail_on: None,
                zero_output_of: None,
            }
        }
    }

    impl ComputeDevice for Recording {
        fn info(&self) -> DeviceInfo {
            self.inner.info()
        }

        fn allocate_buffer(&mut self, label: &str, size: usize, access: Access) -> Result<BufferHandle> {
            self.inner.allocate_buffer(label, size, access)
        }

        fn write_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
            self.inner.write_buffer(handle, data)
        }

        fn dispatch_stage(&mut self, launch: &StageLaunch) -> Result<()> {
            self.dispatched.lock().unwrap().push(launch.stage);
            if self.fail_on == Some(launch.stage) {
                return Err(Error::device("out of resources"));
            }
            self.inner.dispatch_stage(launch)?;
            if self.zero_output_of == Some(launch.stage) {
                self.inner.write_buffer(launch.outputs[0], &[0; TABLE_BYTES])?;
            }
            Ok(())
        }

        fn read_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>> {
            self.inner.read_buffer(handle)
        }

        fn release_buffer(&mut self, handle: BufferHandle) -> Result<()> {
            self.released.lock().unwrap().push(handle);
            self.inner.release_buffer(handle)
        }
    }

    fn image_strategy() -> impl Strategy<Value = (u32, u32, Vec<u8>)> {
        (1u32..48, 1u32..48).prop_flat_map(|(w, h)| {
            (
                Just(w),
                Just(h),
                prop::collection::vec(any::<u8>(), (w * h) as usize),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_tables_hold_invariants((w, h, pixels) in image_strategy()) {
            let result = equalize(w, h, pixels.clone());
            let n = (w * h) as u64;
            prop_assert_eq!(result.histogram.total(), n);
            prop_assert!(result.cumulative.is_monotonic());
            prop_assert_eq!(result.cumulative.total() as u64, n);
            prop_assert!(result.cumulative.matches(&result.histogram));
            prop_assert!(result.lut.is_monotonic());
            prop_assert_eq!(result.output.width(), w);
            prop_assert_eq!(result.output.height(), h);
            let expected = reference(&pixels);
            prop_assert_eq!(result.output.as_raw(), expected.as_slice());
        }

        #[test]
        fn prop_single_intensity_is_identity(w in 1u32..20, h in 1u32..20, v in any::<u8>()) {
            let result = equalize(w, h, vec![v; (w * h) as usize]);
            prop_assert!(result.lut.is_identity());
            let expected = vec![v; (w * h) as usize];
            prop_assert_eq!(result.output.as_raw(), expected.as_slice());
        }

        #[test]
        fn prop_uniform_histogram_is_near_identity(copies in 1usize..6, shift in 0usize..256) {
            // every intensity equally often, in scrambled order
            let pixels: Vec<u8> = (0..copies * 256).map(|i| ((i * 7 + shift) % 256) as u8).collect();
            let result = equalize(256, copies as u32, pixels);
            for (i, &v) in result.lut.entries().iter().enumerate() {
                assert_ge!(v as i32, i as i32 - 1);
                assert_le!(v as i32, i as i32 + 1);
            }
        }
    }
}
