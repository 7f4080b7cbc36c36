//! Grayscale rasters and their file formats.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::io::Reader as ImageReader;
use image::{ColorType, DynamicImage, ImageEncoder};
use ndarray::{Array2, ArrayView2};
use png::{BitDepth, ColorType as PngColorType};

use crate::{Error, Result};

/// Row-major 8-bit single-channel image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Image {
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::decode(format!("empty raster {width}x{height}")));
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(Error::decode(format!(
                "{width}x{height} raster needs {expected} samples, got {}",
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    pub fn from_array(array: &Array2<u8>) -> Result<Self> {
        let (h, w) = array.dim();
        Self::from_raw(w as u32, h as u32, array.iter().copied().collect())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.pixels
    }

    /// `(height, width)` view over the samples.
    pub fn view(&self) -> Result<ArrayView2<'_, u8>> {
        ArrayView2::from_shape((self.height as usize, self.width as usize), &self.pixels)
            .map_err(|e| Error::decode(format!("{}x{} raster: {e}", self.width, self.height)))
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Read an 8-bit grayscale raster. PNG goes through `png`, everything else through `image`.
pub fn load_grayscale_image(path: impl AsRef<Path>) -> Result<Image> {
    let path = path.as_ref();
    let image = if extension(path) == "png" {
        load_png(path)?
    } else {
        load_any(path)?
    };
    log::debug!(
        "loaded {} ({}x{})",
        path.display(),
        image.width(),
        image.height()
    );
    Ok(image)
}

fn load_png(path: &Path) -> Result<Image> {
    let file = File::open(path)
        .map_err(|e| Error::decode(format!("cannot open {}: {e}", path.display())))?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    // IDENTITY keeps the stored depth so 16-bit files are refused instead of stripped.
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder
        .read_info()
        .map_err(|e| Error::decode(format!("{}: {e}", path.display())))?;

    let mut buffer = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buffer)
        .map_err(|e| Error::decode(format!("{}: {e}", path.display())))?;
    match (info.color_type, info.bit_depth) {
        (PngColorType::Grayscale, BitDepth::Eight) => {}
        (color, depth) => {
            return Err(Error::decode(format!(
                "{}: supposed to be 8 bit grayscale, got {color:?} {depth:?}",
                path.display()
            )))
        }
    }
    buffer.truncate(info.buffer_size());
    Image::from_raw(info.width, info.height, buffer)
}

fn load_any(path: &Path) -> Result<Image> {
    let decoded = ImageReader::open(path)
        .map_err(|e| Error::decode(format!("cannot open {}: {e}", path.display())))?
        .with_guessed_format()
        .map_err(|e| Error::decode(format!("{}: {e}", path.display())))?
        .decode()
        .map_err(|e| Error::decode(format!("{}: {e}", path.display())))?;
    match decoded {
        DynamicImage::ImageLuma8(gray) => {
            let (w, h) = gray.dimensions();
            Image::from_raw(w, h, gray.into_raw())
        }
        v => Err(Error::decode(format!(
            "{}: supposed to be 8 bit grayscale, got {:?}",
            path.display(),
            v.color()
        ))),
    }
}

/// Write `image` in the format implied by the file extension (binary PGM for `.pgm`/`.pnm`).
pub fn save_grayscale_image(path: impl AsRef<Path>, image: &Image) -> Result<()> {
    let path = path.as_ref();
    match extension(path).as_str() {
        "png" => save_png(path, image)?,
        "pgm" | "pnm" => {
            let file = BufWriter::new(File::create(path)?);
            PnmEncoder::new(file)
                .with_subtype(PnmSubtype::Graymap(SampleEncoding::Binary))
                .write_image(image.as_raw(), image.width(), image.height(), ColorType::L8)
                .map_err(|e| Error::io_other(format!("{}: {e}", path.display())))?;
        }
        _ => image::save_buffer(
            path,
            image.as_raw(),
            image.width(),
            image.height(),
            ColorType::L8,
        )
        .map_err(|e| Error::io_other(format!("{}: {e}", path.display())))?,
    }
    log::info!("saved {}", path.display());
    Ok(())
}

fn save_png(path: &Path, image: &Image) -> Result<()> {
    let file = File::create(path)?;
    let w = BufWriter::new(file);
    let mut encoder = png::Encoder::new(w, image.width(), image.height());
    encoder.set_color(PngColorType::Grayscale);
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder
        .write_header()
        .map_err(|e| Error::io_other(format!("{}: {e}", path.display())))?;
    writer
        .write_image_data(image.as_raw())
        .map_err(|e| Error::io_other(format!("{}: {e}", path.display())))?;
    writer
        .finish()
        .map_err(|e| Error::io_other(format!("{}: {e}", path.display())))
}
