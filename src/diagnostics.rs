//! Text dumps, log output and charts of the intermediate tables.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::Array1;
use ndarray_stats::QuantileExt;
use num_traits::ToPrimitive;
use plotters::prelude::{AreaSeries, BitMapBackend, ChartBuilder, Color, IntoDrawingArea, BLUE, RED, WHITE};

use crate::pipeline::Equalization;
use crate::{Error, Result};

const CHART_SIZE: (u32, u32) = (1024, 768);

fn as_f64<T: ToPrimitive + Copy>(values: &Array1<T>) -> Array1<f64> {
    values.mapv(|v| v.to_f64().unwrap_or(0.0))
}

/// Write `"<intensity> <value>"` per line.
pub fn write_table<T: std::fmt::Display>(path: impl AsRef<Path>, values: &Array1<T>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    for (intensity, value) in values.iter().enumerate() {
        writeln!(out, "{intensity} {value}")?;
    }
    out.flush()?;
    Ok(())
}

/// Write `histogram_data.txt`, `cumulative_histogram_data.txt` and `lut_data.txt` into `dir`.
pub fn dump_tables(dir: impl AsRef<Path>, result: &Equalization) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    write_table(dir.join("histogram_data.txt"), result.histogram.counts())?;
    write_table(dir.join("cumulative_histogram_data.txt"), result.cumulative.values())?;
    write_table(dir.join("lut_data.txt"), result.lut.entries())?;
    log::info!("tables written to {}", dir.display());
    Ok(())
}

/// Log the non-zero entries at trace level.
pub fn log_table<T>(name: &str, values: &Array1<T>)
where
    T: std::fmt::Display + num_traits::Zero + Copy,
{
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    for (intensity, value) in values.iter().enumerate().filter(|(_, v)| !v.is_zero()) {
        log::trace!("{name}[{intensity}] = {value}");
    }
}

/// Render `values` as an area chart PNG.
pub fn plot_table<T: ToPrimitive + Copy>(
    path: impl AsRef<Path>,
    values: &Array1<T>,
    caption: &str,
) -> Result<()> {
    let data = as_f64(values);
    let top = data.max().map(|&m| m.max(1.0)).unwrap_or(1.0) * 1.05;
    let chart_err = |e: &dyn std::fmt::Display| Error::io_other(format!("{caption}: {e}"));

    let root = BitMapBackend::new(path.as_ref(), CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(|e| chart_err(&e))?;
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 24))
        .margin(10i32)
        .x_label_area_size(30)
        .y_label_area_size(60)
        .build_cartesian_2d(0..data.len(), 0.0..top)
        .map_err(|e| chart_err(&e))?;
    chart
        .configure_mesh()
        .draw()
        .map_err(|e| chart_err(&e))?;
    chart
        .draw_series(
            AreaSeries::new(data.iter().enumerate().map(|(x, &y)| (x, y)), 0.0, RED.mix(0.2))
                .border_style(BLUE),
        )
        .map_err(|e| chart_err(&e))?;
    root.present().map_err(|e| chart_err(&e))?;
    Ok(())
}

/// Write `histogram.png`, `cumulative_histogram.png` and `lut.png` into `dir`.
pub fn plot_tables(dir: impl AsRef<Path>, result: &Equalization) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    plot_table(dir.join("histogram.png"), result.histogram.counts(), "histogram")?;
    plot_table(
        dir.join("cumulative_histogram.png"),
        result.cumulative.values(),
        "cumulative histogram",
    )?;
    plot_table(dir.join("lut.png"), result.lut.entries(), "lut")?;
    log::info!("charts written to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuDevice;
    use crate::pipeline::Equalizer;
    use crate::raster::Image;

    fn sample() -> Equalization {
        let image = Image::from_raw(2, 2, vec![0, 0, 255, 255]).unwrap();
        Equalizer::new(Box::new(CpuDevice::new(Some(1)).unwrap()))
            .run(&image)
            .unwrap()
    }

    #[test]
    fn test_write_table_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        write_table(&path, &Array1::from_vec(vec![5u32, 0, 7])).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0 5\n1 0\n2 7\n");
    }

    #[test]
    fn test_dump_tables_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("dump");
        dump_tables(&out, &sample()).unwrap();

        let hist = std::fs::read_to_string(out.join("histogram_data.txt")).unwrap();
        let lines: Vec<&str> = hist.lines().collect();
        assert_eq!(lines.len(), 256);
        assert_eq!(lines[0], "0 2");
        assert_eq!(lines[1], "1 0");
        assert_eq!(lines[255], "255 2");

        let cum = std::fs::read_to_string(out.join("cumulative_histogram_data.txt")).unwrap();
        assert_eq!(cum.lines().last(), Some("255 4"));
        let lut = std::fs::read_to_string(out.join("lut_data.txt")).unwrap();
        assert_eq!(lut.lines().nth(128), Some("128 0"));
    }

    #[test]
    fn test_write_table_to_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_table(dir.path().join("no/such/file.txt"), &Array1::from_vec(vec![1u8]));
        assert!(matches!(err, Err(Error::Io(_))));
    }

    #[test]
    fn test_log_table_without_logger() {
        log_table("histogram", &Array1::from_vec(vec![0u32, 3, 0]));
    }

    #[test]
    fn test_as_f64() {
        let values = as_f64(&Array1::from_vec(vec![0u8, 255]));
        assert_eq!(values.to_vec(), vec![0.0, 255.0]);
    }
}
