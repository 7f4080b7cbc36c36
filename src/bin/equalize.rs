use std::path::PathBuf;

use clap::Parser;
use histeq_gpu::diagnostics::{dump_tables, log_table, plot_tables};
use histeq_gpu::{
    list_devices, load_grayscale_image, open_device, save_grayscale_image, Backend, Equalizer,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Histogram equalization of 8-bit grayscale images", long_about = None)]
struct Parameters {
    ///Path to the input image.
    #[arg(default_value = "test.pgm")]
    input: PathBuf,
    ///Output file path. `.pgm`/`.pnm` writes binary PGM, `.png` writes PNG.
    #[arg(default_value = "output.pgm")]
    output: PathBuf,
    ///Compute backend.
    #[arg(short, long, value_enum, default_value_t = Backend::Cpu)]
    backend: Backend,
    ///WebGPU adapter index, as shown by --list-devices.
    #[arg(short, long)]
    device: Option<usize>,
    ///Worker threads for the CPU backend. All cores by default.
    #[arg(short, long)]
    threads: Option<usize>,
    ///Print every available device and exit.
    #[arg(short, long)]
    list_devices: bool,
    ///Write histogram, cumulative histogram and LUT as text files into this directory.
    #[arg(long)]
    dump_dir: Option<PathBuf>,
    ///Write charts of the same tables into this directory.
    #[arg(long)]
    plot_dir: Option<PathBuf>,
}

fn run(params: &Parameters) -> histeq_gpu::Result<()> {
    let image = load_grayscale_image(&params.input)?;
    log::info!(
        "loaded {} ({}x{})",
        params.input.display(),
        image.width(),
        image.height()
    );

    let device = open_device(params.backend, params.device, params.threads)?;
    let mut equalizer = Equalizer::new(device);
    let result = equalizer.run(&image)?;

    let mean = |image: &histeq_gpu::Image| -> histeq_gpu::Result<f64> {
        Ok(image.view()?.mapv(f64::from).mean().unwrap_or(0.0))
    };
    log::info!(
        "mean intensity {:.1} -> {:.1}",
        mean(&image)?,
        mean(&result.output)?
    );
    log_table("histogram", result.histogram.counts());
    log_table("cumulative histogram", result.cumulative.values());
    log_table("lut", result.lut.entries());

    save_grayscale_image(&params.output, &result.output)?;
    log::info!(
        "{} -> {} on {}",
        params.input.display(),
        params.output.display(),
        equalizer.device_info().name
    );
    if let Some(dir) = &params.dump_dir {
        dump_tables(dir, &result)?;
    }
    if let Some(dir) = &params.plot_dir {
        if let Err(e) = plot_tables(dir, &result) {
            log::warn!("skipping charts: {e}");
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let params = Parameters::parse();

    if params.list_devices {
        for info in list_devices() {
            println!("{info}");
        }
        return;
    }

    if let Err(e) = run(&params) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
