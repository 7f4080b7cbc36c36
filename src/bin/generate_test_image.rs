use std::path::PathBuf;

use clap::Parser;
use histeq_gpu::{save_grayscale_image, Image};
use ndarray::Array2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Writes a low-contrast grayscale gradient", long_about = None)]
struct Parameters {
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
    ///Darkest intensity of the gradient.
    #[arg(long, default_value_t = 100)]
    low: u8,
    ///Brightest intensity of the gradient.
    #[arg(long, default_value_t = 140)]
    high: u8,
    ///Output file path
    #[arg(long, default_value = "test.pgm")]
    output: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let params = Parameters::parse();
    if params.low > params.high {
        eprintln!("--low {} is above --high {}", params.low, params.high);
        std::process::exit(1);
    }

    let span = (params.high - params.low) as f32;
    let step = 1.0 / params.width.max(2).saturating_sub(1) as f32;
    // horizontal ramp with a faint vertical ripple so no two rows are identical
    let pixels = Array2::from_shape_fn((params.height as usize, params.width as usize), |(y, x)| {
        let ramp = x as f32 * step * span;
        let ripple = ((y % 7) as f32 - 3.0) * 0.25;
        (params.low as f32 + ramp + ripple)
            .round()
            .clamp(params.low as f32, params.high as f32) as u8
    });

    let result = Image::from_array(&pixels).and_then(|image| save_grayscale_image(&params.output, &image));
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
