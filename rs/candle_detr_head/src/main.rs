//! DETR prediction head tooling
//!
//! `infer` runs the head on synthetic transformer outputs, `rasterize` turns
//! polygon annotations into mask images.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_infer;
mod cmd_rasterize;

use candle_core::{Device, Result};
use candle_detr_head::DetrHeadConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        info!("{}", cpu_fallback_hint());
        Ok(Device::Cpu)
    }
}

/// GPU backend feature for the host platform
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
const GPU_FEATURE: &str = "metal";
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
const GPU_FEATURE: &str = "cuda";

fn cpu_fallback_hint() -> String {
    format!("Running on CPU, to run on GPU ({GPU_FEATURE}), build detr_head with `--features {GPU_FEATURE}`")
}

/// Head configuration presets
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum Preset {
    Coco,
    CocoMasks,
    Focal,
}

impl Preset {
    pub fn config(&self) -> DetrHeadConfig {
        match self {
            Preset::Coco => DetrHeadConfig::coco(),
            Preset::CocoMasks => DetrHeadConfig::coco_with_masks(),
            Preset::Focal => DetrHeadConfig::focal(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the head on synthetic transformer outputs
    Infer(cmd_infer::InferArgs),
    /// Rasterize polygon annotations into a mask image
    Rasterize(cmd_rasterize::RasterizeArgs),
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Infer(args) => {
            let device = device(cli.cpu)?;
            info!("Using device: {:?}", device);
            cmd_infer::run(args, &device)
        }
        Command::Rasterize(args) => cmd_rasterize::run(args),
    }
}
