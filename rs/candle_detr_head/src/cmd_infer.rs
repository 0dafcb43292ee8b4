//! Infer subcommand: run the head on synthetic transformer outputs.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use tracing::info;

use candle_detr_head::debug::TensorStats;
use candle_detr_head::{
    init, DetrHead, DetrHeadConfig, Mode, NoLoss, PostProcessor, TransformerOutput,
};

use crate::Preset;

/// Arguments for the infer subcommand
#[derive(Args, Debug)]
pub struct InferArgs {
    /// Path to head weights, in safetensors format. Random init when absent.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Configuration preset.
    #[arg(long, value_enum, default_value_t = Preset::Coco)]
    pub preset: Preset,

    /// JSON configuration file, takes precedence over the preset.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 100)]
    pub num_queries: usize,

    /// Number of decoder layers in the synthetic features.
    #[arg(long, default_value_t = 6)]
    pub num_layers: usize,

    /// Side of the (square) encoder memory, in cells.
    #[arg(long, default_value_t = 10)]
    pub memory_size: usize,

    /// Stride of the encoder memory relative to the image.
    #[arg(long, default_value_t = 32)]
    pub stride: usize,

    /// Threshold for the detection score.
    #[arg(long, default_value_t = 0.5)]
    pub score_threshold: f32,
}

impl InferArgs {
    fn head_config(&self) -> anyhow::Result<DetrHeadConfig> {
        match &self.config {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("opening config {:?}", path))?;
                serde_json::from_reader(file).with_context(|| format!("parsing config {:?}", path))
            }
            None => Ok(self.preset.config()),
        }
    }
}

/// Synthetic decoder/encoder outputs and a backbone pyramid matching the configuration
fn synthetic_inputs(
    args: &InferArgs,
    config: &DetrHeadConfig,
    device: &Device,
) -> candle_core::Result<(TransformerOutput, Vec<Tensor>)> {
    let (b, q, d, s) = (
        args.batch_size,
        args.num_queries,
        config.hidden_dim,
        args.memory_size,
    );
    let out = TransformerOutput {
        feats: Tensor::randn(0f32, 1.0, (args.num_layers, b, q, d), device)?,
        memory: Tensor::randn(0f32, 1.0, (b, d, s, s), device)?,
        src_proj: Tensor::randn(0f32, 1.0, (b, s * s, d), device)?,
        src_mask: Some(Tensor::zeros((b, 1, 1, s, s), DType::F32, device)?),
    };

    // Coarse to fine: one level at memory resolution, then fpn_dims at 2x, 4x, 8x.
    let mut body_feats = vec![Tensor::randn(0f32, 1.0, (b, 2 * d, s, s), device)?];
    for (i, &dim) in config.fpn_dims.iter().enumerate() {
        let size = s << (i + 1);
        body_feats.push(Tensor::randn(0f32, 1.0, (b, dim, size, size), device)?);
    }
    body_feats.reverse();
    Ok((out, body_feats))
}

/// Run the infer subcommand
pub fn run(args: &InferArgs, device: &Device) -> anyhow::Result<()> {
    let config = args.head_config()?;
    info!(
        "Head config: {} classes, hidden {}, {} heads, masks {}, focal {}",
        config.num_classes,
        config.hidden_dim,
        config.nhead,
        config.with_mask_head,
        config.use_focal_loss
    );

    let start = Instant::now();
    let varmap = VarMap::new();
    let head = match &args.model {
        Some(path) => {
            info!("Loading head from: {:?}", path);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
            DetrHead::load(vb, &config, NoLoss)?
        }
        None => {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            let head = DetrHead::load(vb, &config, NoLoss)?;
            info!("Random init, {} parameters", init::parameter_count(&varmap));
            head
        }
    };
    info!("Head ready in {:?}", start.elapsed());

    let (out, body_feats) = synthetic_inputs(args, &config, device)?;

    let start = Instant::now();
    let predictions = head
        .forward(&out, &body_feats, Mode::Inference)?
        .into_predictions()
        .context("inference returned no predictions")?;
    info!("Forward pass in {:?}", start.elapsed());

    println!("boxes  {}", TensorStats::from_tensor(&predictions.boxes)?);
    println!("logits {}", TensorStats::from_tensor(&predictions.logits)?);
    if let Some(masks) = &predictions.masks {
        println!("masks  {}", TensorStats::from_tensor(masks)?);
    }

    let image_side = args.memory_size * args.stride;
    let processor = PostProcessor {
        score_threshold: args.score_threshold,
        ..PostProcessor::for_config(&config)
    };
    let image_sizes = vec![(image_side, image_side); args.batch_size];
    let detections = processor.process(&predictions, &image_sizes)?;

    for (i, image_detections) in detections.iter().enumerate() {
        println!(
            "image {}: {} detections above {}",
            i,
            image_detections.len(),
            args.score_threshold
        );
        for det in image_detections {
            println!("  {}", det);
        }
    }

    Ok(())
}
