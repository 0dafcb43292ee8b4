//! FPN Mask Convolution Head
//!
//! Simple convolutional head using group norm. The per-query attention maps
//! are stacked onto the encoder feature map and the result is upsampled
//! top-down, FPN style, adding in adapted backbone features at every level.
//!
//! All convolutions are stride 1 with "same" padding, so the output spatial
//! size is the spatial size of the last (finest) pyramid feature.

use candle_core::{Module, Result, Tensor};
use candle_nn::{group_norm, Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use tracing::debug;

use crate::init;

/// Number of intermediate conv stages; the pyramid feeds all but the last.
pub const NUM_STAGES: usize = 4;

const GROUP_NORM_EPS: f64 = 1e-5;

/// conv -> GroupNorm -> ReLU
///
/// Weight path: `0.*` for the conv, `1.*` for the norm
#[derive(Debug, Clone)]
pub struct ConvGnBlock {
    conv: Conv2d,
    norm: GroupNorm,
}

impl ConvGnBlock {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        num_groups: usize,
    ) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let conv = init::conv2d_with(
            in_channels,
            out_channels,
            kernel_size,
            conv_config,
            init::kaiming_uniform(),
            true,
            vb.pp("0"),
        )?;
        let norm = group_norm(num_groups, out_channels, GROUP_NORM_EPS, vb.pp("1"))?;
        Ok(Self { conv, norm })
    }
}

impl Module for ConvGnBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.norm.forward(&x)?;
        x.relu()
    }
}

/// Mask head producing one mask logit map per (image, query)
pub struct MaskHeadFpnConv {
    /// Stem block keeping the input width
    conv0: ConvGnBlock,
    /// Stages halving the width each time
    conv_inter: Vec<ConvGnBlock>,
    /// Final 3x3 conv down to a single channel
    conv_out: Conv2d,
    /// 1x1 convs mapping each pyramid level to its stage width
    adapters: Vec<Conv2d>,
}

impl MaskHeadFpnConv {
    /// # Arguments
    /// * `input_dim` - hidden_dim + number of attention heads
    /// * `fpn_dims` - Channel depths of the pyramid levels, in the order they are consumed
    /// * `context_dim` - Base width; stages use context_dim / 2, / 4, / 8, / 16
    /// * `num_groups` - GroupNorm group count
    ///
    /// Weight path: `conv0.*`, `conv_inter.{i}.*`, `conv_out.*`, `adapter.{i}.*`
    pub fn load(
        vb: VarBuilder,
        input_dim: usize,
        fpn_dims: &[usize],
        context_dim: usize,
        num_groups: usize,
    ) -> Result<Self> {
        if fpn_dims.len() != NUM_STAGES - 1 {
            candle_core::bail!(
                "mask head expects {} pyramid levels, got {}",
                NUM_STAGES - 1,
                fpn_dims.len()
            );
        }

        let inter_dims: Vec<usize> = std::iter::once(input_dim)
            .chain((1..=NUM_STAGES).map(|i| context_dim >> i))
            .collect();
        if let Some(dim) = inter_dims
            .iter()
            .find(|&&d| d == 0 || num_groups == 0 || d % num_groups != 0)
        {
            candle_core::bail!(
                "mask head width {} is not divisible into {} groups (context_dim {})",
                dim,
                num_groups,
                context_dim
            );
        }

        let conv0 = ConvGnBlock::load(vb.pp("conv0"), input_dim, input_dim, 3, num_groups)?;

        let mut conv_inter = Vec::with_capacity(NUM_STAGES);
        for (i, dims) in inter_dims.windows(2).enumerate() {
            conv_inter.push(ConvGnBlock::load(
                vb.pp(format!("conv_inter.{}", i)),
                dims[0],
                dims[1],
                3,
                num_groups,
            )?);
        }

        let conv_out = init::conv2d_with(
            inter_dims[NUM_STAGES],
            1,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            init::kaiming_uniform(),
            true,
            vb.pp("conv_out"),
        )?;

        let mut adapters = Vec::with_capacity(fpn_dims.len());
        for (i, &fpn_dim) in fpn_dims.iter().enumerate() {
            adapters.push(init::conv2d_with(
                fpn_dim,
                inter_dims[i + 1],
                1,
                Conv2dConfig::default(),
                init::kaiming_uniform(),
                true,
                vb.pp(format!("adapter.{}", i)),
            )?);
        }

        Ok(Self {
            conv0,
            conv_inter,
            conv_out,
            adapters,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Projected encoder features [B, D, H, W]
    /// * `attention` - Attention maps [B, Q, heads, H, W]
    /// * `fpns` - Backbone features [B, C_i, H_i, W_i], coarse to fine
    ///
    /// # Returns
    /// Mask logits [B, Q, H_out, W_out] where (H_out, W_out) is the size of the last pyramid level
    pub fn forward(&self, x: &Tensor, attention: &Tensor, fpns: &[Tensor]) -> Result<Tensor> {
        if fpns.len() != self.adapters.len() {
            candle_core::bail!(
                "mask head expects {} pyramid levels, got {}",
                self.adapters.len(),
                fpns.len()
            );
        }
        let (bs, num_queries, num_heads, h, w) = attention.dims5()?;

        // One "image" per (batch, query): [B*Q, D + heads, H, W]
        let x = Tensor::cat(
            &[
                &repeat_per_query(x, num_queries)?,
                &attention.reshape((bs * num_queries, num_heads, h, w))?,
            ],
            1,
        )?;
        let mut x = self.conv0.forward(&x)?;

        for ((stage, adapter), feat) in self.conv_inter.iter().zip(&self.adapters).zip(fpns) {
            let feat = repeat_per_query(&adapter.forward(feat)?, num_queries)?;
            let (_, _, fh, fw) = feat.dims4()?;
            x = stage.forward(&x)?;
            x = (feat + x.upsample_nearest2d(fh, fw)?)?;
        }

        if let Some(last) = self.conv_inter.last() {
            x = last.forward(&x)?;
        }
        let x = self.conv_out.forward(&x)?;

        let (_, _, out_h, out_w) = x.dims4()?;
        debug!(out_h, out_w, "mask head output");
        x.reshape((bs, num_queries, out_h, out_w))
    }
}

/// [B, C, H, W] -> [B*Q, C, H, W] with row `b * Q + q` holding image `b`
fn repeat_per_query(x: &Tensor, num_queries: usize) -> Result<Tensor> {
    let (bs, c, h, w) = x.dims4()?;
    x.unsqueeze(1)?
        .repeat((1, num_queries, 1, 1, 1))?
        .reshape((bs * num_queries, c, h, w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn test_repeat_per_query_is_batch_major() {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2.0], (2, 1, 1, 1), &device).unwrap();
        let repeated = repeat_per_query(&x, 3).unwrap();
        let values: Vec<f32> = repeated.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_output_follows_finest_level() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // hidden 32 + 4 heads, context 64 -> stage widths 32, 16, 8, 4
        let head = MaskHeadFpnConv::load(vb, 36, &[48, 24, 12], 64, 4).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 32, 3, 3), &device).unwrap();
        let attention = Tensor::rand(0f32, 1.0, (2, 5, 4, 3, 3), &device).unwrap();
        let fpns = vec![
            Tensor::randn(0f32, 1.0, (2, 48, 6, 6), &device).unwrap(),
            Tensor::randn(0f32, 1.0, (2, 24, 12, 12), &device).unwrap(),
            Tensor::randn(0f32, 1.0, (2, 12, 24, 20), &device).unwrap(),
        ];

        let masks = head.forward(&x, &attention, &fpns).unwrap();
        assert_eq!(masks.dims(), &[2, 5, 24, 20]);

        let first = masks.i((0, 0)).unwrap();
        assert_eq!(first.dims(), &[24, 20]);
    }

    #[test]
    fn test_pyramid_length_checked_at_load() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MaskHeadFpnConv::load(vb, 36, &[48, 24], 64, 4).is_err());
    }

    #[test]
    fn test_groups_must_divide_widths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        // context 64 -> last stage width 4, not divisible into 8 groups
        assert!(MaskHeadFpnConv::load(vb, 40, &[48, 24, 12], 64, 8).is_err());
    }
}
