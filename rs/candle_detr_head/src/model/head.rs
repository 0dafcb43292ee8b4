//! DETR Prediction Head
//!
//! Class and box predictions for every decoder layer, plus the optional
//! instance mask branch:
//!
//! ```text
//! feats[L,B,Q,D] -> score_head -> logits[L,B,Q,C]
//!                -> bbox_head -> sigmoid -> boxes[L,B,Q,4]
//! feats[-1] x memory -> bbox_attention -> attention[B,Q,heads,H,W]
//! src_proj + attention + reversed backbone[1..] -> mask_head -> masks[B,Q,H_out,W_out]
//! ```
//!
//! Training hands everything to the loss; inference returns the last layer.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::debug;

use crate::config::DetrHeadConfig;
use crate::gt_mask::{gt_masks_from_polygons, ImagePolygons};
use crate::init;
use crate::loss::{DetrLoss, LossInputs, NoLoss};
use crate::model::attention_map::MultiHeadAttentionMap;
use crate::model::mask_head::MaskHeadFpnConv;
use crate::model::mlp::Mlp;

/// What the transformer hands to the head
#[derive(Debug, Clone)]
pub struct TransformerOutput {
    /// Decoder outputs of every layer [L, B, Q, D]
    pub feats: Tensor,
    /// Encoder memory [B, D, H, W]
    pub memory: Tensor,
    /// Projected memory, either [B, D, H, W] or flattened [B, H*W, D]
    pub src_proj: Tensor,
    /// Additive attention bias broadcastable to [B, Q, heads, H, W]
    pub src_mask: Option<Tensor>,
}

/// Ground truth for one training batch
#[derive(Debug, Clone, Default)]
pub struct Supervision {
    /// Per-image boxes [N_i, 4]
    pub gt_bbox: Option<Vec<Tensor>>,
    /// Per-image classes [N_i, 1]
    pub gt_class: Option<Vec<Tensor>>,
    /// Per-image, per-object polygon parts
    pub gt_poly: Option<Vec<ImagePolygons>>,
    /// Validity mask of the padded batch [B, H_pad, W_pad]
    pub pad_mask: Option<Tensor>,
}

impl Supervision {
    pub fn new(gt_bbox: Vec<Tensor>, gt_class: Vec<Tensor>) -> Self {
        Self {
            gt_bbox: Some(gt_bbox),
            gt_class: Some(gt_class),
            ..Default::default()
        }
    }

    /// Add polygon supervision for the mask branch
    pub fn with_polygons(mut self, gt_poly: Vec<ImagePolygons>, pad_mask: Tensor) -> Self {
        self.gt_poly = Some(gt_poly);
        self.pad_mask = Some(pad_mask);
        self
    }

    fn require(&self) -> Result<RequiredTargets<'_>> {
        let Some(gt_bbox) = self.gt_bbox.as_deref() else {
            candle_core::bail!("training requires `gt_bbox`");
        };
        let Some(gt_class) = self.gt_class.as_deref() else {
            candle_core::bail!("training requires `gt_class`");
        };
        let polygons = match (&self.gt_poly, &self.pad_mask) {
            (Some(gt_poly), Some(pad_mask)) => Some((gt_poly.as_slice(), pad_mask)),
            (Some(_), None) => candle_core::bail!("`gt_poly` supervision requires `pad_mask`"),
            (None, _) => None,
        };
        Ok(RequiredTargets {
            gt_bbox,
            gt_class,
            polygons,
        })
    }
}

struct RequiredTargets<'a> {
    gt_bbox: &'a [Tensor],
    gt_class: &'a [Tensor],
    polygons: Option<(&'a [ImagePolygons], &'a Tensor)>,
}

/// How a forward call is run
#[derive(Debug, Clone, Copy)]
pub enum Mode<'a> {
    /// Dropout active, output is the loss
    Training(&'a Supervision),
    /// Output is the last decoder layer's predictions
    Inference,
}

/// Last-layer predictions
#[derive(Debug, Clone)]
pub struct Predictions {
    /// Normalized (cx, cy, w, h) boxes [B, Q, 4]
    pub boxes: Tensor,
    /// Class logits [B, Q, C]
    pub logits: Tensor,
    /// Mask logits [B, Q, H_out, W_out]
    pub masks: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub enum HeadOutput<T> {
    Loss(T),
    Predictions(Predictions),
}

impl<T> HeadOutput<T> {
    pub fn into_loss(self) -> Option<T> {
        match self {
            HeadOutput::Loss(loss) => Some(loss),
            HeadOutput::Predictions(_) => None,
        }
    }

    pub fn into_predictions(self) -> Option<Predictions> {
        match self {
            HeadOutput::Loss(_) => None,
            HeadOutput::Predictions(predictions) => Some(predictions),
        }
    }
}

/// Mask branch: spatial attention followed by the FPN conv head
struct MaskBranch {
    bbox_attention: MultiHeadAttentionMap,
    mask_head: MaskHeadFpnConv,
}

/// DETR prediction head
pub struct DetrHead<L: DetrLoss = NoLoss> {
    /// Width of the class logits, background included when present
    num_classes: usize,
    hidden_dim: usize,
    score_head: Linear,
    bbox_head: Mlp,
    mask_branch: Option<MaskBranch>,
    loss: L,
}

impl<L: DetrLoss> DetrHead<L> {
    /// Weight path: `score_head.*`, `bbox_head.layers.{i}.*`, and with masks
    /// `bbox_attention.*`, `mask_head.*`
    pub fn load(vb: VarBuilder, config: &DetrHeadConfig, loss: L) -> Result<Self> {
        let num_classes = config.num_outputs();
        let hidden_dim = config.hidden_dim;

        let score_head = init::linear(hidden_dim, num_classes, vb.pp("score_head"))?;
        let bbox_head = Mlp::load(
            hidden_dim,
            hidden_dim,
            4,
            config.num_mlp_layers,
            vb.pp("bbox_head"),
        )?;

        let mask_branch = if config.with_mask_head {
            let bbox_attention = MultiHeadAttentionMap::load(
                vb.pp("bbox_attention"),
                hidden_dim,
                hidden_dim,
                config.nhead,
                config.attention_dropout,
                true,
            )?;
            let mask_head = MaskHeadFpnConv::load(
                vb.pp("mask_head"),
                config.mask_input_dim(),
                &config.fpn_dims,
                hidden_dim,
                config.mask_num_groups,
            )?;
            Some(MaskBranch {
                bbox_attention,
                mask_head,
            })
        } else {
            None
        };

        Ok(Self {
            num_classes,
            hidden_dim,
            score_head,
            bbox_head,
            mask_branch,
            loss,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn with_mask_head(&self) -> bool {
        self.mask_branch.is_some()
    }

    pub fn loss(&self) -> &L {
        &self.loss
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `out` - Transformer outputs
    /// * `body_feats` - Backbone pyramid, fine to coarse (e.g. C2, C3, C4, C5)
    /// * `mode` - Training with ground truth, or inference
    pub fn forward(
        &self,
        out: &TransformerOutput,
        body_feats: &[Tensor],
        mode: Mode<'_>,
    ) -> Result<HeadOutput<L::Output>> {
        let targets = match mode {
            Mode::Training(supervision) => Some(supervision.require()?),
            Mode::Inference => None,
        };
        let train = targets.is_some();

        let (num_layers, bs, num_queries, _) = out.feats.dims4()?;
        if num_layers == 0 {
            candle_core::bail!("decoder output has no layers");
        }

        let logits = self.score_head.forward(&out.feats)?;
        let boxes = candle_nn::ops::sigmoid(&self.bbox_head.forward(&out.feats)?)?;
        debug!(logits = ?logits.dims(), boxes = ?boxes.dims(), "head predictions");

        let masks = match &self.mask_branch {
            Some(branch) => {
                let masks = self.forward_masks(branch, out, body_feats, train)?;
                let (_, _, h, w) = masks.dims4()?;
                Some(masks.reshape((bs, num_queries, h, w))?)
            }
            None => None,
        };

        match targets {
            Some(targets) => {
                let gt_mask = match targets.polygons {
                    Some((gt_poly, pad_mask)) => Some(gt_masks_from_polygons(gt_poly, pad_mask)?),
                    None => None,
                };
                let loss = self.loss.compute(LossInputs {
                    boxes: &boxes,
                    logits: &logits,
                    gt_bbox: targets.gt_bbox,
                    gt_class: targets.gt_class,
                    masks: masks.as_ref(),
                    gt_mask: gt_mask.as_deref(),
                })?;
                Ok(HeadOutput::Loss(loss))
            }
            None => Ok(HeadOutput::Predictions(Predictions {
                boxes: boxes.get(num_layers - 1)?,
                logits: logits.get(num_layers - 1)?,
                masks,
            })),
        }
    }

    fn forward_masks(
        &self,
        branch: &MaskBranch,
        out: &TransformerOutput,
        body_feats: &[Tensor],
        train: bool,
    ) -> Result<Tensor> {
        let last_layer = out.feats.get(out.feats.dim(0)? - 1)?;
        let attention = branch.bbox_attention.forward(
            &last_layer,
            &out.memory,
            out.src_mask.as_ref(),
            train,
        )?;

        // Coarsest level is covered by the memory itself
        let fpn_feats: Vec<Tensor> = body_feats.iter().rev().skip(1).cloned().collect();
        let src_proj = spatial_src_proj(&out.src_proj, &out.memory)?;
        branch.mask_head.forward(&src_proj, &attention, &fpn_feats)
    }
}

/// Bring the projected memory to [B, D, H, W]
fn spatial_src_proj(src_proj: &Tensor, memory: &Tensor) -> Result<Tensor> {
    match src_proj.rank() {
        4 => Ok(src_proj.clone()),
        3 => {
            let (_, _, h, w) = memory.dims4()?;
            let (bs, hw, dim) = src_proj.dims3()?;
            if hw != h * w {
                candle_core::bail!(
                    "projected memory has {} positions but memory is {}x{}",
                    hw,
                    h,
                    w
                );
            }
            src_proj.transpose(1, 2)?.reshape((bs, dim, h, w))
        }
        rank => candle_core::bail!("projected memory must be rank 3 or 4, got rank {}", rank),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config(with_mask_head: bool) -> DetrHeadConfig {
        DetrHeadConfig {
            num_classes: 3,
            hidden_dim: 32,
            nhead: 4,
            fpn_dims: vec![24, 16, 8],
            with_mask_head,
            mask_num_groups: 2,
            ..DetrHeadConfig::coco()
        }
    }

    fn transformer_output(device: &Device) -> TransformerOutput {
        TransformerOutput {
            feats: Tensor::randn(0f32, 1.0, (2, 1, 3, 32), device).unwrap(),
            memory: Tensor::randn(0f32, 1.0, (1, 32, 2, 2), device).unwrap(),
            src_proj: Tensor::randn(0f32, 1.0, (1, 4, 32), device).unwrap(),
            src_mask: None,
        }
    }

    fn body_feats(device: &Device) -> Vec<Tensor> {
        vec![
            Tensor::randn(0f32, 1.0, (1, 8, 16, 16), device).unwrap(),
            Tensor::randn(0f32, 1.0, (1, 16, 8, 8), device).unwrap(),
            Tensor::randn(0f32, 1.0, (1, 24, 4, 4), device).unwrap(),
            Tensor::randn(0f32, 1.0, (1, 48, 2, 2), device).unwrap(),
        ]
    }

    #[test]
    fn test_flattened_src_proj_is_folded() {
        let device = Device::Cpu;
        let memory = Tensor::zeros((2, 3, 4, 5), DType::F32, &device).unwrap();
        let flat = Tensor::arange(0f32, 120.0, &device)
            .unwrap()
            .reshape((2, 20, 3))
            .unwrap();
        let spatial = spatial_src_proj(&flat, &memory).unwrap();
        assert_eq!(spatial.dims(), &[2, 3, 4, 5]);

        // Channel 1 of position (y=1, x=2) in image 0 is flat[0, 1 * 5 + 2, 1]
        let v = spatial
            .get(0)
            .unwrap()
            .get(1)
            .unwrap()
            .get(1)
            .unwrap()
            .get(2)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(v, (7 * 3 + 1) as f32);
    }

    #[test]
    fn test_training_requires_boxes_and_classes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = DetrHead::load(vb, &small_config(false), NoLoss).unwrap();

        // Rank-2 feats would fail inside the head; the precondition must fire first.
        let out = TransformerOutput {
            feats: Tensor::zeros((3, 32), DType::F32, &device).unwrap(),
            ..transformer_output(&device)
        };

        let missing_class = Supervision {
            gt_bbox: Some(vec![]),
            ..Default::default()
        };
        let err = head
            .forward(&out, &[], Mode::Training(&missing_class))
            .err()
            .unwrap();
        assert!(err.to_string().contains("gt_class"), "{err}");

        let err = head
            .forward(&out, &[], Mode::Training(&Supervision::default()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("gt_bbox"), "{err}");
    }

    #[test]
    fn test_polygons_require_pad_mask() {
        let supervision = Supervision {
            gt_poly: Some(vec![]),
            ..Supervision::new(vec![], vec![])
        };
        assert!(supervision.require().is_err());
    }

    #[test]
    fn test_inference_returns_last_layer() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = DetrHead::load(vb, &small_config(true), NoLoss).unwrap();
        assert_eq!(head.num_classes(), 4);

        let out = transformer_output(&device);
        let predictions = head
            .forward(&out, &body_feats(&device), Mode::Inference)
            .unwrap()
            .into_predictions()
            .unwrap();

        assert_eq!(predictions.boxes.dims(), &[1, 3, 4]);
        assert_eq!(predictions.logits.dims(), &[1, 3, 4]);
        let masks = predictions.masks.unwrap();
        assert_eq!(masks.dims(), &[1, 3, 16, 16]);

        // The last layer alone through the score head gives the same logits.
        let last = out.feats.get(1).unwrap();
        let expected = head.score_head.forward(&last).unwrap();
        let diff = (expected - &predictions.logits)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_masks_follow_last_decoder_layer_only() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = DetrHead::load(vb, &small_config(true), NoLoss).unwrap();

        let base = TransformerOutput {
            feats: Tensor::randn(0f32, 1.0, (3, 1, 3, 32), &device).unwrap(),
            ..transformer_output(&device)
        };
        let pyramid = body_feats(&device);
        let masks_for = |feats: Tensor| -> Tensor {
            let out = TransformerOutput {
                feats,
                ..base.clone()
            };
            head.forward(&out, &pyramid, Mode::Inference)
                .unwrap()
                .into_predictions()
                .unwrap()
                .masks
                .unwrap()
        };
        let reference = masks_for(base.feats.clone());

        let earlier = base.feats.narrow(0, 0, 2).unwrap();
        let last = base.feats.narrow(0, 2, 1).unwrap();
        let shifted_earlier = (&earlier + 1.5).unwrap();
        let shifted_last = (&last + 1.5).unwrap();

        let earlier_changed = masks_for(Tensor::cat(&[&shifted_earlier, &last], 0).unwrap());
        assert_eq!(max_abs_diff(&reference, &earlier_changed), 0.0);

        let last_changed = masks_for(Tensor::cat(&[&earlier, &shifted_last], 0).unwrap());
        assert!(max_abs_diff(&reference, &last_changed) > 1e-6);
    }
}
