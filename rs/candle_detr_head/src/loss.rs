//! Loss contract between the head and the set-matching criterion
//!
//! The head never looks inside the loss: it hands over predictions for every
//! decoder layer plus the ground truth, and returns whatever the loss yields.

use candle_core::{Result, Tensor};

/// Everything a set-matching loss sees for one batch
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Normalized (cx, cy, w, h) boxes for every decoder layer [L, B, Q, 4]
    pub boxes: &'a Tensor,
    /// Class logits for every decoder layer [L, B, Q, C]
    pub logits: &'a Tensor,
    /// Per-image ground-truth boxes [N_i, 4]
    pub gt_bbox: &'a [Tensor],
    /// Per-image ground-truth classes [N_i, 1]
    pub gt_class: &'a [Tensor],
    /// Mask logits of the last decoder layer [B, Q, H_out, W_out]
    pub masks: Option<&'a Tensor>,
    /// Per-image rasterized ground-truth masks [N_i, H_pad, W_pad]
    pub gt_mask: Option<&'a [Tensor]>,
}

/// A training criterion the head delegates to.
///
/// The output type is chosen by the implementation: a scalar tensor, a map
/// of named terms, or anything else the training loop expects.
pub trait DetrLoss {
    type Output;

    fn compute(&self, inputs: LossInputs<'_>) -> Result<Self::Output>;
}

impl<L: DetrLoss + ?Sized> DetrLoss for Box<L> {
    type Output = L::Output;

    fn compute(&self, inputs: LossInputs<'_>) -> Result<Self::Output> {
        (**self).compute(inputs)
    }
}

impl<L: DetrLoss + ?Sized> DetrLoss for &L {
    type Output = L::Output;

    fn compute(&self, inputs: LossInputs<'_>) -> Result<Self::Output> {
        (**self).compute(inputs)
    }
}

/// Placeholder criterion for heads that are only ever run for inference
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoss;

impl DetrLoss for NoLoss {
    type Output = ();

    fn compute(&self, _inputs: LossInputs<'_>) -> Result<()> {
        candle_core::bail!("this head was built without a loss and cannot run in training mode")
    }
}
