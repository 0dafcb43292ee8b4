//! DETR Head Configuration
//!
//! This module defines the configuration of the prediction head and a few
//! presets matching the usual COCO setups.

use serde::{Deserialize, Serialize};

/// Configuration for the DETR prediction head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetrHeadConfig {
    /// Number of object classes, not counting the background class
    pub num_classes: usize,
    /// Hidden dimension of the transformer
    pub hidden_dim: usize,
    /// Number of heads of the spatial attention map
    pub nhead: usize,
    /// Depth of the box regression MLP
    pub num_mlp_layers: usize,
    /// Channel depths of the backbone levels fed to the mask head, coarse to fine
    pub fpn_dims: Vec<usize>,
    /// Whether to build the instance mask branch
    pub with_mask_head: bool,
    /// Focal-loss classification: per-class sigmoid scores, no background class
    pub use_focal_loss: bool,
    /// Dropout applied to the attention map during training
    pub attention_dropout: f32,
    /// Group count of the mask head's GroupNorm layers
    pub mask_num_groups: usize,
}

impl Default for DetrHeadConfig {
    fn default() -> Self {
        Self::coco()
    }
}

impl DetrHeadConfig {
    /// Box and class prediction for the 80 COCO categories
    pub fn coco() -> Self {
        Self {
            num_classes: 80,
            hidden_dim: 256,
            nhead: 8,
            num_mlp_layers: 3,
            fpn_dims: vec![1024, 512, 256],
            with_mask_head: false,
            use_focal_loss: false,
            attention_dropout: 0.0,
            mask_num_groups: 8,
        }
    }

    /// COCO with the instance mask branch enabled
    pub fn coco_with_masks() -> Self {
        Self {
            with_mask_head: true,
            ..Self::coco()
        }
    }

    /// COCO with sigmoid focal-loss classification
    pub fn focal() -> Self {
        Self {
            use_focal_loss: true,
            ..Self::coco()
        }
    }

    /// Width of the class logits, including the background class when there is one
    pub fn num_outputs(&self) -> usize {
        if self.use_focal_loss {
            self.num_classes
        } else {
            self.num_classes + 1
        }
    }

    /// Input channels of the mask head: memory channels plus one attention map per head
    pub fn mask_input_dim(&self) -> usize {
        self.hidden_dim + self.nhead
    }
}
