//! Multi-Head Spatial Attention Map
//!
//! A 2D attention module that only returns the attention softmax, without
//! multiplying by any value. Each query gets one spatial probability map per
//! head over the encoder memory; the mask head uses these maps as a soft
//! localization cue.

use candle_core::{Module, Result, Tensor};
use candle_nn::{ops::softmax_last_dim, Conv2d, Conv2dConfig, Dropout, Linear, VarBuilder};
use tracing::debug;

use crate::init;

/// Spatial attention weights between decoder queries and a 2D memory map
pub struct MultiHeadAttentionMap {
    /// Query projection: query_dim -> hidden_dim
    q_proj: Linear,
    /// Key projection as 1x1 conv: query_dim -> hidden_dim
    k_proj: Conv2d,
    dropout: Dropout,
    num_heads: usize,
    hidden_dim: usize,
    /// (hidden_dim / num_heads)^-0.5
    normalize_fact: f64,
}

impl MultiHeadAttentionMap {
    /// Weight path: `q_proj.*`, `k_proj.*`
    pub fn load(
        vb: VarBuilder,
        query_dim: usize,
        hidden_dim: usize,
        num_heads: usize,
        dropout: f32,
        bias: bool,
    ) -> Result<Self> {
        if num_heads == 0 || hidden_dim % num_heads != 0 {
            candle_core::bail!(
                "hidden_dim {} is not divisible by num_heads {}",
                hidden_dim,
                num_heads
            );
        }

        let weight_init = init::xavier_uniform(query_dim, hidden_dim);
        let q_proj = init::linear_with(query_dim, hidden_dim, weight_init, bias, vb.pp("q_proj"))?;
        let k_proj = init::conv2d_with(
            query_dim,
            hidden_dim,
            1,
            Conv2dConfig::default(),
            weight_init,
            bias,
            vb.pp("k_proj"),
        )?;

        let head_dim = hidden_dim / num_heads;
        Ok(Self {
            q_proj,
            k_proj,
            dropout: Dropout::new(dropout),
            num_heads,
            hidden_dim,
            normalize_fact: (head_dim as f64).powf(-0.5),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Normalized attention weights before dropout
    ///
    /// # Arguments
    /// * `q` - Query features [B, Q, query_dim]
    /// * `k` - Memory map [B, query_dim, H, W]
    /// * `mask` - Optional additive bias broadcastable to [B, Q, heads, H, W]
    ///
    /// # Returns
    /// Weights of shape [B, Q, heads, H, W], each (b, q, head) map summing to 1
    pub fn attention_weights(&self, q: &Tensor, k: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let q = self.q_proj.forward(q)?;
        let k = self.k_proj.forward(k)?;

        let (bs, num_queries, _) = q.dims3()?;
        let (_, _, h, w) = k.dims4()?;
        let n = self.num_heads;
        let c = self.hidden_dim / n;

        // Fold heads into the batch dimension for a single batched matmul.
        // q: [B, Q, n*c] -> [B, n, Q, c] -> [B*n, Q, c]
        let qh = q
            .reshape((bs, num_queries, n, c))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((bs * n, num_queries, c))?;
        // k: [B, n*c, H, W] -> [B*n, c, H*W]
        let kh = k.reshape((bs * n, c, h * w))?;

        // [B*n, Q, H*W] -> [B, n, Q, H, W] -> [B, Q, n, H, W]
        let weights = (qh * self.normalize_fact)?
            .matmul(&kh)?
            .reshape((bs, n, num_queries, h, w))?
            .transpose(1, 2)?;

        let weights = match mask {
            Some(mask) => weights.broadcast_add(mask)?,
            None => weights,
        };

        // Softmax over the flattened spatial extent only; normalizing H and W
        // separately would pick the wrong axis.
        let weights = weights
            .contiguous()?
            .reshape((bs, num_queries, n, h * w))?;
        let weights = softmax_last_dim(&weights)?.reshape((bs, num_queries, n, h, w))?;
        debug!(shape = ?weights.dims(), "attention map");
        Ok(weights)
    }

    /// Attention weights with dropout applied after normalization when `train` is set
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let weights = self.attention_weights(q, k, mask)?;
        self.dropout.forward(&weights, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    fn load_map(varmap: &VarMap, dropout: f32) -> MultiHeadAttentionMap {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        MultiHeadAttentionMap::load(vb, 32, 32, 4, dropout, true).unwrap()
    }

    #[test]
    fn test_output_shape() {
        let varmap = VarMap::new();
        let attn = load_map(&varmap, 0.0);
        let q = Tensor::randn(0f32, 1.0, (2, 5, 32), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 32, 6, 7), &Device::Cpu).unwrap();

        let weights = attn.forward(&q, &k, None, false).unwrap();
        assert_eq!(weights.dims(), &[2, 5, 4, 6, 7]);
    }

    #[test]
    fn test_spatial_sum_is_one() {
        let varmap = VarMap::new();
        let attn = load_map(&varmap, 0.0);
        let q = Tensor::randn(0f32, 1.0, (2, 5, 32), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 32, 6, 7), &Device::Cpu).unwrap();

        let weights = attn.attention_weights(&q, &k, None).unwrap();
        let sums: Vec<f32> = weights
            .flatten_from(3)
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(sums.len(), 2 * 5 * 4);
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "spatial sum {}", s);
        }

        let min = weights.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_mask_suppresses_padding() {
        let varmap = VarMap::new();
        let attn = load_map(&varmap, 0.0);
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 3, 32), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 32, 4, 4), &device).unwrap();

        // Last two columns are padding.
        let mut bias = vec![0f32; 16];
        for y in 0..4 {
            bias[y * 4 + 2] = -1e9;
            bias[y * 4 + 3] = -1e9;
        }
        let mask = Tensor::from_vec(bias, (1, 1, 1, 4, 4), &device).unwrap();

        let weights = attn.attention_weights(&q, &k, Some(&mask)).unwrap();
        let padded = weights
            .narrow(D::Minus1, 2, 2)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(padded < 1e-6);

        let valid = weights.narrow(D::Minus1, 0, 2).unwrap().sum_all().unwrap();
        let valid = valid.to_scalar::<f32>().unwrap();
        assert!((valid - 3.0 * 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_dropout_only_in_training() {
        let varmap = VarMap::new();
        let attn = load_map(&varmap, 0.5);
        let q = Tensor::randn(0f32, 1.0, (1, 4, 32), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 32, 5, 5), &Device::Cpu).unwrap();

        let reference = attn.attention_weights(&q, &k, None).unwrap();
        let eval = attn.forward(&q, &k, None, false).unwrap();
        let diff = (&reference - &eval)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);

        // Dropout zeroes entries after normalization, so the train-time sums drift from 1.
        let train = attn.forward(&q, &k, None, true).unwrap();
        let zeros = train
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .filter(|&v| v == 0.0)
            .count();
        assert!(zeros > 0);
    }

    #[test]
    fn test_heads_must_divide_hidden_dim() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MultiHeadAttentionMap::load(vb, 32, 30, 4, 0.0, true).is_err());
    }
}
