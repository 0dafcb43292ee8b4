//! Multi-Layer Perceptron
//!
//! A feed-forward stack with ReLU activations between layers and a linear
//! last layer. The detection head uses it to regress box coordinates.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::init;

/// Multi-Layer Perceptron (MLP / FFN)
///
/// Layer `0` maps `input_dim -> hidden_dim`, the middle layers keep
/// `hidden_dim`, and the last maps to `output_dim`.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// Weight path: `layers.{i}.weight` / `layers.{i}.bias`
    pub fn load(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            candle_core::bail!("Mlp needs at least one layer");
        }

        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let out_dim = if i == num_layers - 1 {
                output_dim
            } else {
                hidden_dim
            };
            layers.push(init::linear(in_dim, out_dim, vb.pp(format!("layers.{}", i)))?);
        }

        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut output = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output)?;
            if i < last {
                output = output.relu()?;
            }
        }
        Ok(output)
    }
}
