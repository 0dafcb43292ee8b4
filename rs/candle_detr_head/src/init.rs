//! Parameter initialization
//!
//! Initializers are handed to the `VarBuilder` as hints. A builder backed by
//! safetensors ignores them and returns the stored weights; a builder backed
//! by a `VarMap` creates fresh variables with them.

use candle_core::Result;
use candle_nn::init::{FanInOut, NonLinearity, NormalOrUniform};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, VarBuilder, VarMap};

/// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`, used for weights and biases
/// of plain linear layers.
pub fn fan_in_uniform(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Glorot uniform initialization.
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// He uniform initialization for layers followed by a ReLU.
pub fn kaiming_uniform() -> Init {
    Init::Kaiming {
        dist: NormalOrUniform::Uniform,
        fan: FanInOut::FanIn,
        non_linearity: NonLinearity::ReLU,
    }
}

/// Linear layer with both weight and bias drawn from `fan_in_uniform`.
pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let init = fan_in_uniform(in_dim);
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = vb.get_with_hints(out_dim, "bias", init)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Linear layer with an explicit weight initializer and zero bias.
pub fn linear_with(
    in_dim: usize,
    out_dim: usize,
    weight_init: Init,
    bias: bool,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", weight_init)?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// Square-kernel convolution with an explicit weight initializer and zero bias.
pub fn conv2d_with(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv2dConfig,
    weight_init: Init,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (
            out_channels,
            in_channels / config.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
        weight_init,
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Conv2d::new(weight, bias, config))
}

/// Total number of scalar parameters held by a `VarMap`.
pub fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|var| var.elem_count()).sum()
}
