use std::fmt;

use candle_core::{DType, Result, Tensor};

/// Tensor statistics for inspecting head outputs
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    /// Count of NaN and infinite entries, left out of the other statistics
    pub non_finite: usize,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let finite: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
        let non_finite = data.len() - finite.len();
        let min = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f32>() / finite.len() as f32
        };

        Ok(Self {
            shape,
            min,
            max,
            mean,
            non_finite,
        })
    }

    pub fn is_finite(&self) -> bool {
        self.non_finite == 0
    }
}

impl fmt::Display for TensorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} min {:.4} max {:.4} mean {:.4}",
            self.shape, self.min, self.max, self.mean
        )?;
        if !self.is_finite() {
            write!(f, " ({} non-finite)", self.non_finite)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_stats() {
        let t = Tensor::from_vec(vec![1f32, -2.0, 4.0, f32::NAN], (2, 2), &Device::Cpu).unwrap();
        let stats = TensorStats::from_tensor(&t).unwrap();
        assert_eq!(stats.shape, vec![2, 2]);
        assert_eq!(stats.min, -2.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.mean, 1.0);
        assert_eq!(stats.non_finite, 1);
        assert!(!stats.is_finite());
    }
}
