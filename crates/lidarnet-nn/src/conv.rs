use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{error::NnError, linear::linear_layer_gemm};

/// Convolution over a neighborhood of points, channels last.
///
/// The receptive field spans `kernel_size` consecutive neighbors of `in_channels` each, so
/// a `kernel_size` of 1 is a pointwise (1x1) convolution and a `kernel_size` equal to the
/// neighborhood size collapses the whole neighborhood into one output vector.
///
/// The weight is stored as `[out_channels, kernel_size, in_channels]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    weight: Vec<f32>,
    bias: Option<Vec<f32>>,
}

impl Conv {
    /// Create a convolution with weights drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    ///
    /// The bias, when enabled, is drawn from the same distribution.
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size;
        let bound = if fan_in > 0 {
            1.0 / (fan_in as f32).sqrt()
        } else {
            0.0
        };
        let mut sample = |n: usize| -> Vec<f32> {
            if bound > 0.0 {
                (0..n).map(|_| rng.random_range(-bound..bound)).collect()
            } else {
                vec![0.0; n]
            }
        };

        let weight = sample(out_channels * fan_in);
        let bias = bias.then(|| sample(out_channels));

        Self {
            in_channels,
            out_channels,
            kernel_size,
            weight,
            bias,
        }
    }

    /// Create a convolution from existing parameters.
    ///
    /// # Errors
    ///
    /// Returns [`NnError::ShapeMismatch`] if the weight or the bias length does not match the
    /// channel counts.
    pub fn from_weights(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Result<Self, NnError> {
        let conv = Self {
            in_channels,
            out_channels,
            kernel_size,
            weight,
            bias,
        };
        conv.validate()?;
        Ok(conv)
    }

    /// Check the parameter lengths against the channel counts.
    pub fn validate(&self) -> Result<(), NnError> {
        let expected = self.out_channels * self.fan_in();
        if self.weight.len() != expected {
            return Err(NnError::ShapeMismatch(
                vec![self.out_channels, self.kernel_size, self.in_channels],
                vec![self.weight.len()],
            ));
        }
        if let Some(bias) = &self.bias {
            if bias.len() != self.out_channels {
                return Err(NnError::ShapeMismatch(vec![self.out_channels], vec![bias.len()]));
            }
        }
        Ok(())
    }

    /// Number of input values per output row, `kernel_size * in_channels`.
    #[inline]
    pub fn fan_in(&self) -> usize {
        self.kernel_size * self.in_channels
    }

    /// Number of input channels per neighbor.
    #[inline]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    #[inline]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Number of consecutive neighbors in the receptive field.
    #[inline]
    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// The weight, `[out_channels, kernel_size, in_channels]` flattened.
    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    /// The bias, if any.
    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    /// Apply the convolution to `rows` receptive fields of `fan_in` values each.
    ///
    /// # Returns
    ///
    /// A buffer of shape `[rows, out_channels]`.
    pub fn forward(&self, src: &[f32], rows: usize) -> Result<Vec<f32>, NnError> {
        if src.len() != rows * self.fan_in() {
            return Err(NnError::ShapeMismatch(
                vec![rows, self.kernel_size, self.in_channels],
                vec![src.len()],
            ));
        }
        let mut dst = vec![0.0; rows * self.out_channels];
        linear_layer_gemm(
            src,
            &self.weight,
            self.bias.as_deref(),
            &mut dst,
            rows,
            self.fan_in(),
            self.out_channels,
        );
        Ok(dst)
    }
}

/// Batch normalization in inference mode, applied over the last (channel) axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    weight: Vec<f32>,
    bias: Vec<f32>,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    eps: f32,
}

impl BatchNorm {
    /// Default epsilon added to the variance.
    pub const DEFAULT_EPS: f32 = 1e-5;

    /// Create a freshly initialized normalization: unit scale, zero shift, zero mean and
    /// unit variance.
    pub fn new(channels: usize) -> Self {
        Self {
            weight: vec![1.0; channels],
            bias: vec![0.0; channels],
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
            eps: Self::DEFAULT_EPS,
        }
    }

    /// Create a normalization from trained statistics.
    ///
    /// # Errors
    ///
    /// Returns [`NnError::ShapeMismatch`] if the vectors differ in length.
    pub fn from_stats(
        weight: Vec<f32>,
        bias: Vec<f32>,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
        eps: f32,
    ) -> Result<Self, NnError> {
        let norm = Self {
            weight,
            bias,
            running_mean,
            running_var,
            eps,
        };
        norm.validate()?;
        Ok(norm)
    }

    /// Check that all statistics have one entry per channel.
    pub fn validate(&self) -> Result<(), NnError> {
        let channels = self.weight.len();
        for len in [
            self.bias.len(),
            self.running_mean.len(),
            self.running_var.len(),
        ] {
            if len != channels {
                return Err(NnError::ShapeMismatch(vec![channels], vec![len]));
            }
        }
        Ok(())
    }

    /// Number of channels.
    #[inline]
    pub fn channels(&self) -> usize {
        self.weight.len()
    }

    /// Normalize `x`, a buffer of rows of `channels` values, in place.
    pub fn forward_inplace(&self, x: &mut [f32]) -> Result<(), NnError> {
        let channels = self.channels();
        if channels == 0 || x.len() % channels != 0 {
            return Err(NnError::ShapeMismatch(vec![channels], vec![x.len()]));
        }

        // fold the statistics into a per channel scale and shift
        let (scale, shift): (Vec<f32>, Vec<f32>) = self
            .weight
            .iter()
            .zip(&self.bias)
            .zip(self.running_mean.iter().zip(&self.running_var))
            .map(|((&w, &b), (&mean, &var))| {
                let s = w / (var + self.eps).sqrt();
                (s, b - mean * s)
            })
            .unzip();

        x.chunks_exact_mut(channels).for_each(|row| {
            row.iter_mut()
                .zip(scale.iter().zip(&shift))
                .for_each(|(v, (s, t))| *v = *v * s + t);
        });

        Ok(())
    }
}

/// A convolution optionally followed by batch normalization and a ReLU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvBlock {
    /// The convolution.
    pub conv: Conv,
    /// Optional batch normalization.
    pub norm: Option<BatchNorm>,
    /// Whether a ReLU is applied last.
    pub relu: bool,
}

impl ConvBlock {
    /// Convolution, batch normalization and ReLU.
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            conv: Conv::new(in_channels, out_channels, kernel_size, bias, rng),
            norm: Some(BatchNorm::new(out_channels)),
            relu: true,
        }
    }

    /// Plain convolution, no normalization and no activation.
    pub fn plain<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            conv: Conv::new(in_channels, out_channels, kernel_size, bias, rng),
            norm: None,
            relu: false,
        }
    }

    /// Check the parameters of the convolution and of the normalization.
    pub fn validate(&self) -> Result<(), NnError> {
        self.conv.validate()?;
        if let Some(norm) = &self.norm {
            norm.validate()?;
            if norm.channels() != self.conv.out_channels() {
                return Err(NnError::ShapeMismatch(
                    vec![self.conv.out_channels()],
                    vec![norm.channels()],
                ));
            }
        }
        Ok(())
    }

    /// Number of output channels.
    #[inline]
    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    /// Check that the convolution maps `in_channels` to `out_channels` over `kernel_size`
    /// neighbors.
    ///
    /// # Errors
    ///
    /// Returns [`NnError::InvalidConfig`] naming the block `name` on any difference.
    pub fn expect_shape(
        &self,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Result<(), NnError> {
        let conv = &self.conv;
        let (found_in, found_out, found_kernel) =
            (conv.in_channels(), conv.out_channels(), conv.kernel_size());
        if (found_in, found_out, found_kernel) != (in_channels, out_channels, kernel_size) {
            return Err(NnError::InvalidConfig(format!(
                "{name}: expected {in_channels} -> {out_channels} channels over \
                 {kernel_size} neighbors, got {found_in} -> {found_out} over {found_kernel}"
            )));
        }
        Ok(())
    }

    /// Apply the block to `rows` receptive fields.
    pub fn forward(&self, src: &[f32], rows: usize) -> Result<Vec<f32>, NnError> {
        let mut x = self.conv.forward(src, rows)?;
        if let Some(norm) = &self.norm {
            if !x.is_empty() {
                norm.forward_inplace(&mut x)?;
            }
        }
        if self.relu {
            relu_inplace(&mut x);
        }
        Ok(x)
    }
}

/// Rectified linear unit, in place.
pub fn relu_inplace(x: &mut [f32]) {
    x.iter_mut().for_each(|v| *v = v.max(0.0));
}

/// Run `src` through a chain of blocks that all see the same number of rows.
pub(crate) fn forward_chain(
    blocks: &[ConvBlock],
    src: &[f32],
    rows: usize,
) -> Result<Vec<f32>, NnError> {
    let mut blocks = blocks.iter();
    let Some(first) = blocks.next() else {
        return Ok(src.to_vec());
    };
    let mut x = first.forward(src, rows)?;
    for block in blocks {
        x = block.forward(&x, rows)?;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_conv_pointwise() -> Result<(), NnError> {
        let conv = Conv::from_weights(2, 1, 1, vec![1.0, -1.0], Some(vec![0.5]))?;
        let out = conv.forward(&[3.0, 1.0, 1.0, 3.0], 2)?;
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0], 2.5);
        assert_relative_eq!(out[1], -1.5);
        Ok(())
    }

    #[test]
    fn test_conv_neighborhood_layout() -> Result<(), NnError> {
        // kernel over 2 neighbors of 2 channels; weight picks neighbor 1, channel 0
        let conv = Conv::from_weights(2, 1, 2, vec![0.0, 0.0, 1.0, 0.0], None)?;
        let out = conv.forward(&[1.0, 2.0, 3.0, 4.0], 1)?;
        assert_relative_eq!(out[0], 3.0);
        Ok(())
    }

    #[test]
    fn test_conv_rejects_bad_weights() {
        assert!(Conv::from_weights(2, 2, 1, vec![0.0; 3], None).is_err());
        assert!(Conv::from_weights(2, 2, 1, vec![0.0; 4], Some(vec![0.0])).is_err());
    }

    #[test]
    fn test_conv_input_mismatch() -> Result<(), NnError> {
        let conv = Conv::from_weights(3, 1, 1, vec![1.0; 3], None)?;
        assert!(matches!(conv.forward(&[1.0; 5], 2), Err(NnError::ShapeMismatch(..))));
        Ok(())
    }

    #[test]
    fn test_conv_init_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let conv = Conv::new(4, 8, 1, true, &mut rng);
        let bound = 0.5;
        assert_eq!(conv.weight().len(), 32);
        assert!(conv.weight().iter().all(|w| w.abs() <= bound));
        assert!(conv.bias().is_some_and(|b| b.len() == 8));

        let conv = Conv::new(4, 8, 1, false, &mut rng);
        assert!(conv.bias().is_none());
    }

    #[test]
    fn test_batch_norm() -> Result<(), NnError> {
        let norm = BatchNorm::from_stats(
            vec![2.0, 1.0],
            vec![1.0, 0.0],
            vec![1.0, -1.0],
            vec![4.0, 1.0],
            0.0,
        )?;
        let mut x = vec![3.0, 0.0, 1.0, 1.0];
        norm.forward_inplace(&mut x)?;
        // (3 - 1) / 2 * 2 + 1 = 3, (0 + 1) / 1 = 1
        assert_relative_eq!(x[0], 3.0);
        assert_relative_eq!(x[1], 1.0);
        assert_relative_eq!(x[2], 1.0);
        assert_relative_eq!(x[3], 2.0);
        Ok(())
    }

    #[test]
    fn test_batch_norm_default_is_near_identity() -> Result<(), NnError> {
        let norm = BatchNorm::new(3);
        let mut x = vec![1.0, -2.0, 3.0];
        norm.forward_inplace(&mut x)?;
        for (a, e) in x.iter().zip([1.0, -2.0, 3.0]) {
            assert_relative_eq!(*a, e, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_block_relu() -> Result<(), NnError> {
        let block = ConvBlock {
            conv: Conv::from_weights(1, 2, 1, vec![1.0, -1.0], None)?,
            norm: None,
            relu: true,
        };
        let out = block.forward(&[2.0], 1)?;
        assert_eq!(out, vec![2.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_block_expect_shape() -> Result<(), NnError> {
        let block = ConvBlock {
            conv: Conv::from_weights(3, 2, 4, vec![0.0; 24], None)?,
            norm: None,
            relu: false,
        };
        assert_eq!(block.conv.in_channels(), 3);
        assert_eq!(block.conv.kernel_size(), 4);
        block.expect_shape("block", 3, 2, 4)?;
        // same fan in, different split between neighbors and channels
        assert!(matches!(
            block.expect_shape("block", 4, 2, 3),
            Err(NnError::InvalidConfig(_))
        ));
        assert!(matches!(
            block.expect_shape("block", 3, 1, 4),
            Err(NnError::InvalidConfig(_))
        ));
        Ok(())
    }
}
