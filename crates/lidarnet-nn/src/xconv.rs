use lidarnet_tensor::{Tensor3, Tensor4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    conv::{forward_chain, ConvBlock},
    error::NnError,
    linear::batched_matmul,
    neighbors::knn,
    ops::{check_coords, concat_channels, gather, relative_offsets},
};

fn default_dilation() -> usize {
    1
}

fn default_bias() -> bool {
    true
}

/// Configuration of an [`XConv`] layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XConvConfig {
    /// Channels of the input features, 0 when the layer only sees coordinates.
    pub in_channels: usize,
    /// Channels of the output features.
    pub out_channels: usize,
    /// Number of neighbors aggregated per query.
    pub kernel_size: usize,
    /// Keep every `dilation`-th of the `kernel_size * dilation` nearest neighbors.
    #[serde(default = "default_dilation")]
    pub dilation: usize,
    /// Whether the convolutions carry a bias.
    #[serde(default = "default_bias")]
    pub bias: bool,
}

impl XConvConfig {
    /// Configuration with a dilation of 1 and biases enabled.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            dilation: default_dilation(),
            bias: default_bias(),
        }
    }

    /// Set the dilation.
    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Enable or disable the biases.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Channels of the lifted coordinate embedding, a quarter of the output channels.
    #[inline]
    pub fn mid_channels(&self) -> usize {
        self.out_channels / 4
    }

    /// Number of nearest neighbors searched per query.
    #[inline]
    pub fn search_size(&self) -> usize {
        self.kernel_size * self.dilation
    }

    /// Check that the configuration describes a usable layer.
    pub fn validate(&self) -> Result<(), NnError> {
        if self.kernel_size == 0 {
            return Err(NnError::InvalidConfig("kernel_size must be positive".into()));
        }
        if self.dilation == 0 {
            return Err(NnError::InvalidConfig("dilation must be positive".into()));
        }
        if self.mid_channels() == 0 {
            return Err(NnError::InvalidConfig(format!(
                "out_channels must be at least 4, got {}",
                self.out_channels
            )));
        }
        Ok(())
    }
}

/// Point convolution with a learned spatial transform.
///
/// For every query the layer gathers its `kernel_size` (dilated) nearest neighbors, lifts
/// their offsets to the query into a feature embedding, learns a `kernel_size x
/// kernel_size` matrix from the same offsets that weights and permutes the neighbors, and
/// convolves the transformed neighborhood into one output vector.
///
/// Tensors are channels last: points `[B, P, 3]`, queries `[B, Q, 3]`, features
/// `[B, P, in_channels]`, output `[B, Q, out_channels]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XConv {
    config: XConvConfig,
    mlp: Vec<ConvBlock>,
    stn: Vec<ConvBlock>,
    conv: ConvBlock,
}

impl XConv {
    /// Create a layer with freshly initialized parameters.
    pub fn new(config: XConvConfig) -> Result<Self, NnError> {
        Self::with_rng(config, &mut rand::rng())
    }

    /// Create a layer drawing the initial parameters from `rng`.
    pub fn with_rng<R: Rng>(config: XConvConfig, rng: &mut R) -> Result<Self, NnError> {
        config.validate()?;
        let k = config.kernel_size;
        let mid = config.mid_channels();
        let bias = config.bias;

        let mlp = vec![
            ConvBlock::new(3, mid, 1, bias, rng),
            ConvBlock::new(mid, mid, 1, bias, rng),
        ];
        let stn = vec![
            ConvBlock::new(3, k * k, k, bias, rng),
            ConvBlock::new(k * k, k * k, 1, bias, rng),
            ConvBlock::plain(k * k, k * k, 1, bias, rng),
        ];
        let conv = ConvBlock::new(config.in_channels + mid, config.out_channels, k, bias, rng);

        Ok(Self {
            config,
            mlp,
            stn,
            conv,
        })
    }

    /// Load a layer from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, NnError> {
        let layer: Self = serde_json::from_str(json)?;
        layer.validate()?;
        Ok(layer)
    }

    /// Serialize the layer, configuration and parameters, to JSON.
    pub fn to_json(&self) -> Result<String, NnError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The layer configuration.
    pub fn config(&self) -> &XConvConfig {
        &self.config
    }

    fn validate(&self) -> Result<(), NnError> {
        self.config.validate()?;
        if self.mlp.len() != 2 || self.stn.len() != 3 {
            return Err(NnError::InvalidConfig(format!(
                "expected 2 embedding and 3 transform blocks, got {} and {}",
                self.mlp.len(),
                self.stn.len()
            )));
        }
        self.mlp
            .iter()
            .chain(self.stn.iter())
            .chain(std::iter::once(&self.conv))
            .try_for_each(ConvBlock::validate)?;

        let k = self.config.kernel_size;
        let mid = self.config.mid_channels();
        self.mlp[0].expect_shape("mlp[0]", 3, mid, 1)?;
        self.mlp[1].expect_shape("mlp[1]", mid, mid, 1)?;
        self.stn[0].expect_shape("stn[0]", 3, k * k, k)?;
        self.stn[1].expect_shape("stn[1]", k * k, k * k, 1)?;
        self.stn[2].expect_shape("stn[2]", k * k, k * k, 1)?;
        self.conv.expect_shape(
            "conv",
            self.config.in_channels + mid,
            self.config.out_channels,
            k,
        )
    }

    /// Aggregate the neighborhood of every query.
    ///
    /// # Arguments
    ///
    /// * `points` - Point set of shape `[B, P, 3]`, with `P >= kernel_size * dilation`.
    /// * `queries` - Query points of shape `[B, Q, 3]`, usually a subset of `points`.
    /// * `features` - Optional features of `points`, shape `[B, P, in_channels]`.
    ///
    /// # Returns
    ///
    /// The queries and their new features of shape `[B, Q, out_channels]`.
    pub fn forward(
        &self,
        points: &Tensor3<f32>,
        queries: &Tensor3<f32>,
        features: Option<&Tensor3<f32>>,
    ) -> Result<(Tensor3<f32>, Tensor3<f32>), NnError> {
        check_coords(points)?;
        check_coords(queries)?;
        let [batch_size, num_points, _] = points.shape;
        let num_queries = queries.shape[1];
        let k = self.config.kernel_size;
        let dilation = self.config.dilation;

        let search_size = self.config.search_size();
        if num_points < search_size {
            return Err(NnError::NotEnoughPoints {
                required: search_size,
                available: num_points,
            });
        }
        self.check_features(points, features)?;

        log::trace!(
            "xconv: points {:?}, queries {:?}, kernel {k}, dilation {dilation}",
            points.shape,
            queries.shape
        );

        // 1. dilated nearest neighbors
        let nearest = knn(points, queries, search_size)?;
        let indices = Tensor3::from_shape_fn([batch_size, num_queries, k], |[b, q, j]| {
            nearest.as_slice()[(b * num_queries + q) * search_size + j * dilation]
        });

        // 2. neighbor offsets to the query, [B, Q, K, 3]
        let mut offsets = gather(points, &indices)?;
        relative_offsets(&mut offsets, queries)?;

        // 3. lift the offsets and append the neighbor features, [B, Q, K, C']
        let groups = batch_size * num_queries;
        let rows = groups * k;
        let embedding = forward_chain(&self.mlp, offsets.as_slice(), rows)?;
        let mut neighborhood = Tensor4::from_shape_vec(
            [batch_size, num_queries, k, self.config.mid_channels()],
            embedding,
        )?;
        if let Some(features) = features {
            let neighbor_features = gather(features, &indices)?;
            neighborhood = concat_channels(&neighborhood, &neighbor_features)?;
        }
        let channels = neighborhood.shape[3];

        // 4. one K x K transform per query, learned from the offsets
        let transform = forward_chain(&self.stn, offsets.as_slice(), groups)?;

        // 5. transform the neighborhood and convolve it into one vector per query
        let mut transformed = vec![0.0; groups * k * channels];
        batched_matmul(
            &transform,
            neighborhood.as_slice(),
            &mut transformed,
            groups,
            k,
            k,
            channels,
        );
        let out = self.conv.forward(&transformed, groups)?;

        let out_channels = self.config.out_channels;
        let out = Tensor3::from_shape_vec([batch_size, num_queries, out_channels], out)?;
        Ok((queries.clone(), out))
    }

    fn check_features(
        &self,
        points: &Tensor3<f32>,
        features: Option<&Tensor3<f32>>,
    ) -> Result<(), NnError> {
        let [batch_size, num_points, _] = points.shape;
        let expected = [batch_size, num_points, self.config.in_channels];
        let actual = features.map_or([batch_size, num_points, 0], |f| f.shape);
        if actual != expected {
            return Err(NnError::ShapeMismatch(expected.to_vec(), actual.to_vec()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::Conv;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn random_cloud(rng: &mut StdRng, batch_size: usize, n: usize) -> Tensor3<f32> {
        let data = (0..batch_size * n * 3)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        Tensor3::from_shape_vec([batch_size, n, 3], data).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(XConvConfig::new(0, 16, 0).validate().is_err());
        assert!(XConvConfig::new(0, 3, 4).validate().is_err());
        let dilated = |in_channels, dilation| {
            XConvConfig::new(in_channels, 16, 4)
                .with_dilation(dilation)
                .validate()
        };
        assert!(dilated(0, 0).is_err());
        assert!(dilated(8, 2).is_ok());
    }

    #[test]
    fn test_forward_shape_without_features() -> Result<(), NnError> {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = XConv::with_rng(XConvConfig::new(0, 16, 4), &mut rng)?;
        let points = random_cloud(&mut rng, 2, 10);
        let queries = random_cloud(&mut rng, 2, 3);

        let (q, x) = layer.forward(&points, &queries, None)?;
        assert_eq!(q, queries);
        assert_eq!(x.shape, [2, 3, 16]);
        // relu output
        assert!(x.as_slice().iter().all(|v| *v >= 0.0));
        Ok(())
    }

    #[test]
    fn test_forward_deterministic() -> Result<(), NnError> {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = XConv::with_rng(XConvConfig::new(2, 8, 3), &mut rng)?;
        let points = random_cloud(&mut rng, 1, 6);
        let features = Tensor3::from_shape_fn([1, 6, 2], |[_, p, c]| (p + c) as f32);

        let (_, a) = layer.forward(&points, &points, Some(&features))?;
        let (_, b) = layer.forward(&points, &points, Some(&features))?;
        assert_eq!(a, b);
        assert_eq!(a.shape, [1, 6, 8]);
        Ok(())
    }

    #[test]
    fn test_forward_requires_dilated_neighborhood() -> Result<(), NnError> {
        let mut rng = StdRng::seed_from_u64(2);
        let layer = XConv::with_rng(XConvConfig::new(0, 8, 3).with_dilation(2), &mut rng)?;
        let points = random_cloud(&mut rng, 1, 5);
        assert!(matches!(
            layer.forward(&points, &points, None),
            Err(NnError::NotEnoughPoints {
                required: 6,
                available: 5
            })
        ));

        let points = random_cloud(&mut rng, 1, 6);
        let (_, x) = layer.forward(&points, &points, None)?;
        assert_eq!(x.shape, [1, 6, 8]);
        Ok(())
    }

    #[test]
    fn test_forward_feature_mismatch() -> Result<(), NnError> {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = XConv::with_rng(XConvConfig::new(4, 8, 2), &mut rng)?;
        let points = random_cloud(&mut rng, 1, 4);
        let features = Tensor3::<f32>::zeros([1, 4, 3]);
        assert!(matches!(
            layer.forward(&points, &points, Some(&features)),
            Err(NnError::ShapeMismatch(..))
        ));
        assert!(matches!(
            layer.forward(&points, &points, None),
            Err(NnError::ShapeMismatch(..))
        ));
        Ok(())
    }

    #[test]
    fn test_json_roundtrip() -> Result<(), NnError> {
        let mut rng = StdRng::seed_from_u64(4);
        let layer = XConv::with_rng(XConvConfig::new(0, 8, 2).with_bias(false), &mut rng)?;
        let restored = XConv::from_json(&layer.to_json()?)?;
        assert_eq!(layer.config(), restored.config());

        let points = random_cloud(&mut rng, 1, 4);
        let (_, a) = layer.forward(&points, &points, None)?;
        let (_, b) = restored.forward(&points, &points, None)?;
        for (a, b) in a.as_slice().iter().zip(b.as_slice()) {
            assert_relative_eq!(a, b, epsilon = 1e-5);
        }
        Ok(())
    }

    fn linear_block(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Result<ConvBlock, NnError> {
        Ok(ConvBlock {
            conv: Conv::from_weights(in_channels, out_channels, kernel_size, weight, bias)?,
            norm: None,
            relu: false,
        })
    }

    fn identity(n: usize) -> Vec<f32> {
        (0..n * n)
            .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
            .collect()
    }

    #[test]
    fn test_forward_hand_weighted() -> Result<(), NnError> {
        let config = XConvConfig::new(1, 4, 2);
        // the embedding keeps the x offset; the transform ignores its input and always
        // yields [[0, 3], [1, 0]]; the final conv copies its 4 inputs
        let layer = XConv {
            config,
            mlp: vec![
                linear_block(3, 1, 1, vec![1.0, 0.0, 0.0], None)?,
                linear_block(1, 1, 1, vec![1.0], None)?,
            ],
            stn: vec![
                linear_block(3, 4, 2, vec![0.0; 24], Some(vec![0.0, 3.0, 1.0, 0.0]))?,
                linear_block(4, 4, 1, identity(4), None)?,
                linear_block(4, 4, 1, identity(4), None)?,
            ],
            conv: linear_block(2, 4, 2, identity(4), None)?,
        };
        layer.validate()?;

        let points = Tensor3::from_shape_vec([1, 2, 3], vec![2.0, 0.0, 0.0, 1.0, 0.0, 0.0])?;
        let queries = Tensor3::from_shape_vec([1, 1, 3], vec![0.0; 3])?;
        let features = Tensor3::from_shape_vec([1, 2, 1], vec![20.0, 10.0])?;

        // neighbors nearest first: point 1 then point 0, each row [embedding, feature]
        //   x = [[1, 10], [2, 20]]
        // T * x with T read row major
        //   [[0, 3], [1, 0]] * x = [[6, 60], [1, 10]]
        let (_, out) = layer.forward(&points, &queries, Some(&features))?;
        assert_eq!(out.shape, [1, 1, 4]);
        for (a, e) in out.as_slice().iter().zip([6.0, 60.0, 1.0, 10.0]) {
            assert_relative_eq!(*a, e);
        }
        Ok(())
    }

    #[test]
    fn test_from_json_rejects_miswired_blocks() -> Result<(), NnError> {
        let mut rng = StdRng::seed_from_u64(5);
        let layer = XConv::with_rng(XConvConfig::new(0, 8, 2), &mut rng)?;
        XConv::from_json(&layer.to_json()?)?;

        // a well formed block whose channels do not chain with the transform
        let mut miswired = layer.clone();
        miswired.stn[2].conv = Conv::from_weights(4, 5, 1, vec![0.0; 20], None)?;
        assert!(matches!(
            XConv::from_json(&miswired.to_json()?),
            Err(NnError::InvalidConfig(_))
        ));

        // same fan in as the expected 2 -> 8 conv over 2 neighbors
        let mut miswired = layer.clone();
        miswired.conv.conv = Conv::from_weights(1, 8, 4, vec![0.0; 32], None)?;
        assert!(matches!(
            XConv::from_json(&miswired.to_json()?),
            Err(NnError::InvalidConfig(_))
        ));

        let mut miswired = layer;
        miswired.mlp[0].conv = Conv::from_weights(2, 2, 1, vec![0.0; 4], None)?;
        assert!(matches!(
            XConv::from_json(&miswired.to_json()?),
            Err(NnError::InvalidConfig(_))
        ));
        Ok(())
    }
}
