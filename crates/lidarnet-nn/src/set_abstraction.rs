use lidarnet_tensor::{Tensor3, Tensor4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    conv::{forward_chain, ConvBlock},
    error::NnError,
    neighbors::ball_query,
    ops::{check_coords, concat_channels, gather, max_pool_neighbors, relative_offsets},
};

fn default_bias() -> bool {
    true
}

/// Configuration of a [`SetAbstraction`] layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAbstractionConfig {
    /// Channel widths of the shared MLP. The first entry is the input width, 3 plus the
    /// feature channels.
    pub mlp: Vec<usize>,
    /// Ball radius, `None` for the global mode.
    pub radius: Option<f32>,
    /// Neighbors per ball, required in the local mode.
    pub k: Option<usize>,
    /// Whether the convolutions carry a bias.
    #[serde(default = "default_bias")]
    pub bias: bool,
}

impl SetAbstractionConfig {
    /// Local mode: the `k` neighbors within `radius` of every query, biases enabled.
    pub fn local(mlp: Vec<usize>, radius: f32, k: usize) -> Self {
        Self {
            mlp,
            radius: Some(radius),
            k: Some(k),
            bias: default_bias(),
        }
    }

    /// Global mode: the whole point set is pooled into a single vector, biases enabled.
    pub fn global(mlp: Vec<usize>) -> Self {
        Self {
            mlp,
            radius: None,
            k: None,
            bias: default_bias(),
        }
    }

    /// Enable or disable the biases.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Whether the whole point set is pooled at once.
    #[inline]
    pub fn is_global(&self) -> bool {
        self.radius.is_none()
    }

    /// Channels of the output features.
    pub fn out_channels(&self) -> usize {
        self.mlp.last().copied().unwrap_or(0)
    }

    /// Check that the configuration describes a usable layer.
    pub fn validate(&self) -> Result<(), NnError> {
        if self.mlp.len() < 2 {
            return Err(NnError::InvalidConfig(format!(
                "mlp needs an input and at least one output width, got {:?}",
                self.mlp
            )));
        }
        if self.mlp[0] < 3 {
            return Err(NnError::InvalidConfig(format!(
                "the input width includes the 3 coordinates, got {}",
                self.mlp[0]
            )));
        }
        if let Some(radius) = self.radius {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(NnError::InvalidConfig(format!(
                    "radius must be positive, got {radius}"
                )));
            }
            match self.k {
                Some(k) if k > 0 => {}
                _ => {
                    return Err(NnError::InvalidConfig("the local mode needs a positive k".into()));
                }
            }
        }
        Ok(())
    }
}

/// Set abstraction: group, lift with a shared MLP, max pool.
///
/// In the local mode every query pools the relative offsets and features of the points in
/// its ball; in the global mode the raw coordinates and features of the whole set are
/// pooled once and the result is emitted for every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAbstraction {
    config: SetAbstractionConfig,
    mlp: Vec<ConvBlock>,
}

impl SetAbstraction {
    /// Create a layer with freshly initialized parameters.
    pub fn new(config: SetAbstractionConfig) -> Result<Self, NnError> {
        Self::with_rng(config, &mut rand::rng())
    }

    /// Create a layer drawing the initial parameters from `rng`.
    pub fn with_rng<R: Rng>(config: SetAbstractionConfig, rng: &mut R) -> Result<Self, NnError> {
        config.validate()?;
        let mlp = config
            .mlp
            .windows(2)
            .map(|w| ConvBlock::new(w[0], w[1], 1, config.bias, rng))
            .collect();
        Ok(Self { config, mlp })
    }

    /// Load a layer from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, NnError> {
        let layer: Self = serde_json::from_str(json)?;
        layer.config.validate()?;
        if layer.mlp.len() + 1 != layer.config.mlp.len() {
            return Err(NnError::InvalidConfig(format!(
                "expected {} mlp blocks, got {}",
                layer.config.mlp.len() - 1,
                layer.mlp.len()
            )));
        }
        let widths = layer.config.mlp.windows(2);
        for (i, (block, w)) in layer.mlp.iter().zip(widths).enumerate() {
            block.validate()?;
            block.expect_shape(&format!("mlp[{i}]"), w[0], w[1], 1)?;
        }
        Ok(layer)
    }

    /// Serialize the layer, configuration and parameters, to JSON.
    pub fn to_json(&self) -> Result<String, NnError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The layer configuration.
    pub fn config(&self) -> &SetAbstractionConfig {
        &self.config
    }

    /// Pool the neighborhood of every query.
    ///
    /// # Arguments
    ///
    /// * `points` - Point set of shape `[B, P, 3]`.
    /// * `queries` - Query points of shape `[B, Q, 3]`.
    /// * `features` - Optional features of `points`, shape `[B, P, mlp[0] - 3]`.
    ///
    /// # Returns
    ///
    /// The queries and their pooled features of shape `[B, Q, mlp.last()]`.
    pub fn forward(
        &self,
        points: &Tensor3<f32>,
        queries: &Tensor3<f32>,
        features: Option<&Tensor3<f32>>,
    ) -> Result<(Tensor3<f32>, Tensor3<f32>), NnError> {
        check_coords(points)?;
        check_coords(queries)?;
        let [batch_size, num_points, _] = points.shape;
        if num_points == 0 {
            return Err(NnError::NotEnoughPoints {
                required: 1,
                available: 0,
            });
        }
        if queries.shape[0] != batch_size {
            return Err(NnError::ShapeMismatch(
                vec![batch_size, queries.shape[1], 3],
                queries.shape.to_vec(),
            ));
        }
        self.check_features(points, features)?;

        let grouped = match (self.config.radius, self.config.k) {
            (Some(radius), Some(k)) => self.group_local(points, queries, features, radius, k)?,
            _ => self.group_global(points, features)?,
        };
        let [b, groups, k, channels] = grouped.shape;
        log::trace!(
            "set abstraction: grouped {:?}, mlp {:?}",
            grouped.shape,
            self.config.mlp
        );
        debug_assert_eq!(channels, self.config.mlp[0]);

        let lifted = forward_chain(&self.mlp, grouped.as_slice(), b * groups * k)?;
        let lifted = Tensor4::from_shape_vec([b, groups, k, self.config.out_channels()], lifted)?;
        let pooled = max_pool_neighbors(&lifted)?;

        let out = if self.config.is_global() {
            broadcast_rows(&pooled, queries.shape[1])?
        } else {
            pooled
        };
        Ok((queries.clone(), out))
    }

    fn group_local(
        &self,
        points: &Tensor3<f32>,
        queries: &Tensor3<f32>,
        features: Option<&Tensor3<f32>>,
        radius: f32,
        k: usize,
    ) -> Result<Tensor4<f32>, NnError> {
        let indices = ball_query(points, queries, radius, k)?;
        let mut grouped = gather(points, &indices)?;
        relative_offsets(&mut grouped, queries)?;
        match features {
            Some(features) => concat_channels(&grouped, &gather(features, &indices)?),
            None => Ok(grouped),
        }
    }

    fn group_global(
        &self,
        points: &Tensor3<f32>,
        features: Option<&Tensor3<f32>>,
    ) -> Result<Tensor4<f32>, NnError> {
        let [batch_size, num_points, _] = points.shape;
        let grouped = Tensor4::from_shape_slice([batch_size, 1, num_points, 3], points.as_slice())?;
        match features {
            Some(features) => {
                let features = Tensor4::from_shape_slice(
                    [batch_size, 1, num_points, features.shape[2]],
                    features.as_slice(),
                )?;
                concat_channels(&grouped, &features)
            }
            None => Ok(grouped),
        }
    }

    fn check_features(
        &self,
        points: &Tensor3<f32>,
        features: Option<&Tensor3<f32>>,
    ) -> Result<(), NnError> {
        let expected = [points.shape[0], points.shape[1], self.config.mlp[0] - 3];
        let actual = features.map_or([points.shape[0], points.shape[1], 0], |f| f.shape);
        if actual != expected {
            return Err(NnError::ShapeMismatch(expected.to_vec(), actual.to_vec()));
        }
        Ok(())
    }
}

/// Repeat the single row of every batch entry `rows` times, `[B, 1, C] -> [B, rows, C]`.
fn broadcast_rows(pooled: &Tensor3<f32>, rows: usize) -> Result<Tensor3<f32>, NnError> {
    let [batch_size, _, channels] = pooled.shape;
    let mut out = Vec::with_capacity(batch_size * rows * channels);
    for b in 0..batch_size {
        let row = pooled.row(&[b, 0])?;
        for _ in 0..rows {
            out.extend_from_slice(row);
        }
    }
    Ok(Tensor3::from_shape_vec([batch_size, rows, channels], out)?)
}
