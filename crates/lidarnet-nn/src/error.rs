use lidarnet_tensor::TensorError;
use thiserror::Error;

/// An error type for the neural network layers.
#[derive(Error, Debug)]
pub enum NnError {
    /// Shape mismatch between the expected and the provided tensors.
    #[error("Shape mismatch: {0:?} != {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    /// The point set is too small for the requested neighborhood.
    #[error("Not enough points: the neighborhood requires {required} points but only {available} are available")]
    NotEnoughPoints {
        /// Number of points the query needs.
        required: usize,
        /// Number of points in the point set.
        available: usize,
    },

    /// The layer configuration is not valid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor error
    #[error("Error with the tensor: {0}")]
    TensorError(#[from] TensorError),

    /// Error (de)serializing layer parameters.
    #[error("Failed to (de)serialize the layer parameters. {0}")]
    SerdeError(#[from] serde_json::Error),
}
