#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Point Cloud Layers
//!
//! Inference-mode implementations of two point cloud convolutions:
//!
//! - **XConv**: neighbor convolution with a learned `K x K` spatial transform over the
//!   dilated nearest neighbors of every query.
//! - **SetAbstraction**: ball query grouping (or whole set grouping), shared MLP and max
//!   pooling.
//!
//! All tensors are channels last: points `[B, P, 3]`, queries `[B, Q, 3]`, features
//! `[B, P, C]`. Both layers return the queries together with their new features
//! `[B, Q, C_out]`.
//!
//! ## Example
//!
//! ```rust
//! use lidarnet_nn::{XConv, XConvConfig};
//! use lidarnet_tensor::Tensor3;
//!
//! let layer = XConv::new(XConvConfig::new(0, 16, 4)).unwrap();
//! let points = Tensor3::from_shape_fn([1, 8, 3], |[_, p, c]| (p * 3 + c) as f32 * 0.1);
//!
//! let (_, features) = layer.forward(&points, &points, None).unwrap();
//! assert_eq!(features.shape, [1, 8, 16]);
//! ```

/// Convolution, batch normalization and their composition.
pub mod conv;

/// Error types for the layers.
pub mod error;

/// Matrix product kernels backed by `matrixmultiply`.
pub mod linear;

/// Nearest neighbor and ball queries.
pub mod neighbors;

/// Gather, offset, concatenation and pooling over neighborhoods.
pub mod ops;

/// Set abstraction layer.
pub mod set_abstraction;

/// Neighbor convolution with a learned spatial transform.
pub mod xconv;

pub use crate::conv::{BatchNorm, Conv, ConvBlock};
pub use crate::error::NnError;
pub use crate::set_abstraction::{SetAbstraction, SetAbstractionConfig};
pub use crate::xconv::{XConv, XConvConfig};
