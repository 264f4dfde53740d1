#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `lidarnet-tensor` provides a small owned, row-major, n-dimensional array used to move
//! point clouds, neighbor indices and per-point features between the loader and the
//! neural network layers.
//!
//! ```rust
//! use lidarnet_tensor::Tensor2;
//!
//! let points =
//!     Tensor2::<f32>::from_shape_vec([2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
//! assert_eq!(points.get([1, 2]), Some(&5.0));
//!
//! let batched = points.reshape([1, 2, 3]).unwrap();
//! assert_eq!(batched.shape, [1, 2, 3]);
//! ```

/// Tensor module containing the main tensor implementation and error types.
pub mod tensor;

pub use crate::tensor::{get_strides_from_shape, Tensor, TensorError};

/// Type alias for a 1-dimensional tensor.
pub type Tensor1<T> = Tensor<T, 1>;

/// Type alias for a 2-dimensional tensor.
pub type Tensor2<T> = Tensor<T, 2>;

/// Type alias for a 3-dimensional tensor.
pub type Tensor3<T> = Tensor<T, 3>;

/// Type alias for a 4-dimensional tensor.
pub type Tensor4<T> = Tensor<T, 4>;
