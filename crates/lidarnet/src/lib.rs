#![doc = include_str!(concat!("../", env!("CARGO_PKG_README")))]

#[doc(inline)]
pub use lidarnet_tensor as tensor;

#[doc(inline)]
pub use lidarnet_nn as nn;

#[doc(inline)]
pub use lidarnet_kitti as kitti;
