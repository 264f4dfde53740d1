use std::path::PathBuf;

use lidarnet_tensor::TensorError;

/// An error type for the KITTI loader.
#[derive(thiserror::Error, Debug)]
pub enum KittiError {
    /// Error reading a file or listing a directory.
    #[error("Failed to manipulate the file. {0}")]
    Io(#[from] std::io::Error),

    /// A required split directory does not exist.
    #[error("Dataset not found or corrupted: missing {0}")]
    DatasetNotFound(PathBuf),

    /// Malformed calibration or label text.
    #[error("Parse error {0}")]
    ParseError(String),

    /// The velodyne file does not hold a whole number of `(x, y, z, intensity)` records.
    #[error("Invalid point cloud size: {0} bytes is not a multiple of 16")]
    InvalidPointCloudSize(usize),

    /// Frame index past the end of the split.
    #[error("Index {index} out of bounds for a split of {len} frames")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of frames in the split.
        len: usize,
    },

    /// Error to decode the PNG image.
    #[error("Failed to decode the png image. {0}")]
    PngDecodeError(String),

    /// Tensor error
    #[error("Error with the tensor: {0}")]
    TensorError(#[from] TensorError),
}
