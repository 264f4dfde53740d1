#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # KITTI Detection Frames
//!
//! Readers for the files of the KITTI 3d object detection benchmark and a dataset that
//! assembles them into per-frame samples:
//!
//! - **Calibration**: camera projections, rectifying rotation and sensor transforms.
//! - **Velodyne**: `(x, y, z, intensity)` scans, optionally rectified into the camera frame.
//! - **Labels**: per-object class, 2d box and 3d box.
//!
//! ```no_run
//! use lidarnet_kitti::{KittiDetection, Split};
//!
//! let dataset = KittiDetection::new("data/KITTI", Split::Train, true)?;
//! for sample in dataset.iter() {
//!     let (inputs, target) = sample?;
//!     println!("{} points, {:?} objects", inputs.lidar.len(), target.map(|t| t.len()));
//! }
//! # Ok::<(), lidarnet_kitti::KittiError>(())
//! ```

/// Calibration parsing and velodyne rectification.
pub mod calibration;

/// Dataset enumeration and indexing.
pub mod dataset;

/// Error types for the loader.
pub mod error;

/// Color image handles and png decoding.
pub mod image;

/// Label parsing and 3d box geometry.
pub mod label;

/// Velodyne scans.
pub mod velodyne;

pub use crate::calibration::{parse_calibration, read_calibration, rectify, Calibration};
pub use crate::dataset::{FrameInputs, KittiDetection, Sample, Split, Transform};
pub use crate::error::KittiError;
pub use crate::image::{read_image_png_rgb8, FrameImage, RgbImage};
pub use crate::label::{parse_labels, read_labels, Annotation, AnnotationSet, DONT_CARE};
pub use crate::velodyne::{decode_velodyne, read_velodyne, write_velodyne, LidarScan};
