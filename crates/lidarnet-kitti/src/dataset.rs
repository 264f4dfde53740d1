use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    calibration::{read_calibration, rectify, Calibration},
    error::KittiError,
    image::FrameImage,
    label::{read_labels, AnnotationSet},
    velodyne::{read_velodyne, LidarScan},
};

const IMAGE_DIR: &str = "image_2";
const LIDAR_DIR: &str = "velodyne";
const LABEL_DIR: &str = "label_2";
const CALIB_DIR: &str = "calib";

/// Subset of the KITTI detection benchmark.
///
/// `Train` and `Val` both read the labeled `training` directory; `Test` reads the
/// unlabeled `testing` directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Labeled training frames.
    #[default]
    Train,
    /// Labeled frames held out for validation.
    Val,
    /// Unlabeled test frames.
    Test,
}

impl Split {
    /// Name of the directory holding the frames of the split.
    pub fn directory(&self) -> &'static str {
        match self {
            Split::Train | Split::Val => "training",
            Split::Test => "testing",
        }
    }

    /// Whether the split comes with labels.
    pub fn has_labels(&self) -> bool {
        self.directory() == "training"
    }
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            _ => Err(format!("unknown split {s}, expected train, val or test")),
        }
    }
}

/// The inputs of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInputs {
    /// The left color image.
    pub image: FrameImage,
    /// The velodyne scan, in the rectified camera frame if the dataset is rectified.
    pub lidar: LidarScan,
    /// The frame calibration.
    pub calib: Calibration,
}

/// A frame and its labels, `None` for the test split.
pub type Sample = (FrameInputs, Option<AnnotationSet>);

/// A function applied to every sample before it is returned.
pub type Transform = Box<dyn Fn(FrameInputs, Option<AnnotationSet>) -> Sample + Send + Sync>;

/// The KITTI 3d object detection dataset.
///
/// Expects the benchmark layout:
///
/// ```text
/// root/
///   training/{image_2, velodyne, calib, label_2}/
///   testing/{image_2, velodyne, calib}/
/// ```
///
/// Frames are the `velodyne/{id:06}.bin` files, sorted by id. Samples are read from disk on
/// every access.
pub struct KittiDetection {
    split: Split,
    split_dir: PathBuf,
    rectified: bool,
    frame_ids: Vec<u32>,
    transform: Option<Transform>,
}

impl fmt::Debug for KittiDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KittiDetection")
            .field("split", &self.split)
            .field("split_dir", &self.split_dir)
            .field("rectified", &self.rectified)
            .field("len", &self.frame_ids.len())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

// `{6 digits}.bin`
fn parse_frame_id(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".bin")?;
    if stem.len() != 6 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

impl KittiDetection {
    /// Open a split of the dataset.
    ///
    /// # Arguments
    ///
    /// * `root` - The directory holding `training/` and `testing/`.
    /// * `split` - The subset to read.
    /// * `rectified` - Whether to express the velodyne scans in the rectified camera frame.
    ///
    /// # Errors
    ///
    /// Returns [`KittiError::DatasetNotFound`] if one of the split directories is missing.
    pub fn new(root: impl AsRef<Path>, split: Split, rectified: bool) -> Result<Self, KittiError> {
        let split_dir = root.as_ref().join(split.directory());

        let mut required = vec![IMAGE_DIR, CALIB_DIR, LIDAR_DIR];
        if split.has_labels() {
            required.push(LABEL_DIR);
        }
        for dir in required {
            let path = split_dir.join(dir);
            if !path.is_dir() {
                return Err(KittiError::DatasetNotFound(path));
            }
        }

        let mut frame_ids = Vec::new();
        for entry in std::fs::read_dir(split_dir.join(LIDAR_DIR))? {
            let file_name = entry?.file_name();
            match file_name.to_str().and_then(parse_frame_id) {
                Some(id) => frame_ids.push(id),
                None => log::debug!("skipping {:?}: not a frame", file_name),
            }
        }
        frame_ids.sort_unstable();

        log::info!(
            "opened {} with {} frames",
            split_dir.display(),
            frame_ids.len()
        );

        Ok(Self {
            split,
            split_dir,
            rectified,
            frame_ids,
            transform: None,
        })
    }

    /// Apply `transform` to every sample before it is returned.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(FrameInputs, Option<AnnotationSet>) -> Sample + Send + Sync + 'static,
    {
        self.transform = Some(Box::new(transform));
        self
    }

    /// The split of the dataset.
    pub fn split(&self) -> Split {
        self.split
    }

    /// Whether the velodyne scans are rectified.
    pub fn rectified(&self) -> bool {
        self.rectified
    }

    /// Number of frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.frame_ids.len()
    }

    /// Whether the split has no frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frame_ids.is_empty()
    }

    /// The sorted frame ids.
    pub fn frame_ids(&self) -> &[u32] {
        &self.frame_ids
    }

    /// The sample at `index`, 0-based in frame id order.
    pub fn get(&self, index: usize) -> Result<Sample, KittiError> {
        let frame_id = *self
            .frame_ids
            .get(index)
            .ok_or(KittiError::IndexOutOfBounds {
                index,
                len: self.len(),
            })?;
        self.load_frame(frame_id)
    }

    /// Iterate over all samples in frame id order.
    pub fn iter(&self) -> impl Iterator<Item = Result<Sample, KittiError>> + '_ {
        self.frame_ids.iter().map(|&id| self.load_frame(id))
    }

    /// The sample of frame `frame_id`.
    pub fn load_frame(&self, frame_id: u32) -> Result<Sample, KittiError> {
        let image = self.read_image(frame_id);
        let calib = self.read_calib(frame_id)?;
        let mut lidar = self.read_lidar(frame_id)?;
        let target = if self.split.has_labels() {
            Some(self.read_label(frame_id)?)
        } else {
            None
        };

        if self.rectified {
            lidar = rectify(&lidar, &calib);
        }

        log::debug!(
            "loaded frame {frame_id:06}: {} points, {} objects",
            lidar.len(),
            target.as_ref().map_or(0, AnnotationSet::len)
        );

        let inputs = FrameInputs {
            image,
            lidar,
            calib,
        };
        Ok(match &self.transform {
            Some(transform) => transform(inputs, target),
            None => (inputs, target),
        })
    }

    fn frame_path(&self, dir: &str, frame_id: u32, extension: &str) -> PathBuf {
        self.split_dir
            .join(dir)
            .join(format!("{frame_id:06}.{extension}"))
    }

    /// The left color image of a frame.
    pub fn read_image(&self, frame_id: u32) -> FrameImage {
        FrameImage::new(self.frame_path(IMAGE_DIR, frame_id, "png"))
    }

    /// The raw velodyne scan of a frame, never rectified.
    pub fn read_lidar(&self, frame_id: u32) -> Result<LidarScan, KittiError> {
        read_velodyne(self.frame_path(LIDAR_DIR, frame_id, "bin"))
    }

    /// The calibration of a frame.
    pub fn read_calib(&self, frame_id: u32) -> Result<Calibration, KittiError> {
        read_calibration(self.frame_path(CALIB_DIR, frame_id, "txt"))
    }

    /// The labels of a frame.
    pub fn read_label(&self, frame_id: u32) -> Result<AnnotationSet, KittiError> {
        read_labels(self.frame_path(LABEL_DIR, frame_id, "txt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_id() {
        assert_eq!(parse_frame_id("000042.bin"), Some(42));
        assert_eq!(parse_frame_id("007481.bin"), Some(7481));
        assert_eq!(parse_frame_id("00042.bin"), None);
        assert_eq!(parse_frame_id("0000042.bin"), None);
        assert_eq!(parse_frame_id("00004a.bin"), None);
        assert_eq!(parse_frame_id("000042.txt"), None);
        assert_eq!(parse_frame_id("000042.bin.bak"), None);
    }

    #[test]
    fn test_split() {
        assert_eq!(Split::Train.directory(), "training");
        assert_eq!(Split::Val.directory(), "training");
        assert_eq!(Split::Test.directory(), "testing");
        assert!(!Split::Test.has_labels());
        assert_eq!("val".parse::<Split>(), Ok(Split::Val));
        assert!("trainval".parse::<Split>().is_err());
    }
}
