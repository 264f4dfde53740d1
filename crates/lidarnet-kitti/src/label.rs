use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::KittiError;

/// Class name of the regions annotators marked as ignored.
pub const DONT_CARE: &str = "DontCare";

/// Number of fields of a label line.
const LABEL_FIELDS: usize = 15;

/// One labeled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Object class, e.g. `Car`, `Pedestrian` or `DontCare`.
    pub class: String,
    /// Fraction of the object leaving the image, from 0 to 1.
    pub truncated: f32,
    /// Occlusion state: 0 visible, 1 partly occluded, 2 largely occluded, 3 unknown.
    pub occluded: i32,
    /// Observation angle in radians.
    pub alpha: f32,
    /// 2d box in the left color image, `[left, top, right, bottom]` pixels.
    pub bbox: [f32; 4],
    /// 3d box size `[height, width, length]` in meters.
    pub size: [f32; 3],
    /// Bottom face center of the 3d box in the camera frame.
    pub center: [f32; 3],
    /// Rotation around the camera y axis in radians.
    pub yaw: f32,
}

impl Annotation {
    /// Whether the annotation marks an ignored region.
    pub fn is_dont_care(&self) -> bool {
        self.class == DONT_CARE
    }

    /// The eight corners of the 3d box in the camera frame.
    ///
    /// The first four corners lie on the bottom face, the last four on the top face, both
    /// in the same winding order.
    pub fn corners(&self) -> [[f32; 3]; 8] {
        let [h, w, l] = self.size;
        let (hl, hw) = (l / 2.0, w / 2.0);
        let x = [hl, hl, -hl, -hl, hl, hl, -hl, -hl];
        let y = [0.0, 0.0, 0.0, 0.0, -h, -h, -h, -h];
        let z = [hw, -hw, -hw, hw, hw, -hw, -hw, hw];

        // rotation around the y axis
        let (s, c) = self.yaw.sin_cos();
        std::array::from_fn(|i| {
            [
                c * x[i] + s * z[i] + self.center[0],
                y[i] + self.center[1],
                -s * x[i] + c * z[i] + self.center[2],
            ]
        })
    }

    /// Axis aligned bounds `(min, max)` of the 3d box corners.
    pub fn axis_aligned_bounds(&self) -> ([f32; 3], [f32; 3]) {
        self.corners().iter().fold(
            ([f32::INFINITY; 3], [f32::NEG_INFINITY; 3]),
            |(mut min, mut max), corner| {
                for i in 0..3 {
                    min[i] = min[i].min(corner[i]);
                    max[i] = max[i].max(corner[i]);
                }
                (min, max)
            },
        )
    }
}

/// The labels of one frame, one entry per object in every field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSet {
    /// Object classes.
    pub class: Vec<String>,
    /// Truncation fractions.
    pub truncated: Vec<f32>,
    /// Occlusion states.
    pub occluded: Vec<i32>,
    /// Observation angles.
    pub alpha: Vec<f32>,
    /// 2d boxes.
    pub bbox: Vec<[f32; 4]>,
    /// 3d box sizes `[height, width, length]`.
    pub size: Vec<[f32; 3]>,
    /// 3d box bottom centers.
    pub center: Vec<[f32; 3]>,
    /// Rotations around the camera y axis.
    pub yaw: Vec<f32>,
}

impl AnnotationSet {
    /// Append an object.
    pub fn push(&mut self, annotation: Annotation) {
        self.class.push(annotation.class);
        self.truncated.push(annotation.truncated);
        self.occluded.push(annotation.occluded);
        self.alpha.push(annotation.alpha);
        self.bbox.push(annotation.bbox);
        self.size.push(annotation.size);
        self.center.push(annotation.center);
        self.yaw.push(annotation.yaw);
    }

    /// Number of objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.class.len()
    }

    /// Whether the frame has no objects.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.class.is_empty()
    }

    /// The object at `index`.
    pub fn get(&self, index: usize) -> Option<Annotation> {
        Some(Annotation {
            class: self.class.get(index)?.clone(),
            truncated: *self.truncated.get(index)?,
            occluded: *self.occluded.get(index)?,
            alpha: *self.alpha.get(index)?,
            bbox: *self.bbox.get(index)?,
            size: *self.size.get(index)?,
            center: *self.center.get(index)?,
            yaw: *self.yaw.get(index)?,
        })
    }

    /// Iterate over all objects.
    pub fn iter(&self) -> impl Iterator<Item = Annotation> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }

    /// Iterate over the objects that are not `DontCare` regions.
    pub fn objects(&self) -> impl Iterator<Item = Annotation> + '_ {
        self.iter().filter(|a| !a.is_dont_care())
    }
}

impl FromIterator<Annotation> for AnnotationSet {
    fn from_iter<I: IntoIterator<Item = Annotation>>(iter: I) -> Self {
        let mut set = Self::default();
        iter.into_iter().for_each(|a| set.push(a));
        set
    }
}

fn parse_part<T: std::str::FromStr>(
    token: &str,
    field: &str,
    line_no: usize,
) -> Result<T, KittiError>
where
    T::Err: std::fmt::Display,
{
    token.parse().map_err(|e| {
        KittiError::ParseError(format!("label line {line_no}: {field} {token}: {e}"))
    })
}

fn parse_array<const N: usize>(
    tokens: &[&str],
    field: &str,
    line_no: usize,
) -> Result<[f32; N], KittiError> {
    let mut values = [0.0; N];
    for (value, token) in values.iter_mut().zip(tokens) {
        *value = parse_part(token, field, line_no)?;
    }
    Ok(values)
}

fn parse_label_line(line: &str, line_no: usize) -> Result<Annotation, KittiError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < LABEL_FIELDS {
        return Err(KittiError::ParseError(format!(
            "label line {line_no}: expected {LABEL_FIELDS} fields, got {}",
            tokens.len()
        )));
    }

    Ok(Annotation {
        class: tokens[0].to_string(),
        truncated: parse_part(tokens[1], "truncated", line_no)?,
        occluded: parse_part(tokens[2], "occluded", line_no)?,
        alpha: parse_part(tokens[3], "alpha", line_no)?,
        bbox: parse_array(&tokens[4..8], "bbox", line_no)?,
        size: parse_array(&tokens[8..11], "size", line_no)?,
        center: parse_array(&tokens[11..14], "center", line_no)?,
        yaw: parse_part(tokens[14], "yaw", line_no)?,
    })
}

/// Parse the text of a label file, one object per non-empty line.
///
/// Fields after the fifteenth, such as a detection score, are ignored.
///
/// # Example
///
/// ```
/// use lidarnet_kitti::parse_labels;
///
/// let labels = parse_labels("Car 0.0 0 -1.5 10 20 30 40 1.5 1.6 3.8 1.0 1.0 5.0 1.57\n").unwrap();
/// assert_eq!(labels.len(), 1);
/// assert_eq!(labels.class[0], "Car");
/// assert_eq!(labels.size[0], [1.5, 1.6, 3.8]);
/// ```
pub fn parse_labels(text: &str) -> Result<AnnotationSet, KittiError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_no, line)| parse_label_line(line, line_no))
        .collect()
}

/// Read a label file.
///
/// # Arguments
///
/// * `path` - The path to the `label_2/{id:06}.txt` file.
pub fn read_labels(path: impl AsRef<Path>) -> Result<AnnotationSet, KittiError> {
    let text = fs::read_to_string(path)?;
    parse_labels(&text)
}
