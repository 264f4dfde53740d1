use std::{fmt::Write as _, fs, path::Path};

use faer::Mat;
use serde::{Deserialize, Serialize};

use crate::{error::KittiError, velodyne::LidarScan};

/// Labels of the seven calibration lines, in file order.
const LABELS: [&str; 7] = [
    "P0:",
    "P1:",
    "P2:",
    "P3:",
    "R0_rect:",
    "Tr_velo_to_cam:",
    "Tr_imu_to_velo:",
];

/// The calibration of one KITTI frame.
///
/// All matrices are row-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Projection matrix of the left gray camera.
    pub p0: [[f64; 4]; 3],
    /// Projection matrix of the right gray camera.
    pub p1: [[f64; 4]; 3],
    /// Projection matrix of the left color camera.
    pub p2: [[f64; 4]; 3],
    /// Projection matrix of the right color camera.
    pub p3: [[f64; 4]; 3],
    /// Rectifying rotation of the reference camera.
    pub r0: [[f64; 3]; 3],
    /// Rigid transform from the velodyne to the reference camera.
    pub velo_to_cam: [[f64; 4]; 3],
    /// Rigid transform from the IMU to the velodyne.
    pub imu_to_velo: [[f64; 4]; 3],
}

impl Calibration {
    /// Identity calibration: zero-translation identity transforms and projections.
    pub fn identity() -> Self {
        let eye34 = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        Self {
            p0: eye34,
            p1: eye34,
            p2: eye34,
            p3: eye34,
            r0: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            velo_to_cam: eye34,
            imu_to_velo: eye34,
        }
    }

    /// Serialize into the seven line calibration text format.
    pub fn to_calib_string(&self) -> String {
        let rows: [Vec<&f64>; 7] = [
            self.p0.iter().flatten().collect(),
            self.p1.iter().flatten().collect(),
            self.p2.iter().flatten().collect(),
            self.p3.iter().flatten().collect(),
            self.r0.iter().flatten().collect(),
            self.velo_to_cam.iter().flatten().collect(),
            self.imu_to_velo.iter().flatten().collect(),
        ];

        let mut out = String::new();
        for (label, values) in LABELS.iter().zip(rows) {
            out.push_str(label);
            for v in values {
                // writing into a String cannot fail
                let _ = write!(out, " {v:e}");
            }
            out.push('\n');
        }
        out
    }

    /// The velodyne to rectified camera transform, `R0 * velo_to_cam`.
    pub fn velo_to_rect(&self) -> [[f64; 4]; 3] {
        let (r0, tr) = (&self.r0, &self.velo_to_cam);
        std::array::from_fn(|i| std::array::from_fn(|j| (0..3).map(|k| r0[i][k] * tr[k][j]).sum()))
    }
}

// parse the first N floats after the label of a line
fn parse_values<const N: usize>(line: &str, line_no: usize) -> Result<[f64; N], KittiError> {
    let mut tokens = line.split_whitespace().skip(1);
    let mut values = [0.0; N];
    for (i, value) in values.iter_mut().enumerate() {
        let token = tokens.next().ok_or_else(|| {
            KittiError::ParseError(format!(
                "calibration line {line_no}: expected {N} values, got {i}"
            ))
        })?;
        *value = token.parse().map_err(|e| {
            KittiError::ParseError(format!("calibration line {line_no}: {token}: {e}"))
        })?;
    }
    Ok(values)
}

fn rows<const C: usize>(values: &[f64]) -> [[f64; C]; 3] {
    std::array::from_fn(|i| std::array::from_fn(|j| values[i * C + j]))
}

/// Parse the text of a calibration file.
///
/// Every line starts with a label followed by the matrix entries in row-major order. Only
/// the first 12 values (9 for `R0_rect`) of a line are used; trailing values are ignored.
pub fn parse_calibration(text: &str) -> Result<Calibration, KittiError> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < LABELS.len() {
        return Err(KittiError::ParseError(format!(
            "calibration: expected {} lines, got {}",
            LABELS.len(),
            lines.len()
        )));
    }

    let matrix34 = |i: usize| -> Result<[[f64; 4]; 3], KittiError> {
        Ok(rows(&parse_values::<12>(lines[i], i)?))
    };

    Ok(Calibration {
        p0: matrix34(0)?,
        p1: matrix34(1)?,
        p2: matrix34(2)?,
        p3: matrix34(3)?,
        r0: rows(&parse_values::<9>(lines[4], 4)?),
        velo_to_cam: matrix34(5)?,
        imu_to_velo: matrix34(6)?,
    })
}

/// Read a calibration file.
///
/// # Arguments
///
/// * `path` - The path to the `calib/{id:06}.txt` file.
pub fn read_calibration(path: impl AsRef<Path>) -> Result<Calibration, KittiError> {
    let text = fs::read_to_string(path)?;
    parse_calibration(&text)
}

/// Express a velodyne scan in the rectified camera frame.
///
/// Every point `(x, y, z)` is mapped to `R0 * velo_to_cam * (x, y, z, 1)`. The number of
/// points and their intensities are preserved.
///
/// # Example
///
/// ```
/// use lidarnet_kitti::{rectify, Calibration, LidarScan};
///
/// let scan = LidarScan::new(vec![[1.0, 2.0, 3.0, 0.5]]);
/// let rectified = rectify(&scan, &Calibration::identity());
/// assert_eq!(rectified, scan);
/// ```
pub fn rectify(scan: &LidarScan, calib: &Calibration) -> LidarScan {
    let n = scan.len();
    if n == 0 {
        return LidarScan::default();
    }

    let velo_to_rect = calib.velo_to_rect();
    let rect = Mat::<f64>::from_fn(3, 4, |i, j| velo_to_rect[i][j]);

    // homogeneous points, one per column
    let xyzw = Mat::<f64>::from_fn(4, n, |i, j| {
        if i == 3 {
            1.0
        } else {
            scan.points[j][i] as f64
        }
    });

    let mut xyz = Mat::<f64>::zeros(3, n);
    let mut xyz_mut = xyz.as_mut();
    faer::linalg::matmul::matmul(
        &mut xyz_mut,
        rect.as_ref(),
        xyzw.as_ref(),
        None,
        1.0,
        faer::Parallelism::None,
    );

    let points = scan
        .points
        .iter()
        .enumerate()
        .map(|(j, p)| {
            [
                xyz.read(0, j) as f32,
                xyz.read(1, j) as f32,
                xyz.read(2, j) as f32,
                p[3],
            ]
        })
        .collect();

    LidarScan { points }
}
