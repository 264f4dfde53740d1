use std::{fs, io::Write, path::Path};

use lidarnet_tensor::{Tensor2, Tensor3};

use crate::error::KittiError;

/// Bytes per velodyne record, four little-endian f32.
const POINT_STEP: usize = 16;

/// A velodyne scan: `(x, y, z, intensity)` per point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LidarScan {
    /// The points of the scan.
    pub points: Vec<[f32; 4]>,
}

impl LidarScan {
    /// Create a scan from its points.
    pub fn new(points: Vec<[f32; 4]>) -> Self {
        Self { points }
    }

    /// Get the number of points in the scan.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the scan is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate over the `(x, y, z)` coordinates.
    pub fn xyz(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        self.points.iter().map(|&[x, y, z, _]| [x, y, z])
    }

    /// Iterate over the intensities.
    pub fn intensities(&self) -> impl Iterator<Item = f32> + '_ {
        self.points.iter().map(|p| p[3])
    }

    /// The scan as an `[N, 4]` tensor.
    pub fn to_tensor(&self) -> Result<Tensor2<f32>, KittiError> {
        let data = self.points.iter().flatten().copied().collect();
        Ok(Tensor2::from_shape_vec([self.len(), 4], data)?)
    }

    /// The coordinates as a batch of one point set, `[1, N, 3]`.
    pub fn to_coords_tensor(&self) -> Result<Tensor3<f32>, KittiError> {
        let data = self.xyz().flatten().collect();
        Ok(Tensor3::from_shape_vec([1, self.len(), 3], data)?)
    }
}

/// Read a KITTI velodyne `.bin` file.
///
/// # Arguments
///
/// * `path` - The path to the binary file of little-endian f32 `(x, y, z, intensity)`
///   records.
///
/// # Returns
///
/// The scan, one point per record.
pub fn read_velodyne(path: impl AsRef<Path>) -> Result<LidarScan, KittiError> {
    let bytes = fs::read(path)?;
    decode_velodyne(&bytes)
}

/// Decode the raw bytes of a velodyne file.
pub fn decode_velodyne(bytes: &[u8]) -> Result<LidarScan, KittiError> {
    if bytes.len() % POINT_STEP != 0 {
        return Err(KittiError::InvalidPointCloudSize(bytes.len()));
    }

    let points = bytes
        .chunks_exact(POINT_STEP)
        .map(|record| {
            std::array::from_fn(|i| {
                let mut value = [0u8; 4];
                value.copy_from_slice(&record[4 * i..4 * i + 4]);
                f32::from_le_bytes(value)
            })
        })
        .collect();

    Ok(LidarScan { points })
}

/// Write a scan in the velodyne `.bin` format.
pub fn write_velodyne(path: impl AsRef<Path>, scan: &LidarScan) -> Result<(), KittiError> {
    let mut bytes = Vec::with_capacity(scan.len() * POINT_STEP);
    for value in scan.points.iter().flatten() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let mut file = fs::File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_velodyne() -> Result<(), KittiError> {
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 0.5, -1.0, -2.0, -3.0, 0.25] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let scan = decode_velodyne(&bytes)?;
        assert_eq!(
            scan.points,
            vec![[1.0, 2.0, 3.0, 0.5], [-1.0, -2.0, -3.0, 0.25]]
        );
        Ok(())
    }

    #[test]
    fn test_decode_velodyne_truncated() {
        let bytes = vec![0u8; 20];
        assert!(matches!(
            decode_velodyne(&bytes),
            Err(KittiError::InvalidPointCloudSize(20))
        ));
    }

    #[test]
    fn test_velodyne_file_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000000.bin");
        let scan = LidarScan::new(vec![[0.1, 0.2, 0.3, 0.4], [5.0, 6.0, 7.0, 0.0]]);
        write_velodyne(&path, &scan)?;
        assert_eq!(std::fs::metadata(&path)?.len(), 32);
        assert_eq!(read_velodyne(&path)?, scan);
        Ok(())
    }

    #[test]
    fn test_scan_tensors() -> Result<(), KittiError> {
        let scan = LidarScan::new(vec![[1.0, 2.0, 3.0, 0.5], [4.0, 5.0, 6.0, 0.7]]);
        let tensor = scan.to_tensor()?;
        assert_eq!(tensor.shape, [2, 4]);
        assert_eq!(tensor.get([1, 3]), Some(&0.7));

        let coords = scan.to_coords_tensor()?;
        assert_eq!(coords.shape, [1, 2, 3]);
        assert_eq!(coords.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        Ok(())
    }
}
