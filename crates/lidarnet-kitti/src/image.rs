use std::{
    fs,
    path::{Path, PathBuf},
};

use png::{ColorType, Decoder, Transformations};

use crate::error::KittiError;

/// The left color image of a frame, `image_2/{id:06}.png`.
///
/// The image is only resolved, not read: decoding is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameImage {
    path: PathBuf,
}

impl FrameImage {
    /// Create a handle to the image at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path to the png file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the image into 8-bit RGB.
    pub fn decode_rgb8(&self) -> Result<RgbImage, KittiError> {
        read_image_png_rgb8(&self.path)
    }
}

/// An 8-bit RGB image, row-major and interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Pixel data, `height * width * 3` bytes.
    pub data: Vec<u8>,
}

impl RgbImage {
    /// The pixel at column `x` and row `y`.
    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y * self.width + x) * 3;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }
}

/// Read a png file as 8-bit RGB.
///
/// Palette and 16-bit images are reduced to 8 bits, gray images are replicated to the three
/// channels and the alpha channel is dropped.
///
/// # Arguments
///
/// * `file_path` - The path to the png file.
pub fn read_image_png_rgb8(file_path: impl AsRef<Path>) -> Result<RgbImage, KittiError> {
    let file = fs::File::open(file_path)?;
    let mut decoder = Decoder::new(file);
    decoder.set_transformations(Transformations::EXPAND | Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| KittiError::PngDecodeError(e.to_string()))?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| KittiError::PngDecodeError(e.to_string()))?;
    buf.truncate(info.buffer_size());

    let channels = match info.color_type {
        ColorType::Rgb => 3,
        ColorType::Rgba => 4,
        ColorType::Grayscale => 1,
        ColorType::GrayscaleAlpha => 2,
        ColorType::Indexed => {
            return Err(KittiError::PngDecodeError("palette was not expanded".to_string()));
        }
    };

    let data = match channels {
        3 => buf,
        4 => buf
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect(),
        _ => buf
            .chunks_exact(channels)
            .flat_map(|p| [p[0], p[0], p[0]])
            .collect(),
    };

    Ok(RgbImage {
        width: info.width as usize,
        height: info.height as usize,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use png::{BitDepth, Encoder};

    fn write_png(
        path: &Path,
        width: u32,
        height: u32,
        color_type: ColorType,
        data: &[u8],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let file = fs::File::create(path)?;
        let mut encoder = Encoder::new(file, width, height);
        encoder.set_color(color_type);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(data)?;
        Ok(())
    }

    #[test]
    fn test_decode_rgb8() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("000000.png");
        let data: Vec<u8> = (0..2 * 3 * 3).collect();
        write_png(&path, 3, 2, ColorType::Rgb, &data)?;

        let image = FrameImage::new(&path).decode_rgb8()?;
        assert_eq!((image.width, image.height), (3, 2));
        assert_eq!(image.data, data);
        assert_eq!(image.pixel(1, 1), Some([12, 13, 14]));
        assert_eq!(image.pixel(3, 0), None);
        Ok(())
    }

    #[test]
    fn test_decode_gray_and_rgba() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;

        let gray = dir.path().join("gray.png");
        write_png(&gray, 2, 1, ColorType::Grayscale, &[7, 200])?;
        let image = read_image_png_rgb8(&gray)?;
        assert_eq!(image.data, vec![7, 7, 7, 200, 200, 200]);

        let rgba = dir.path().join("rgba.png");
        write_png(&rgba, 1, 1, ColorType::Rgba, &[1, 2, 3, 4])?;
        assert_eq!(read_image_png_rgb8(&rgba)?.data, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_decode_invalid_png() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not a png")?;
        assert!(matches!(
            FrameImage::new(&path).decode_rgb8(),
            Err(KittiError::PngDecodeError(_))
        ));
        Ok(())
    }
}
