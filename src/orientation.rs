use std::io::Cursor;

use exif::{In, Reader, Tag, Value};
use image::DynamicImage;
use log::debug;

/// Orientation tag of a JPEG's primary IFD, if present and well formed.
pub fn read_orientation(data: &[u8]) -> Option<u16> {
    let exif = match Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif) => exif,
        Err(e) => {
            debug!("读取EXIF信息失败: {}", e);
            return None;
        }
    };

    let field = exif.get_field(Tag::Orientation, In::PRIMARY)?;
    match field.value {
        Value::Short(ref values) if !values.is_empty() => Some(values[0]),
        _ => {
            debug!("EXIF方向信息格式不正确");
            None
        }
    }
}

/// Rotates/flips so the pixels are upright. Unknown values are ignored.
pub fn apply_orientation(image: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Reads the orientation from `data` and applies it. Returns whether the
/// image was transformed.
pub fn normalize(image: DynamicImage, data: &[u8]) -> (DynamicImage, bool) {
    match read_orientation(data) {
        Some(orientation) if (2..=8).contains(&orientation) => {
            debug!("应用EXIF方向校正: {}", orientation);
            (apply_orientation(image, orientation), true)
        }
        _ => (image, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};

    fn two_by_one() -> DynamicImage {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        DynamicImage::ImageRgb8(img)
    }

    fn jpeg_with_orientation(orientation: u8) -> Vec<u8> {
        let mut jpeg = Vec::new();
        two_by_one()
            .write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(90))
            .expect("encode");

        let mut app1 = vec![0xFF, 0xE1, 0x00, 0x22];
        app1.extend_from_slice(b"Exif\0\0");
        app1.extend_from_slice(&[0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00]);
        app1.extend_from_slice(&[0x01, 0x00]);
        app1.extend_from_slice(&[0x12, 0x01, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, orientation, 0x00, 0x00, 0x00]);
        app1.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

        let mut data = jpeg[..2].to_vec();
        data.extend_from_slice(&app1);
        data.extend_from_slice(&jpeg[2..]);
        data
    }

    #[test]
    fn test_read_orientation_from_app1() {
        assert_eq!(read_orientation(&jpeg_with_orientation(6)), Some(6));
    }

    #[test]
    fn test_plain_jpeg_has_no_orientation() {
        let mut jpeg = Vec::new();
        two_by_one()
            .write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(90))
            .expect("encode");
        assert_eq!(read_orientation(&jpeg), None);
        assert_eq!(read_orientation(b"not an image"), None);
    }

    #[test]
    fn test_apply_orientation() {
        let rotated = apply_orientation(two_by_one(), 6).to_rgb8();
        assert_eq!(rotated.dimensions(), (1, 2));
        assert_eq!(rotated.get_pixel(0, 0), &Rgb([255, 0, 0]));

        let mirrored = apply_orientation(two_by_one(), 2).to_rgb8();
        assert_eq!(mirrored.get_pixel(0, 0), &Rgb([0, 0, 255]));

        // Transpose keeps the first pixel in place.
        let transposed = apply_orientation(two_by_one(), 5).to_rgb8();
        assert_eq!(transposed.dimensions(), (1, 2));
        assert_eq!(transposed.get_pixel(0, 0), &Rgb([255, 0, 0]));

        assert_eq!(apply_orientation(two_by_one(), 42), two_by_one());
    }

    #[test]
    fn test_normalize_reports_transform() {
        let data = jpeg_with_orientation(8);
        let (image, rotated) = normalize(two_by_one(), &data);
        assert!(rotated);
        assert_eq!((image.width(), image.height()), (1, 2));

        let (_, rotated) = normalize(two_by_one(), &jpeg_with_orientation(1));
        assert!(!rotated);
    }
}
