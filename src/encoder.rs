use std::io::Cursor;
use std::str::FromStr;
use std::time::Instant;

use image::{DynamicImage, ImageOutputFormat, RgbImage};
use log::{debug, info, warn};

use crate::errors::CompressionError;
use crate::format::{EncodeFormat, SourceFormat};

/// Lowest quality any ladder candidate may use.
pub const LADDER_MIN_QUALITY: u8 = 20;
/// Quality of the JPEG attempted when a PNG re-encode does not shrink.
pub const PNG_JPEG_FALLBACK_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JpegBackend {
    #[default]
    MozJpeg,
    JpegEncoder,
}

impl JpegBackend {
    pub fn name(&self) -> &'static str {
        match self {
            JpegBackend::MozJpeg => "mozjpeg",
            JpegBackend::JpegEncoder => "jpeg-encoder",
        }
    }
}

impl FromStr for JpegBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mozjpeg" => Ok(JpegBackend::MozJpeg),
            "jpeg-encoder" => Ok(JpegBackend::JpegEncoder),
            other => Err(format!("unknown JPEG encoder '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PngMode {
    #[default]
    Lossless,
    /// Palette quantization through imagequant before the PNG encode.
    Quantized,
}

impl PngMode {
    pub fn name(&self) -> &'static str {
        match self {
            PngMode::Lossless => "lossless",
            PngMode::Quantized => "quantized",
        }
    }
}

impl FromStr for PngMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lossless" => Ok(PngMode::Lossless),
            "quantized" | "png-quantized" => Ok(PngMode::Quantized),
            other => Err(format!("unknown PNG mode '{}'", other)),
        }
    }
}

/// Encoded bytes together with the format actually produced, which differs
/// from the requested one when the PNG path falls back to JPEG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub format: EncodeFormat,
}

/// Candidate qualities tried, in order, by the JPEG ladder.
pub fn quality_ladder(start: u8) -> [u8; 6] {
    let q = i32::from(start);
    let candidates = if q >= 50 {
        [q, q - 10, q - 20, 50, 40, 30]
    } else {
        [q, q - 5, 40, 35, 30, 25]
    };
    candidates.map(|c| c.clamp(i32::from(LADDER_MIN_QUALITY), 100) as u8)
}

/// Single-image encoder for the static path.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEncoder {
    jpeg_backend: JpegBackend,
    png_mode: PngMode,
}

impl StaticEncoder {
    pub fn new(jpeg_backend: JpegBackend, png_mode: PngMode) -> Self {
        Self { jpeg_backend, png_mode }
    }

    pub fn encode(
        &self,
        image: &DynamicImage,
        target: EncodeFormat,
        source: SourceFormat,
        quality: u8,
        original_size: u64,
    ) -> Result<EncodedImage, CompressionError> {
        let start = Instant::now();
        let encoded = match target {
            EncodeFormat::Jpeg => EncodedImage {
                data: self.encode_jpeg_ladder(image, quality, original_size)?,
                format: EncodeFormat::Jpeg,
            },
            EncodeFormat::Png => self.encode_png_with_fallback(image, source, quality, original_size)?,
            EncodeFormat::Gif => EncodedImage {
                data: encode_gif(image)?,
                format: EncodeFormat::Gif,
            },
            EncodeFormat::Bmp => EncodedImage {
                data: encode_bmp(image)?,
                format: EncodeFormat::Bmp,
            },
        };

        info!(
            "编码完成 - 尺寸: {}x{}, 格式: {}, 输出大小: {} bytes, 耗时: {:.2}ms",
            image.width(),
            image.height(),
            encoded.format,
            encoded.data.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(encoded)
    }

    /// Walks [`quality_ladder`] and keeps the first candidate strictly
    /// smaller than `original_size`, else the last candidate.
    pub fn encode_jpeg_ladder(
        &self,
        image: &DynamicImage,
        start_quality: u8,
        original_size: u64,
    ) -> Result<Vec<u8>, CompressionError> {
        let ladder = quality_ladder(start_quality);
        let last = ladder.len() - 1;
        let rgb = image.to_rgb8();

        let mut previous: Option<u8> = None;
        let mut last_encoded: Option<Vec<u8>> = None;
        let mut last_error = String::new();

        for (position, &quality) in ladder.iter().enumerate() {
            // 编码结果是确定的，重复的质量无需再试
            if previous == Some(quality) && position != last {
                continue;
            }
            previous = Some(quality);

            match self.encode_jpeg(&rgb, quality) {
                Ok(data) => {
                    debug!(
                        "JPEG 质量阶梯第 {} 步, 质量 {}: {} bytes (原图 {})",
                        position + 1,
                        quality,
                        data.len(),
                        original_size
                    );
                    if (data.len() as u64) < original_size || position == last {
                        return Ok(data);
                    }
                    last_encoded = Some(data);
                }
                Err(e) => {
                    warn!("JPEG 质量阶梯第 {} 步, 质量 {} 失败: {}", position + 1, quality, e);
                    last_error = e;
                }
            }
        }

        match last_encoded {
            Some(data) => {
                warn!("最后一个质量失败，使用上一次成功的编码结果");
                Ok(data)
            }
            None => Err(CompressionError::EncodeExhausted {
                format: "jpeg",
                attempts: ladder.len(),
                last_error,
            }),
        }
    }

    /// Encodes once with the configured backend. mozjpeg failures retry the
    /// same quality with jpeg-encoder.
    pub fn encode_jpeg(&self, rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
        match self.jpeg_backend {
            JpegBackend::MozJpeg => do_mozjpeg_compression(rgb, quality).or_else(|e| {
                warn!("mozjpeg 压缩失败 ({}), 回退到 jpeg-encoder", e);
                do_jpeg_encoder_compression(rgb, quality)
            }),
            JpegBackend::JpegEncoder => do_jpeg_encoder_compression(rgb, quality),
        }
    }

    fn encode_png_with_fallback(
        &self,
        image: &DynamicImage,
        source: SourceFormat,
        quality: u8,
        original_size: u64,
    ) -> Result<EncodedImage, CompressionError> {
        let png = match self.png_mode {
            PngMode::Lossless => do_png_compression(image),
            PngMode::Quantized => do_png_quantized_compression(image, quality),
        }
        .map_err(|e| CompressionError::encode("png", e))?;

        if (png.len() as u64) < original_size || source == SourceFormat::Png || has_transparency(image) {
            return Ok(EncodedImage {
                data: png,
                format: EncodeFormat::Png,
            });
        }

        info!(
            "PNG 重新编码为 {} bytes (原图 {}), 尝试质量 {} 的 JPEG",
            png.len(),
            original_size,
            PNG_JPEG_FALLBACK_QUALITY
        );
        match self.encode_jpeg(&image.to_rgb8(), PNG_JPEG_FALLBACK_QUALITY) {
            Ok(jpeg) if (jpeg.len() as u64) < original_size => Ok(EncodedImage {
                data: jpeg,
                format: EncodeFormat::Jpeg,
            }),
            Ok(jpeg) => {
                debug!("JPEG 回退没有变小 ({} bytes), 保留 PNG", jpeg.len());
                Ok(EncodedImage {
                    data: png,
                    format: EncodeFormat::Png,
                })
            }
            Err(e) => {
                warn!("JPEG 回退失败: {}", e);
                Ok(EncodedImage {
                    data: png,
                    format: EncodeFormat::Png,
                })
            }
        }
    }
}

/// True when any pixel is not fully opaque.
pub fn has_transparency(image: &DynamicImage) -> bool {
    if !image.color().has_alpha() {
        return false;
    }
    match image {
        DynamicImage::ImageLumaA8(buffer) => buffer.pixels().any(|p| p.0[1] < u8::MAX),
        DynamicImage::ImageRgba8(buffer) => buffer.pixels().any(|p| p.0[3] < u8::MAX),
        DynamicImage::ImageLumaA16(buffer) => buffer.pixels().any(|p| p.0[1] < u16::MAX),
        DynamicImage::ImageRgba16(buffer) => buffer.pixels().any(|p| p.0[3] < u16::MAX),
        other => other.to_rgba8().pixels().any(|p| p.0[3] < u8::MAX),
    }
}

// mozjpeg 压缩函数
fn do_mozjpeg_compression(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let (width, height) = rgb.dimensions();
    let raw_data = rgb.as_raw();

    // libjpeg 的致命错误以 panic 形式抛出
    std::panic::catch_unwind(|| {
        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width as usize, height as usize);
        comp.set_quality(f32::from(quality));
        comp.set_mem_dest();
        comp.start_compress();

        let line_size = width as usize * 3;
        for line in raw_data.chunks(line_size) {
            comp.write_scanlines(line);
        }

        comp.finish_compress();
        comp.data_to_vec()
    })
    .map_err(|_| "mozjpeg aborted".to_string())?
    .map_err(|e| format!("mozjpeg produced no output: {:?}", e))
}

// jpeg-encoder 压缩函数
fn do_jpeg_encoder_compression(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    use jpeg_encoder::{ColorType, Encoder};

    let (width, height) = rgb.dimensions();
    let (Ok(width16), Ok(height16)) = (u16::try_from(width), u16::try_from(height)) else {
        return Err(format!("{}x{} exceeds the jpeg-encoder size limit", width, height));
    };

    let mut output = Vec::with_capacity(rgb.as_raw().len() / 8);
    let encoder = Encoder::new(&mut output, quality);
    encoder
        .encode(rgb.as_raw(), width16, height16, ColorType::Rgb)
        .map_err(|e| format!("jpeg-encoder failed: {:?}", e))?;

    Ok(output)
}

fn samples_to_be_bytes(samples: &[u16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_be_bytes()).collect()
}

/// 无损 PNG 压缩：最高 zlib 压缩级别，尽量保持原图的通道布局和位深
pub fn do_png_compression(image: &DynamicImage) -> Result<Vec<u8>, String> {
    use png::{BitDepth, ColorType};

    let (color, depth, data): (ColorType, BitDepth, Vec<u8>) = match image {
        DynamicImage::ImageLuma8(buffer) => (ColorType::Grayscale, BitDepth::Eight, buffer.as_raw().clone()),
        DynamicImage::ImageLumaA8(buffer) => (ColorType::GrayscaleAlpha, BitDepth::Eight, buffer.as_raw().clone()),
        DynamicImage::ImageRgb8(buffer) => (ColorType::Rgb, BitDepth::Eight, buffer.as_raw().clone()),
        DynamicImage::ImageRgba8(buffer) => (ColorType::Rgba, BitDepth::Eight, buffer.as_raw().clone()),
        DynamicImage::ImageLuma16(buffer) => (ColorType::Grayscale, BitDepth::Sixteen, samples_to_be_bytes(buffer.as_raw())),
        DynamicImage::ImageLumaA16(buffer) => {
            (ColorType::GrayscaleAlpha, BitDepth::Sixteen, samples_to_be_bytes(buffer.as_raw()))
        }
        DynamicImage::ImageRgb16(buffer) => (ColorType::Rgb, BitDepth::Sixteen, samples_to_be_bytes(buffer.as_raw())),
        DynamicImage::ImageRgba16(buffer) => (ColorType::Rgba, BitDepth::Sixteen, samples_to_be_bytes(buffer.as_raw())),
        other if other.color().has_alpha() => (ColorType::Rgba, BitDepth::Eight, other.to_rgba8().into_raw()),
        other => (ColorType::Rgb, BitDepth::Eight, other.to_rgb8().into_raw()),
    };

    let mut output = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut output, image.width(), image.height());
        encoder.set_color(color);
        encoder.set_depth(depth);
        encoder.set_compression(png::Compression::Best);

        let mut writer = encoder
            .write_header()
            .map_err(|e| format!("PNG encoder error: {}", e))?;
        writer
            .write_image_data(&data)
            .map_err(|e| format!("PNG encoder error: {}", e))?;
    }

    Ok(output)
}

/// 使用 imagequant 量化为调色板 PNG；调色板含透明度时写入 tRNS 块
pub fn do_png_quantized_compression(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, String> {
    let rgba_img = image.to_rgba8();
    let (width, height) = rgba_img.dimensions();

    let mut liq = imagequant::new();
    liq.set_quality(0, quality)
        .map_err(|e| format!("Failed to set quality: {:?}", e))?;

    let pixels: Vec<imagequant::RGBA> = rgba_img
        .pixels()
        .map(|p| imagequant::RGBA {
            r: p.0[0],
            g: p.0[1],
            b: p.0[2],
            a: p.0[3],
        })
        .collect();
    let mut img = liq
        .new_image(&pixels[..], width as usize, height as usize, 0.0)
        .map_err(|e| format!("Failed to create imagequant image: {:?}", e))?;

    let mut res = match liq.quantize(&mut img) {
        Ok(res) => res,
        Err(imagequant::Error::QualityTooLow) => {
            warn!("量化质量过低，以最低质量 10 重试");
            liq.set_quality(10, quality.max(10))
                .map_err(|e| format!("Failed to set fallback quality: {:?}", e))?;
            liq.quantize(&mut img)
                .map_err(|e| format!("Failed to quantize with fallback: {:?}", e))?
        }
        Err(e) => return Err(format!("Failed to quantize: {:?}", e)),
    };

    res.set_dithering_level(1.0)
        .map_err(|e| format!("Failed to set dithering: {:?}", e))?;

    let (palette, indices) = res
        .remapped(&mut img)
        .map_err(|e| format!("Failed to remap: {:?}", e))?;

    let mut png_data = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_data, width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Best);

        let rgb_palette: Vec<u8> = palette.iter().flat_map(|c| [c.r, c.g, c.b]).collect();
        let mut trns: Vec<u8> = palette.iter().map(|c| c.a).collect();
        while trns.last().copied() == Some(u8::MAX) {
            trns.pop();
        }

        encoder.set_palette(rgb_palette);
        if !trns.is_empty() {
            encoder.set_trns(trns);
        }

        let mut writer = encoder
            .write_header()
            .map_err(|e| format!("Failed to write PNG header: {}", e))?;
        writer
            .write_image_data(&indices)
            .map_err(|e| format!("Failed to write PNG data: {}", e))?;
    }

    Ok(png_data)
}

fn write_with_image_crate(image: &DynamicImage, format: ImageOutputFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut output = Vec::new();
    image.write_to(&mut Cursor::new(&mut output), format)?;
    Ok(output)
}

/// Single-frame GIF; the `gif` crate quantizes to 256 colors.
pub fn encode_gif(image: &DynamicImage) -> Result<Vec<u8>, CompressionError> {
    let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
    write_with_image_crate(&rgba, ImageOutputFormat::Gif).map_err(|e| CompressionError::encode("gif", e.to_string()))
}

pub fn encode_bmp(image: &DynamicImage) -> Result<Vec<u8>, CompressionError> {
    let normalized = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    write_with_image_crate(&normalized, ImageOutputFormat::Bmp).map_err(|e| CompressionError::encode("bmp", e.to_string()))
}
