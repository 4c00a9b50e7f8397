use image::ImageFormat;

use crate::format::{OutputFormat, SourceFormat};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Pixel count above which the resolved quality is lowered by 20%.
pub const LARGE_IMAGE_PIXELS: u64 = 4_000_000;
/// Lowest quality the large-image penalty may produce.
pub const LARGE_IMAGE_MIN_QUALITY: u8 = 40;

/// Caller-supplied options, validated by the binding layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionOptions {
    /// 1-100, lossy formats only. Anything outside that range is ignored.
    pub quality: Option<u8>,
    /// 0 means unconstrained.
    pub max_width: u32,
    /// 0 means unconstrained.
    pub max_height: u32,
    pub output_format: OutputFormat,
    /// Only consulted when naming output files.
    pub preserve_original_name: bool,
}

/// Options after defaults have been applied, computed once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveOptions {
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
    pub output_format: OutputFormat,
}

impl EffectiveOptions {
    /// Final encode quality for an image of `width` x `height` after resizing.
    pub fn quality_for(&self, width: u32, height: u32) -> u8 {
        large_image_quality(self.quality, u64::from(width) * u64::from(height))
    }
}

pub fn resolve_defaults(original_size: u64, options: &CompressionOptions) -> EffectiveOptions {
    let explicit = options.quality.filter(|q| (1..=100).contains(q));

    EffectiveOptions {
        quality: explicit.unwrap_or_else(|| default_quality(original_size)),
        max_width: options.max_width,
        max_height: options.max_height,
        output_format: options.output_format,
    }
}

/// Size-tiered default quality.
pub fn default_quality(original_size: u64) -> u8 {
    if original_size > 5 * MIB {
        60
    } else if original_size > MIB {
        70
    } else {
        75
    }
}

/// Applies the 20% penalty for images above [`LARGE_IMAGE_PIXELS`], floored
/// at [`LARGE_IMAGE_MIN_QUALITY`]. A quality already under the floor is
/// raised to it.
pub fn large_image_quality(quality: u8, pixel_count: u64) -> u8 {
    if pixel_count <= LARGE_IMAGE_PIXELS {
        return quality;
    }
    let reduced = (f64::from(quality) * 0.8) as u8;
    reduced.max(LARGE_IMAGE_MIN_QUALITY)
}

/// Coarse diagnostic score; not used for any encoding decision.
pub fn quality_score(size: u64, format: SourceFormat) -> u8 {
    if size < KIB {
        return 30;
    }
    if size > 5 * MIB {
        return 95;
    }

    match format {
        SourceFormat::Jpeg => 75,
        SourceFormat::Png => 85,
        SourceFormat::Other(ImageFormat::WebP) => 80,
        SourceFormat::Gif => 60,
        _ => 70,
    }
}
