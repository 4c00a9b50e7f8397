//! Aspect-ratio preserving resize planning.
//!
//! Planning is kept separate from resampling so the same rules drive both
//! the static path (a single `DynamicImage`) and the animated path (every
//! frame of a GIF).

use image::imageops::FilterType;
use image::DynamicImage;
use log::debug;

/// Larger edge above which an unconstrained static image is downscaled.
pub const SAFETY_EDGE_LIMIT: u32 = 3000;
/// Scale applied by the safety downscale.
pub const SAFETY_SCALE: f64 = 0.7;

pub const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Dimensions that fit `width` x `height` inside the limits, or `None` when
/// the image already fits (a limit of 0 is unconstrained).
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let fits_width = max_width == 0 || width <= max_width;
    let fits_height = max_height == 0 || height <= max_height;
    if fits_width && fits_height {
        return None;
    }

    let width_ratio = if max_width == 0 {
        f64::INFINITY
    } else {
        f64::from(max_width) / f64::from(width)
    };
    let height_ratio = if max_height == 0 {
        f64::INFINITY
    } else {
        f64::from(max_height) / f64::from(height)
    };
    let scale = width_ratio.min(height_ratio);

    let mut target = scale_dimensions(width, height, scale);
    if max_width > 0 {
        target.0 = target.0.min(max_width);
    }
    if max_height > 0 {
        target.1 = target.1.min(max_height);
    }

    (target != (width, height)).then_some(target)
}

/// Scales both edges by `factor`, rounding and never going below 1px.
pub fn scale_dimensions(width: u32, height: u32, factor: f64) -> (u32, u32) {
    let scale = |edge: u32| ((f64::from(edge) * factor).round() as u32).max(1);
    (scale(width), scale(height))
}

/// Resize target for a static image: explicit limits win, otherwise only
/// images whose larger edge exceeds [`SAFETY_EDGE_LIMIT`] are shrunk.
pub fn plan_static(width: u32, height: u32, max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    if max_width > 0 || max_height > 0 {
        return fit_dimensions(width, height, max_width, max_height);
    }

    if width.max(height) > SAFETY_EDGE_LIMIT {
        let target = scale_dimensions(width, height, SAFETY_SCALE);
        debug!(
            "大图安全缩放 {}x{} -> {}x{}",
            width, height, target.0, target.1
        );
        return (target != (width, height)).then_some(target);
    }

    None
}

/// Automatic scale for an animation given its encoded size.
pub fn animation_scale(original_size: u64) -> Option<f64> {
    if original_size > 2 * MIB {
        Some(0.7)
    } else if original_size > MIB {
        Some(0.8)
    } else if original_size > 512 * KIB {
        Some(0.9)
    } else {
        None
    }
}

/// Resize target for an animation: explicit limits win, otherwise the
/// size-tiered [`animation_scale`].
pub fn plan_animation(
    width: u32,
    height: u32,
    max_width: u32,
    max_height: u32,
    original_size: u64,
) -> Option<(u32, u32)> {
    if max_width > 0 || max_height > 0 {
        return fit_dimensions(width, height, max_width, max_height);
    }

    let scale = animation_scale(original_size)?;
    let (limit_width, limit_height) = scale_dimensions(width, height, scale);
    fit_dimensions(width, height, limit_width, limit_height)
}

/// Resamples to exactly `width` x `height`.
pub fn resample(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    image.resize_exact(width, height, RESAMPLE_FILTER)
}

/// Static-path resize following [`plan_static`]. Returns the input untouched
/// (and `false`) when no resize is planned.
pub fn resize_to_fit(image: DynamicImage, max_width: u32, max_height: u32) -> (DynamicImage, bool) {
    match plan_static(image.width(), image.height(), max_width, max_height) {
        Some((width, height)) => {
            debug!("调整尺寸 {}x{} -> {}x{}", image.width(), image.height(), width, height);
            (resample(&image, width, height), true)
        }
        None => (image, false),
    }
}
