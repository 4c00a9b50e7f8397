//! Frame-level GIF handling for the animated path.
//!
//! Frames are kept in their indexed form (palette + indices) so palette
//! reduction can work on the color table directly. Every transform takes
//! the animation by value and returns a new one; the original input bytes
//! are never touched, which lets the caller fall back to them at the end.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;

use gif::{ColorOutput, DecodeOptions, DisposalMethod, Encoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use log::debug;

use crate::errors::CompressionError;
use crate::resize::RESAMPLE_FILTER;

/// Color cap applied to every frame on the animated path.
pub const ANIMATION_MAX_COLORS: usize = 32;
/// Subsampling only engages above this frame count.
pub const SUBSAMPLE_MIN_FRAMES: usize = 5;
/// Fewest frames subsampling may leave.
pub const MIN_KEPT_FRAMES: usize = 2;
/// Clamp, in centiseconds, for rebalanced frame delays.
pub const MIN_FRAME_DELAY: u16 = 2;
pub const MAX_FRAME_DELAY: u16 = 100;

const ALPHA_THRESHOLD: u8 = 128;
const MIN_UNPREMULTIPLY_ALPHA: u8 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationFrame {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
    /// The frame's effective color table (local, or a copy of the global one).
    pub palette: Vec<[u8; 3]>,
    pub transparent: Option<u8>,
    /// One palette index per pixel, row-major, `width * height` long.
    pub indices: Vec<u8>,
    /// Centiseconds.
    pub delay: u16,
    pub disposal: DisposalMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAnimation {
    pub width: u16,
    pub height: u16,
    pub repeat: Repeat,
    /// Never empty.
    pub frames: Vec<AnimationFrame>,
}

impl DecodedAnimation {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_animated(&self) -> bool {
        self.frames.len() > 1
    }

    pub fn total_delay(&self) -> u64 {
        self.frames.iter().map(|f| u64::from(f.delay)).sum()
    }

    /// Resamples the canvas and every frame to `width` x `height`.
    pub fn resized(self, width: u16, height: u16) -> Self {
        let scale_x = f64::from(width) / f64::from(self.width.max(1));
        let scale_y = f64::from(height) / f64::from(self.height.max(1));

        let frames = self
            .frames
            .into_iter()
            .map(|frame| resize_frame(frame, scale_x, scale_y, width, height))
            .collect();

        DecodedAnimation {
            width,
            height,
            repeat: self.repeat,
            frames,
        }
    }

    /// Caps every frame's color table at `max_colors` entries.
    pub fn with_palette_cap(self, max_colors: usize) -> Self {
        DecodedAnimation {
            frames: self
                .frames
                .into_iter()
                .map(|frame| reduce_palette(frame, max_colors))
                .collect(),
            ..self
        }
    }

    /// Drops frames per [`select_frame_indices`], rebalancing delays. The
    /// flag reports whether any frame was dropped.
    pub fn subsampled(self) -> (Self, bool) {
        let original_count = self.frames.len();
        let (frames, dropped) = subsample(self.frames);
        if dropped {
            debug!("动图抽帧: {} -> {} 帧", original_count, frames.len());
        }
        (DecodedAnimation { frames, ..self }, dropped)
    }
}

fn rgb_triplets(raw: &[u8]) -> Vec<[u8; 3]> {
    raw.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

/// Decodes every frame of a GIF in indexed form.
pub fn decode(data: &[u8]) -> Result<DecodedAnimation, CompressionError> {
    let mut options = DecodeOptions::new();
    options.set_color_output(ColorOutput::Indexed);

    let mut decoder = options
        .read_info(Cursor::new(data))
        .map_err(|e| CompressionError::Decode(format!("GIF header: {}", e)))?;

    let global_palette = decoder.global_palette().map(rgb_triplets);
    let (width, height) = (decoder.width(), decoder.height());

    let mut frames = Vec::new();
    while let Some(frame) = decoder
        .read_next_frame()
        .map_err(|e| CompressionError::Decode(format!("GIF frame {}: {}", frames.len(), e)))?
    {
        let palette = match (&frame.palette, &global_palette) {
            (Some(local), _) => rgb_triplets(local),
            (None, Some(global)) => global.clone(),
            (None, None) => {
                return Err(CompressionError::Decode(format!(
                    "GIF frame {} has no color table",
                    frames.len()
                )))
            }
        };

        frames.push(AnimationFrame {
            left: frame.left,
            top: frame.top,
            width: frame.width,
            height: frame.height,
            palette,
            transparent: frame.transparent,
            indices: frame.buffer.to_vec(),
            delay: frame.delay,
            disposal: frame.dispose,
        });
    }

    if frames.is_empty() {
        return Err(CompressionError::Decode("GIF contains no frames".to_string()));
    }

    Ok(DecodedAnimation {
        width,
        height,
        repeat: decoder.repeat(),
        frames,
    })
}

/// Encodes the animation with one local color table per frame.
pub fn encode(animation: &DecodedAnimation) -> Result<Vec<u8>, CompressionError> {
    let encode_err = |e: gif::EncodingError| CompressionError::encode("gif", e.to_string());

    let mut output = Vec::new();
    {
        let mut encoder = Encoder::new(&mut output, animation.width, animation.height, &[])
            .map_err(encode_err)?;

        // 没有 NETSCAPE 块时解码为 Finite(0)，原样写回会变成无限循环
        if animation.repeat != Repeat::Finite(0) {
            encoder.set_repeat(animation.repeat).map_err(encode_err)?;
        }

        for frame in &animation.frames {
            let palette: Vec<u8> = frame.palette.iter().flatten().copied().collect();
            let gif_frame = gif::Frame {
                left: frame.left,
                top: frame.top,
                width: frame.width,
                height: frame.height,
                delay: frame.delay,
                dispose: frame.disposal,
                transparent: frame.transparent,
                palette: Some(palette),
                buffer: Cow::Borrowed(&frame.indices),
                ..gif::Frame::default()
            };
            encoder.write_frame(&gif_frame).map_err(encode_err)?;
        }
    }

    Ok(output)
}

fn squared_distance(a: [u8; 3], b: [u8; 3]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = i32::from(x) - i32::from(y);
            (d * d) as u32
        })
        .sum()
}

/// Index of the entry in `palette` closest to `color`, skipping `exclude`.
/// Ties resolve to the lowest index.
fn nearest_index(palette: &[[u8; 3]], color: [u8; 3], exclude: Option<u8>) -> u8 {
    palette
        .iter()
        .enumerate()
        .filter(|&(i, _)| exclude != Some(i as u8))
        .min_by_key(|&(_, entry)| squared_distance(*entry, color))
        .map(|(i, _)| i as u8)
        .unwrap_or(0)
}

/// Truncates the frame's color table to its first `max_colors` entries and
/// remaps pixels whose color was dropped to the nearest surviving entry.
///
/// A transparent slot that falls outside the kept range moves to the last
/// kept slot so transparency survives the truncation.
pub fn reduce_palette(frame: AnimationFrame, max_colors: usize) -> AnimationFrame {
    if max_colors == 0 || frame.palette.len() <= max_colors {
        return frame;
    }

    let truncated: Vec<[u8; 3]> = frame.palette[..max_colors].to_vec();
    let last_slot = (max_colors - 1) as u8;
    let transparent = frame.transparent.map(|t| if usize::from(t) < max_colors { t } else { last_slot });

    let mut remap = [0u8; 256];
    for (index, slot) in remap.iter_mut().enumerate() {
        *slot = if frame.transparent == Some(index as u8) {
            transparent.unwrap_or(0)
        } else if index < max_colors && transparent != Some(index as u8) {
            index as u8
        } else {
            let color = frame.palette.get(index).copied().unwrap_or([0, 0, 0]);
            nearest_index(&truncated, color, transparent)
        };
    }

    let indices = frame.indices.iter().map(|&i| remap[usize::from(i)]).collect();

    AnimationFrame {
        palette: truncated,
        transparent,
        indices,
        ..frame
    }
}

fn frame_to_rgba(frame: &AnimationFrame) -> RgbaImage {
    let width = u32::from(frame.width);
    RgbaImage::from_fn(width, u32::from(frame.height), |x, y| {
        let position = (y * width + x) as usize;
        let index = frame.indices.get(position).copied().unwrap_or(0);
        if frame.transparent == Some(index) {
            return Rgba([0, 0, 0, 0]);
        }
        let [r, g, b] = frame.palette.get(usize::from(index)).copied().unwrap_or([0, 0, 0]);
        Rgba([r, g, b, 255])
    })
}

/// Scales a span `[start, start + len)` and clamps it inside `limit`.
fn scale_span(start: u16, len: u16, scale: f64, limit: u16) -> (u16, u16) {
    let limit = limit.max(1);
    let new_start = ((f64::from(start) * scale).round() as u16).min(limit - 1);
    let new_len = ((f64::from(len) * scale).round() as u16)
        .max(1)
        .min(limit - new_start);
    (new_start, new_len)
}

fn unpremultiply(channel: u8, alpha: u8) -> u8 {
    (u32::from(channel) * 255 / u32::from(alpha)).min(255) as u8
}

fn resize_frame(frame: AnimationFrame, scale_x: f64, scale_y: f64, canvas_w: u16, canvas_h: u16) -> AnimationFrame {
    let (left, width) = scale_span(frame.left, frame.width, scale_x, canvas_w);
    let (top, height) = scale_span(frame.top, frame.height, scale_y, canvas_h);

    if frame.width == 0 || frame.height == 0 {
        return AnimationFrame {
            left,
            top,
            width,
            height,
            indices: vec![frame.transparent.unwrap_or(0); usize::from(width) * usize::from(height)],
            ..frame
        };
    }

    // 透明像素为 (0,0,0,0)，即预乘 alpha 形式；平滑结果除以 alpha 还原颜色，
    // 透明遮罩取最近邻，避免边缘发黑
    let rgba = frame_to_rgba(&frame);
    let smooth = imageops::resize(&rgba, u32::from(width), u32::from(height), RESAMPLE_FILTER);
    let mask = imageops::resize(&rgba, u32::from(width), u32::from(height), FilterType::Nearest);

    let mut cache: HashMap<[u8; 3], u8> = HashMap::new();
    let indices = smooth
        .pixels()
        .zip(mask.pixels())
        .map(|(smooth, nearest)| {
            let [r, g, b, a] = smooth.0;
            let color = if a < MIN_UNPREMULTIPLY_ALPHA {
                [nearest[0], nearest[1], nearest[2]]
            } else {
                [unpremultiply(r, a), unpremultiply(g, a), unpremultiply(b, a)]
            };
            match frame.transparent {
                Some(t) if nearest[3] < ALPHA_THRESHOLD => t,
                _ => *cache
                    .entry(color)
                    .or_insert_with(|| nearest_index(&frame.palette, color, frame.transparent)),
            }
        })
        .collect();

    AnimationFrame {
        left,
        top,
        width,
        height,
        indices,
        ..frame
    }
}

/// Fraction of frames kept for an animation of `frame_count` frames.
pub fn keep_ratio(frame_count: usize) -> f64 {
    if frame_count > 30 {
        0.3
    } else if frame_count > 15 {
        0.4
    } else {
        0.5
    }
}

pub fn frames_to_keep(frame_count: usize) -> usize {
    let keep = (frame_count as f64 * keep_ratio(frame_count)) as usize;
    keep.max(MIN_KEPT_FRAMES)
}

/// Indices of the frames kept by subsampling, in ascending order. The first
/// and last frame are always kept; the interior is strided.
pub fn select_frame_indices(frame_count: usize) -> Vec<usize> {
    if frame_count <= SUBSAMPLE_MIN_FRAMES {
        return (0..frame_count).collect();
    }
    let keep = frames_to_keep(frame_count);
    if keep >= frame_count {
        return (0..frame_count).collect();
    }

    let mut selected = Vec::with_capacity(keep);
    selected.push(0);

    if keep > MIN_KEPT_FRAMES {
        let step = (frame_count / (keep - 1)).max(1);
        let interior = (step..frame_count - 1).step_by(step);
        selected.extend(interior.take(keep - MIN_KEPT_FRAMES));
    }

    selected.push(frame_count - 1);
    selected
}

/// Scales `kept` delays so they sum to roughly `original_total`, clamping
/// each to [`MIN_FRAME_DELAY`]..=[`MAX_FRAME_DELAY`]. Left unchanged when
/// the kept frames carry no delay at all.
pub fn rebalance_delays(original_total: u64, kept: &[u16]) -> Vec<u16> {
    let kept_total: u64 = kept.iter().map(|&d| u64::from(d)).sum();
    if kept_total == 0 {
        return kept.to_vec();
    }

    let factor = original_total as f64 / kept_total as f64;
    kept.iter()
        .map(|&delay| {
            let scaled = (f64::from(delay) * factor) as u64;
            scaled.clamp(u64::from(MIN_FRAME_DELAY), u64::from(MAX_FRAME_DELAY)) as u16
        })
        .collect()
}

/// Subsamples `frames` and rebalances their delays. Returns the kept frames
/// and whether any were dropped.
pub fn subsample(frames: Vec<AnimationFrame>) -> (Vec<AnimationFrame>, bool) {
    let original_count = frames.len();
    let selected = select_frame_indices(original_count);
    if selected.len() == original_count {
        return (frames, false);
    }

    let original_total: u64 = frames.iter().map(|f| u64::from(f.delay)).sum();

    let mut kept: Vec<AnimationFrame> = Vec::with_capacity(selected.len());
    let mut wanted = selected.iter().peekable();
    for (index, frame) in frames.into_iter().enumerate() {
        if wanted.peek() == Some(&&index) {
            wanted.next();
            kept.push(frame);
        }
    }

    let delays: Vec<u16> = kept.iter().map(|f| f.delay).collect();
    for (frame, delay) in kept.iter_mut().zip(rebalance_delays(original_total, &delays)) {
        frame.delay = delay;
    }

    (kept, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(color_index: u8, palette_len: usize, delay: u16) -> AnimationFrame {
        AnimationFrame {
            left: 0,
            top: 0,
            width: 4,
            height: 4,
            palette: (0..palette_len).map(|i| [i as u8, i as u8, i as u8]).collect(),
            transparent: None,
            indices: vec![color_index; 16],
            delay,
            disposal: DisposalMethod::Keep,
        }
    }

    #[test]
    fn test_keep_ratio_tiers() {
        assert_eq!(keep_ratio(50), 0.3);
        assert_eq!(keep_ratio(31), 0.3);
        assert_eq!(keep_ratio(30), 0.4);
        assert_eq!(keep_ratio(16), 0.4);
        assert_eq!(keep_ratio(15), 0.5);
        assert_eq!(frames_to_keep(50), 15);
        assert_eq!(frames_to_keep(6), 3);
    }

    #[test]
    fn test_select_small_animations_untouched() {
        assert_eq!(select_frame_indices(1), vec![0]);
        assert_eq!(select_frame_indices(5), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_select_keeps_first_and_last() {
        assert_eq!(select_frame_indices(6), vec![0, 3, 5]);

        let selected = select_frame_indices(50);
        assert_eq!(selected.len(), 15);
        assert_eq!(selected.first(), Some(&0));
        assert_eq!(selected.last(), Some(&49));
        assert_eq!(&selected[1..4], &[3, 6, 9]);
        assert!(selected.windows(2).all(|w| w[0] < w[1]));

        for count in 6..200 {
            let selected = select_frame_indices(count);
            assert!(selected.len() >= MIN_KEPT_FRAMES);
            assert!(selected.len() <= frames_to_keep(count));
            assert_eq!(selected.last(), Some(&(count - 1)));
            assert!(selected.windows(2).all(|w| w[0] < w[1]), "count {}", count);
        }
    }

    #[test]
    fn test_rebalance_preserves_duration() {
        let delays = rebalance_delays(200, &[4; 15]);
        assert!(delays.iter().all(|&d| d == 13));
        let total: u32 = delays.iter().map(|&d| u32::from(d)).sum();
        assert!(200 - total <= 15);
    }

    #[test]
    fn test_rebalance_clamps() {
        assert_eq!(rebalance_delays(1000, &[1, 1]), vec![100, 100]);
        assert_eq!(rebalance_delays(1, &[50, 50]), vec![2, 2]);
        assert_eq!(rebalance_delays(100, &[0, 0]), vec![0, 0]);
    }

    #[test]
    fn test_subsample_frames() {
        let frames: Vec<_> = (0..10).map(|i| solid_frame(i as u8, 16, 10)).collect();
        let (kept, dropped) = subsample(frames);
        assert!(dropped);
        assert_eq!(kept.len(), 5);
        assert_eq!(kept[0].indices[0], 0);
        assert_eq!(kept[4].indices[0], 9);
        assert!(kept.iter().all(|f| f.delay == 20));

        let few: Vec<_> = (0..4).map(|i| solid_frame(i as u8, 16, 10)).collect();
        let (kept, dropped) = subsample(few.clone());
        assert!(!dropped);
        assert_eq!(kept, few);
    }

    #[test]
    fn test_reduce_palette_within_cap_is_untouched() {
        let frame = solid_frame(3, 32, 5);
        assert_eq!(reduce_palette(frame.clone(), 32), frame);
    }

    #[test]
    fn test_reduce_palette_remaps_to_nearest() {
        let mut frame = solid_frame(0, 64, 5);
        frame.indices = vec![0, 5, 31, 32, 40, 63, 200, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let reduced = reduce_palette(frame, 32);

        assert_eq!(reduced.palette.len(), 32);
        assert_eq!(&reduced.indices[..3], &[0, 5, 31]);
        // Gray ramp: everything past the cap is nearest to the last kept entry.
        assert_eq!(&reduced.indices[3..6], &[31, 31, 31]);
        // Out-of-range index has no color; it maps to black (slot 0).
        assert_eq!(reduced.indices[6], 0);
        assert!(reduced.indices.iter().all(|&i| usize::from(i) < 32));
    }

    #[test]
    fn test_reduce_palette_keeps_transparency() {
        let mut frame = solid_frame(0, 64, 5);
        frame.transparent = Some(50);
        frame.indices = vec![50, 31, 40, 0, 50, 50, 50, 50, 50, 50, 50, 50, 50, 50, 50, 50];
        let reduced = reduce_palette(frame, 32);

        assert_eq!(reduced.transparent, Some(31));
        assert_eq!(reduced.indices[0], 31);
        // Old slot 31 is now transparent, so its pixels move to the next nearest.
        assert_eq!(reduced.indices[1], 30);
        assert_eq!(reduced.indices[2], 30);
        assert_eq!(reduced.indices[3], 0);
    }

    #[test]
    fn test_resize_frame_geometry() {
        let animation = DecodedAnimation {
            width: 8,
            height: 8,
            repeat: Repeat::Infinite,
            frames: vec![
                AnimationFrame {
                    width: 8,
                    height: 8,
                    indices: vec![1; 64],
                    ..solid_frame(1, 4, 5)
                },
                AnimationFrame {
                    left: 4,
                    top: 4,
                    width: 4,
                    height: 4,
                    ..solid_frame(2, 4, 5)
                },
            ],
        };

        let resized = animation.resized(4, 4);
        assert_eq!((resized.width, resized.height), (4, 4));
        assert_eq!(resized.frames[0].indices, vec![1; 16]);
        let second = &resized.frames[1];
        assert_eq!((second.left, second.top, second.width, second.height), (2, 2, 2, 2));
        assert_eq!(second.indices, vec![2; 4]);
    }

    #[test]
    fn test_resize_frame_keeps_transparent_edges_clean() {
        // Left half transparent, right half white.
        let frame = AnimationFrame {
            width: 8,
            height: 8,
            palette: vec![[0, 0, 0], [255, 255, 255], [128, 128, 128], [40, 40, 40]],
            transparent: Some(0),
            indices: (0..64).map(|p| if p % 8 < 4 { 0 } else { 1 }).collect(),
            ..solid_frame(0, 4, 5)
        };

        let resized = resize_frame(frame, 0.5, 0.5, 4, 4);
        assert_eq!((resized.width, resized.height), (4, 4));
        for (position, &index) in resized.indices.iter().enumerate() {
            let expected = if position % 4 < 2 { 0 } else { 1 };
            assert_eq!(index, expected, "pixel {}", position);
        }
    }

    #[test]
    fn test_decode_encode_round_trip_keeps_frames() {
        let animation = DecodedAnimation {
            width: 4,
            height: 4,
            repeat: Repeat::Infinite,
            frames: (0..3).map(|i| solid_frame(i, 4, 7)).collect(),
        };

        let bytes = encode(&animation).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(decoded.frame_count(), 3);
        assert_eq!(decoded.repeat, Repeat::Infinite);
        assert!(decoded.frames.iter().all(|f| f.delay == 7));
        assert_eq!(decoded.frames[2].indices, vec![2; 16]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"GIF89a\x00"), Err(CompressionError::Decode(_))));
    }
}
