//! Top-level compression entry points.
//!
//! A [`Compressor`] holds only immutable settings, so one instance can be
//! shared across threads and called concurrently. Every call owns its
//! decoded buffers and returns a fresh [`CompressionResult`].

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use image::DynamicImage;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::animation::{self, ANIMATION_MAX_COLORS};
use crate::encoder::{JpegBackend, PngMode, StaticEncoder};
use crate::errors::CompressionError;
use crate::format::{sniff, EncodeFormat, SourceFormat};
use crate::options::{quality_score, resolve_defaults, CompressionOptions, EffectiveOptions};
use crate::orientation;
use crate::resize::{plan_animation, resize_to_fit};

/// Most files accepted by one [`Compressor::compress_multiple`] call.
pub const MAX_BATCH_FILES: usize = 100;

/// What to do when the encoded output is not smaller than the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizePolicy {
    /// Keep a larger output if the image was resized or lost frames.
    #[default]
    AllowStructural,
    /// Never return more bytes than were given.
    Strict,
}

impl SizePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SizePolicy::AllowStructural => "allow-structural",
            SizePolicy::Strict => "strict",
        }
    }
}

impl FromStr for SizePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow-structural" | "allow_structural" => Ok(SizePolicy::AllowStructural),
            "strict" => Ok(SizePolicy::Strict),
            other => Err(format!("unknown size policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub jpeg_backend: JpegBackend,
    pub png_mode: PngMode,
    pub size_policy: SizePolicy,
    pub parallel_batch: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            jpeg_backend: JpegBackend::default(),
            png_mode: PngMode::default(),
            size_policy: SizePolicy::default(),
            parallel_batch: true,
        }
    }
}

/// Result descriptor. Field names are part of the JSON contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub original_size: u64,
    pub compressed_size: u64,
    /// `compressed_size / original_size`.
    pub ratio: f64,
    pub width: u32,
    pub height: u32,
    /// Tag of the format actually returned.
    pub format: String,
    pub quality_score: u8,
    pub is_animated: bool,
    pub frame_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressionResult {
    pub data: Vec<u8>,
    pub info: ImageInfo,
}

/// One entry of a batch call.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub filename: String,
    pub data: Vec<u8>,
    /// Size reported by the uploader; `data.len()` when absent.
    pub declared_size: Option<u64>,
}

impl InputFile {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
            declared_size: None,
        }
    }

    fn original_size(&self) -> u64 {
        self.declared_size.unwrap_or(self.data.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub filename: String,
    pub outcome: Result<CompressionResult, CompressionError>,
}

impl BatchItem {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Whether an encoded output replaces the original bytes.
pub fn should_keep(encoded_len: u64, original_size: u64, structural_change: bool, policy: SizePolicy) -> bool {
    encoded_len < original_size || (structural_change && policy == SizePolicy::AllowStructural)
}

fn compression_ratio(compressed: u64, original: u64) -> f64 {
    if original == 0 {
        1.0
    } else {
        compressed as f64 / original as f64
    }
}

/// Facts about the input gathered before any encode.
#[derive(Debug, Clone, Copy)]
struct Probe {
    source: SourceFormat,
    original_size: u64,
    quality_score: u8,
    effective: EffectiveOptions,
}

impl Probe {
    fn info(&self, compressed_size: u64, width: u32, height: u32, format: &str, frame_count: usize) -> ImageInfo {
        ImageInfo {
            original_size: self.original_size,
            compressed_size,
            ratio: compression_ratio(compressed_size, self.original_size),
            width,
            height,
            format: format.to_string(),
            quality_score: self.quality_score,
            is_animated: frame_count > 1,
            frame_count,
        }
    }

    /// Returns the input untouched; the reported format is the source's and
    /// the reported sizes are both the original size.
    fn passthrough(&self, data: &[u8], width: u32, height: u32, frame_count: usize) -> CompressionResult {
        let mut info = self.info(self.original_size, width, height, self.source.tag(), frame_count);
        info.ratio = 1.0;
        CompressionResult {
            data: data.to_vec(),
            info,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    settings: EngineSettings,
    encoder: StaticEncoder,
}

impl Compressor {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            encoder: StaticEncoder::new(settings.jpeg_backend, settings.png_mode),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Compresses one image, using `data.len()` as the original size.
    pub fn compress(&self, data: &[u8], options: &CompressionOptions) -> Result<CompressionResult, CompressionError> {
        self.compress_with_size(data, data.len() as u64, options)
    }

    /// Compresses one image. `declared_size` drives the quality tiers, the
    /// ratio and the non-regression check.
    pub fn compress_with_size(
        &self,
        data: &[u8],
        declared_size: u64,
        options: &CompressionOptions,
    ) -> Result<CompressionResult, CompressionError> {
        let start = Instant::now();
        let source = sniff(data);
        let probe = Probe {
            source,
            original_size: declared_size,
            quality_score: quality_score(declared_size, source),
            effective: resolve_defaults(declared_size, options),
        };
        let target = probe.effective.output_format.resolve(source);
        debug!("检测到格式 {} ({} bytes), 目标格式: {:?}", source, declared_size, target);

        let result = if source == SourceFormat::Gif && target == Some(EncodeFormat::Gif) {
            self.compress_animated(data, &probe)?
        } else {
            self.compress_static(data, &probe, target)?
        };

        info!(
            "压缩完成 {} -> {}: {} -> {} bytes (压缩比 {:.3}, 尺寸 {}x{}, {} 帧), 耗时: {:.2}ms",
            source,
            result.info.format,
            result.info.original_size,
            result.info.compressed_size,
            result.info.ratio,
            result.info.width,
            result.info.height,
            result.info.frame_count,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(result)
    }

    fn compress_static(
        &self,
        data: &[u8],
        probe: &Probe,
        target: Option<EncodeFormat>,
    ) -> Result<CompressionResult, CompressionError> {
        let image = decode_static(data)?;
        let (original_width, original_height) = (image.width(), image.height());

        let Some(target) = target else {
            warn!("没有 {} 格式的编码器，原样返回输入", probe.source);
            return Ok(probe.passthrough(data, original_width, original_height, 1));
        };

        let image = if probe.source == SourceFormat::Jpeg {
            orientation::normalize(image, data).0
        } else {
            image
        };

        let effective = &probe.effective;
        let (image, resized) = resize_to_fit(image, effective.max_width, effective.max_height);

        let quality = effective.quality_for(image.width(), image.height());
        let encoded = self
            .encoder
            .encode(&image, target, probe.source, quality, probe.original_size)?;

        if should_keep(encoded.data.len() as u64, probe.original_size, resized, self.settings.size_policy) {
            let info = probe.info(encoded.data.len() as u64, image.width(), image.height(), encoded.format.tag(), 1);
            return Ok(CompressionResult {
                data: encoded.data,
                info,
            });
        }

        debug!(
            "{} 输出 ({} bytes) 不小于原图 ({} bytes)，保留原图",
            encoded.format,
            encoded.data.len(),
            probe.original_size
        );
        Ok(probe.passthrough(data, original_width, original_height, 1))
    }

    fn compress_animated(&self, data: &[u8], probe: &Probe) -> Result<CompressionResult, CompressionError> {
        let animation = animation::decode(data)?;
        let original_width = u32::from(animation.width);
        let original_height = u32::from(animation.height);
        let original_frames = animation.frame_count();
        let original_delay = animation.total_delay();

        let effective = &probe.effective;
        let plan = plan_animation(
            original_width,
            original_height,
            effective.max_width,
            effective.max_height,
            probe.original_size,
        );
        let (animation, resized) = match plan {
            Some((width, height)) => {
                let width = u16::try_from(width).unwrap_or(animation.width);
                let height = u16::try_from(height).unwrap_or(animation.height);
                debug!(
                    "调整动图尺寸 {}x{} -> {}x{}",
                    original_width, original_height, width, height
                );
                (animation.resized(width, height), true)
            }
            None => (animation, false),
        };

        let animation = animation.with_palette_cap(ANIMATION_MAX_COLORS);
        let (animation, frames_reduced) = animation.subsampled();
        if frames_reduced {
            debug!(
                "保留 {}/{} 帧, 总时长 {}cs -> {}cs",
                animation.frame_count(),
                original_frames,
                original_delay,
                animation.total_delay()
            );
        }

        let encoded = animation::encode(&animation)?;
        let structural = resized || frames_reduced;

        if should_keep(encoded.len() as u64, probe.original_size, structural, self.settings.size_policy) {
            let info = probe.info(
                encoded.len() as u64,
                u32::from(animation.width),
                u32::from(animation.height),
                EncodeFormat::Gif.tag(),
                animation.frame_count(),
            );
            return Ok(CompressionResult { data: encoded, info });
        }

        debug!(
            "动图输出 ({} bytes) 不小于原图 ({} bytes)，保留原图",
            encoded.len(),
            probe.original_size
        );
        Ok(probe.passthrough(data, original_width, original_height, original_frames))
    }

    /// Compresses up to [`MAX_BATCH_FILES`] files. Results are in input
    /// order; a failing file is recorded in its own entry.
    pub fn compress_multiple(
        &self,
        files: &[InputFile],
        options: &CompressionOptions,
    ) -> Result<Vec<BatchItem>, CompressionError> {
        if files.len() > MAX_BATCH_FILES {
            return Err(CompressionError::BatchCapExceeded {
                submitted: files.len(),
                limit: MAX_BATCH_FILES,
            });
        }

        let start = Instant::now();
        let compress_one = |file: &InputFile| {
            let outcome = self.compress_with_size(&file.data, file.original_size(), options);
            if let Err(ref e) = outcome {
                warn!("压缩 {} 失败: {}", file.filename, e);
            }
            BatchItem {
                filename: file.filename.clone(),
                outcome,
            }
        };

        let items: Vec<BatchItem> = if self.settings.parallel_batch {
            files.par_iter().map(compress_one).collect()
        } else {
            files.iter().map(compress_one).collect()
        };

        info!(
            "批量压缩 {} 个文件: 成功 {}, 失败 {}, 耗时: {:.2}ms",
            items.len(),
            items.iter().filter(|item| item.is_ok()).count(),
            items.iter().filter(|item| !item.is_ok()).count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(items)
    }
}

impl fmt::Display for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jpeg={}, png={}, size_policy={}, parallel_batch={}",
            self.jpeg_backend.name(),
            self.png_mode.name(),
            self.size_policy.name(),
            self.parallel_batch
        )
    }
}

fn decode_static(data: &[u8]) -> Result<DynamicImage, CompressionError> {
    image::load_from_memory(data).map_err(|e| CompressionError::Decode(e.to_string()))
}
