//! Format sniffing and the closed set of formats the engine reasons about.
//!
//! Sniffing never fails: an unrecognizable buffer is reported as
//! [`SourceFormat::Unknown`] and the decode step decides what to do with it.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use image::ImageFormat;
use log::debug;

use crate::errors::CompressionError;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const GIF89A_SIGNATURE: &[u8; 6] = b"GIF89a";
const GIF87A_SIGNATURE: &[u8; 6] = b"GIF87a";
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const BMP_SIGNATURE: &[u8; 2] = b"BM";

/// Format of an input buffer as classified by [`sniff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Png,
    Gif,
    Jpeg,
    Bmp,
    /// Recognized by the generic header probe, but not one of the formats
    /// this engine can re-encode.
    Other(ImageFormat),
    Unknown,
}

impl SourceFormat {
    pub fn tag(&self) -> &'static str {
        match self {
            SourceFormat::Png => "png",
            SourceFormat::Gif => "gif",
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Bmp => "bmp",
            SourceFormat::Other(format) => format.extensions_str().first().copied().unwrap_or("unknown"),
            SourceFormat::Unknown => "unknown",
        }
    }

    /// The encoder matching this source, if there is one.
    pub fn encode_format(&self) -> Option<EncodeFormat> {
        match self {
            SourceFormat::Png => Some(EncodeFormat::Png),
            SourceFormat::Gif => Some(EncodeFormat::Gif),
            SourceFormat::Jpeg => Some(EncodeFormat::Jpeg),
            SourceFormat::Bmp => Some(EncodeFormat::Bmp),
            SourceFormat::Other(_) | SourceFormat::Unknown => None,
        }
    }

    fn from_image_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Png => SourceFormat::Png,
            ImageFormat::Gif => SourceFormat::Gif,
            ImageFormat::Jpeg => SourceFormat::Jpeg,
            ImageFormat::Bmp => SourceFormat::Bmp,
            other => SourceFormat::Other(other),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Formats with an encoder behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodeFormat {
    Jpeg,
    Png,
    Gif,
    Bmp,
}

impl EncodeFormat {
    pub fn tag(&self) -> &'static str {
        match self {
            EncodeFormat::Jpeg => "jpeg",
            EncodeFormat::Png => "png",
            EncodeFormat::Gif => "gif",
            EncodeFormat::Bmp => "bmp",
        }
    }
}

impl fmt::Display for EncodeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Output format requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Keep the source format.
    #[default]
    Auto,
    Jpeg,
    Png,
    Gif,
    Bmp,
}

impl OutputFormat {
    /// Resolves the request against the sniffed source. `None` means the
    /// caller asked for `Auto` and the source has no encoder.
    pub fn resolve(self, source: SourceFormat) -> Option<EncodeFormat> {
        match self {
            OutputFormat::Auto => source.encode_format(),
            OutputFormat::Jpeg => Some(EncodeFormat::Jpeg),
            OutputFormat::Png => Some(EncodeFormat::Png),
            OutputFormat::Gif => Some(EncodeFormat::Gif),
            OutputFormat::Bmp => Some(EncodeFormat::Bmp),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(OutputFormat::Auto),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "gif" => Ok(OutputFormat::Gif),
            "bmp" => Ok(OutputFormat::Bmp),
            other => Err(CompressionError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Classifies a buffer by its magic bytes, falling back to a header-only
/// probe through the `image` crate.
pub fn sniff(data: &[u8]) -> SourceFormat {
    if data.len() < PNG_SIGNATURE.len() {
        return SourceFormat::Unknown;
    }

    if data.starts_with(&PNG_SIGNATURE) {
        return SourceFormat::Png;
    }
    if data.starts_with(GIF89A_SIGNATURE) || data.starts_with(GIF87A_SIGNATURE) {
        return SourceFormat::Gif;
    }
    if data.starts_with(&JPEG_SOI) {
        return SourceFormat::Jpeg;
    }
    if data.starts_with(BMP_SIGNATURE) {
        return SourceFormat::Bmp;
    }

    probe_header(data)
}

fn probe_header(data: &[u8]) -> SourceFormat {
    let reader = match image::io::Reader::new(Cursor::new(data)).with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => {
            debug!("Header probe failed: {}", e);
            return SourceFormat::Unknown;
        }
    };

    let Some(format) = reader.format() else {
        return SourceFormat::Unknown;
    };

    match reader.into_dimensions() {
        Ok((width, height)) => {
            debug!("Header probe recognized {:?} ({}x{})", format, width, height);
            SourceFormat::from_image_format(format)
        }
        Err(e) => {
            debug!("Header probe guessed {:?} but could not read dimensions: {}", format, e);
            SourceFormat::Unknown
        }
    }
}
