pub mod animation;
pub mod compressor;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod format;
pub mod handlers;
pub mod options;
pub mod orientation;
pub mod resize;

// Re-export commonly used items for easier testing
pub use compressor::{
    BatchItem, CompressionResult, Compressor, EngineSettings, ImageInfo, InputFile, SizePolicy, MAX_BATCH_FILES,
};
pub use config::{Config, ConfigError};
pub use encoder::{JpegBackend, PngMode};
pub use errors::{CompressionError, ImageServerError};
pub use format::{sniff, EncodeFormat, OutputFormat, SourceFormat};
pub use options::CompressionOptions;
