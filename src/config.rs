use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::compressor::{EngineSettings, SizePolicy};
use crate::encoder::{JpegBackend, PngMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub compression: CompressionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_file_size_mb: usize,
    pub worker_threads: Option<usize>,
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// "mozjpeg" or "jpeg-encoder".
    pub jpeg_encoder: String,
    /// "lossless" or "quantized".
    pub png_mode: String,
    /// "allow-structural" or "strict".
    pub size_policy: String,
    pub parallel_batch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub enable_request_logging: bool,
    pub log_compression_stats: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            max_file_size_mb: 100,
            worker_threads: None, // Use system default
            enable_cors: true,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            jpeg_encoder: JpegBackend::default().name().to_string(),
            png_mode: PngMode::default().name().to_string(),
            size_policy: SizePolicy::default().name().to_string(),
            parallel_batch: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_request_logging: true,
            log_compression_stats: true,
        }
    }
}

impl CompressionConfig {
    /// Engine settings described by this section.
    pub fn to_engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            jpeg_backend: self.jpeg_encoder.parse().map_err(ConfigError::ValidationError)?,
            png_mode: self.png_mode.parse().map_err(ConfigError::ValidationError)?,
            size_policy: self.size_policy.parse().map_err(ConfigError::ValidationError)?,
            parallel_batch: self.parallel_batch,
        })
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if file doesn't exist
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration from environment variables and file
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("IMG_COMPRESS_CONFIG")
            .unwrap_or_else(|_| "config.toml".to_string());

        let mut config = Self::load_from_file(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("IMG_COMPRESS_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("IMG_COMPRESS_PORT") {
            if let Ok(port_num) = port.parse::<u16>() {
                self.server.port = port_num;
            }
        }

        if let Ok(max_size) = std::env::var("IMG_COMPRESS_MAX_FILE_SIZE_MB") {
            if let Ok(size) = max_size.parse::<usize>() {
                self.server.max_file_size_mb = size;
            }
        }

        if let Ok(encoder) = std::env::var("IMG_COMPRESS_JPEG_ENCODER") {
            self.compression.jpeg_encoder = encoder;
        }

        if let Ok(mode) = std::env::var("IMG_COMPRESS_PNG_MODE") {
            self.compression.png_mode = mode;
        }

        if let Ok(policy) = std::env::var("IMG_COMPRESS_SIZE_POLICY") {
            self.compression.size_policy = policy;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError("Port cannot be 0".to_string()));
        }

        if self.server.max_file_size_mb == 0 {
            return Err(ConfigError::ValidationError("Max file size cannot be 0".to_string()));
        }

        if self.server.worker_threads == Some(0) {
            return Err(ConfigError::ValidationError("Worker threads cannot be 0".to_string()));
        }

        self.compression.to_engine_settings()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Self::default();
        let toml_content = toml::to_string_pretty(&config)
            .map_err(|e| ConfigError::SerializeError(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_content)
            .map_err(|e| ConfigError::IoError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Get the bind address for the server
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Get max file size in bytes
    pub fn max_file_size_bytes(&self) -> usize {
        self.server.max_file_size_mb * 1024 * 1024
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Serialization error: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3030);
        assert_eq!(config.compression.jpeg_encoder, "mozjpeg");
        assert_eq!(config.compression.png_mode, "lossless");
        assert_eq!(config.compression.size_policy, "allow-structural");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.compression.jpeg_encoder = "libjpeg".to_string();
        assert!(config.validate().is_err());

        config.compression.jpeg_encoder = "jpeg-encoder".to_string();
        config.compression.size_policy = "sometimes".to_string();
        assert!(config.validate().is_err());

        config.compression.size_policy = "strict".to_string();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_settings_conversion() {
        let mut config = Config::default();
        config.compression.jpeg_encoder = "jpeg-encoder".to_string();
        config.compression.png_mode = "quantized".to_string();
        config.compression.size_policy = "strict".to_string();
        config.compression.parallel_batch = false;

        let settings = config.compression.to_engine_settings().unwrap();
        assert_eq!(settings.jpeg_backend, JpegBackend::JpegEncoder);
        assert_eq!(settings.png_mode, PngMode::Quantized);
        assert_eq!(settings.size_policy, SizePolicy::Strict);
        assert!(!settings.parallel_batch);

        assert_eq!(
            Config::default().compression.to_engine_settings().unwrap(),
            EngineSettings::default()
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [compression]
            size_policy = "strict"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.compression.size_policy, "strict");
        assert!(config.compression.parallel_batch);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_sample_config_round_trip() {
        let path = env::temp_dir().join(format!("img-compress-{}.toml", uuid::Uuid::new_v4()));
        Config::generate_sample_config(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.bind_address(), Config::default().bind_address());
        assert_eq!(loaded.compression.jpeg_encoder, "mozjpeg");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("IMG_COMPRESS_HOST", "127.0.0.1");
        env::set_var("IMG_COMPRESS_PORT", "8080");
        env::set_var("IMG_COMPRESS_PNG_MODE", "quantized");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.compression.png_mode, "quantized");

        env::remove_var("IMG_COMPRESS_HOST");
        env::remove_var("IMG_COMPRESS_PORT");
        env::remove_var("IMG_COMPRESS_PNG_MODE");
    }

    #[test]
    fn test_bind_address() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:3030");
    }

    #[test]
    fn test_max_file_size_bytes() {
        let config = Config::default();
        assert_eq!(config.max_file_size_bytes(), 100 * 1024 * 1024);
    }
}
