use thiserror::Error;

/// Failures of a single compression call (or of a whole batch call for
/// `BatchCapExceeded`). Size regressions are never reported here; they are
/// resolved by returning the original bytes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompressionError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("All {attempts} {format} encode attempts failed, last error: {last_error}")]
    EncodeExhausted {
        format: &'static str,
        attempts: usize,
        last_error: String,
    },

    #[error("Failed to encode {format}: {message}")]
    Encode {
        format: &'static str,
        message: String,
    },

    #[error("Batch of {submitted} files exceeds the limit of {limit}")]
    BatchCapExceeded { submitted: usize, limit: usize },
}

impl CompressionError {
    pub(crate) fn encode(format: &'static str, message: impl Into<String>) -> Self {
        CompressionError::Encode {
            format,
            message: message.into(),
        }
    }

    /// Stable machine-readable tag, used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CompressionError::Decode(_) => "decode_error",
            CompressionError::UnsupportedFormat(_) => "unsupported_format",
            CompressionError::EncodeExhausted { .. } => "encode_exhausted",
            CompressionError::Encode { .. } => "encode_error",
            CompressionError::BatchCapExceeded { .. } => "batch_cap_exceeded",
        }
    }
}

#[derive(Error, Debug)]
pub enum ImageServerError {
    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("File too large: maximum size is {max_size} bytes")]
    FileTooLarge { max_size: usize },

    #[error("Worker pool error: {0}")]
    Worker(String),
}

impl actix_web::ResponseError for ImageServerError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            ImageServerError::Compression(err) => match err {
                CompressionError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CompressionError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                CompressionError::BatchCapExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                CompressionError::EncodeExhausted { .. } | CompressionError::Encode { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ImageServerError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            ImageServerError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ImageServerError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        use actix_web::HttpResponse;

        let status = self.status_code();
        match self {
            ImageServerError::Compression(err) => match err {
                CompressionError::BatchCapExceeded { limit, .. } => {
                    HttpResponse::build(status).json(serde_json::json!({
                        "error": err.kind(),
                        "message": self.to_string(),
                        "max_files": limit
                    }))
                }
                _ => HttpResponse::build(status).json(serde_json::json!({
                    "error": err.kind(),
                    "message": self.to_string()
                })),
            },
            ImageServerError::InvalidParameters(_) => {
                HttpResponse::build(status).json(serde_json::json!({
                    "error": "invalid_parameters",
                    "message": self.to_string()
                }))
            }
            ImageServerError::FileTooLarge { max_size } => {
                HttpResponse::build(status).json(serde_json::json!({
                    "error": "file_too_large",
                    "message": self.to_string(),
                    "max_size_bytes": max_size
                }))
            }
            ImageServerError::Worker(_) => {
                HttpResponse::build(status).json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred"
                }))
            }
        }
    }
}
