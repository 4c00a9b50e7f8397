use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse, Result};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use log::{error, info};
use serde::Deserialize;
use std::collections::HashMap;

use crate::compressor::{CompressionResult, Compressor, ImageInfo, InputFile, MAX_BATCH_FILES};
use crate::config::Config;
use crate::errors::{CompressionError, ImageServerError};
use crate::format::OutputFormat;
use crate::options::CompressionOptions;

const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// Parameters accepted in the query string. The same names are accepted as
/// multipart text fields; the query string wins when both are present.
#[derive(Debug, Default, Deserialize)]
pub struct CompressionQuery {
    pub quality: Option<u32>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub format: Option<String>,
    pub preserve_name: Option<bool>,
}

pub struct FileUpload {
    pub data: Bytes,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl FileUpload {
    pub fn new() -> Self {
        Self {
            data: Bytes::new(),
            filename: None,
            content_type: None,
        }
    }
}

impl Default for FileUpload {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(name: &str, raw: &str) -> std::result::Result<u32, ImageServerError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ImageServerError::InvalidParameters(format!("{} must be a non-negative integer, got '{}'", name, raw)))
}

fn parse_flag(name: &str, raw: &str) -> std::result::Result<bool, ImageServerError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ImageServerError::InvalidParameters(format!("{} must be a boolean, got '{}'", name, raw))),
    }
}

/// Builds engine options from the query string and multipart text fields.
/// A quality outside 1-100 is passed on as unset.
pub fn build_options(
    query: &CompressionQuery,
    form: &HashMap<String, String>,
) -> std::result::Result<CompressionOptions, ImageServerError> {
    let number = |from_query: Option<u32>, name: &str| -> std::result::Result<Option<u32>, ImageServerError> {
        match (from_query, form.get(name)) {
            (Some(value), _) => Ok(Some(value)),
            (None, Some(raw)) => parse_number(name, raw).map(Some),
            (None, None) => Ok(None),
        }
    };

    let quality = number(query.quality, "quality")?;
    let max_width = number(query.max_width, "max_width")?.unwrap_or(0);
    let max_height = number(query.max_height, "max_height")?.unwrap_or(0);

    let output_format = match query.format.as_deref().or_else(|| form.get("format").map(String::as_str)) {
        Some(raw) => raw.parse::<OutputFormat>()?,
        None => OutputFormat::Auto,
    };

    let preserve_original_name = match (query.preserve_name, form.get("preserve_name")) {
        (Some(value), _) => value,
        (None, Some(raw)) => parse_flag("preserve_name", raw)?,
        (None, None) => false,
    };

    Ok(CompressionOptions {
        quality: quality.and_then(|q| u8::try_from(q).ok()),
        max_width,
        max_height,
        output_format,
        preserve_original_name,
    })
}

pub async fn compress_endpoint(
    mut payload: Multipart,
    query: web::Query<CompressionQuery>,
    config: web::Data<Config>,
    compressor: web::Data<Compressor>,
) -> Result<HttpResponse> {
    let mut file_upload: Option<FileUpload> = None;
    let mut form_params = HashMap::new();

    while let Some(field) = payload.try_next().await? {
        let field_name = field.name().to_string();

        if field_name == "file" {
            file_upload = Some(process_file_field(field, config.max_file_size_bytes()).await?);
        } else {
            let value = process_text_field(field).await?;
            form_params.insert(field_name, value);
        }
    }

    let file_upload = match file_upload {
        Some(upload) => upload,
        None => {
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "missing_file",
                "message": "No file provided in 'file' field"
            })));
        }
    };

    let options = build_options(&query, &form_params)?;

    info!(
        "Processing file: {} ({} bytes, {}) with {:?}",
        file_upload.filename.as_deref().unwrap_or("unknown"),
        file_upload.data.len(),
        file_upload.content_type.as_deref().unwrap_or("no content type"),
        options
    );

    let data = file_upload.data.clone();
    let engine = compressor.into_inner();
    let block_options = options.clone();
    let outcome = web::block(move || engine.compress(&data, &block_options))
        .await
        .map_err(|e| ImageServerError::Worker(e.to_string()))?;

    let CompressionResult { data, info: image_info } = match outcome {
        Ok(result) => result,
        Err(err) => {
            error!(
                "Compression failed for {}: {}",
                file_upload.filename.as_deref().unwrap_or("unknown"),
                err
            );
            return Err(ImageServerError::from(err).into());
        }
    };

    if config.logging.log_compression_stats {
        log_stats(file_upload.filename.as_deref(), &image_info);
    }

    let filename = output_filename(
        file_upload.filename.as_deref(),
        &image_info.format,
        options.preserve_original_name,
    );

    Ok(HttpResponse::Ok()
        .content_type(content_type_for(&image_info.format))
        .insert_header(("X-Original-Size", image_info.original_size.to_string()))
        .insert_header(("X-Compressed-Size", image_info.compressed_size.to_string()))
        .insert_header(("X-Compression-Ratio", format!("{:.4}", image_info.ratio)))
        .insert_header(("X-Image-Width", image_info.width.to_string()))
        .insert_header(("X-Image-Height", image_info.height.to_string()))
        .insert_header(("X-Image-Format", image_info.format.clone()))
        .insert_header(("X-Quality-Score", image_info.quality_score.to_string()))
        .insert_header(("X-Is-Animated", image_info.is_animated.to_string()))
        .insert_header(("X-Frame-Count", image_info.frame_count.to_string()))
        .insert_header(("X-Image-Info", serde_json::to_string(&image_info).unwrap_or_default()))
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename),
        ))
        .body(data))
}

pub async fn batch_endpoint(
    mut payload: Multipart,
    query: web::Query<CompressionQuery>,
    config: web::Data<Config>,
    compressor: web::Data<Compressor>,
) -> Result<HttpResponse> {
    let mut uploads: Vec<FileUpload> = Vec::new();
    let mut form_params = HashMap::new();

    while let Some(field) = payload.try_next().await? {
        let field_name = field.name().to_string();

        if field_name == "files" || field_name == "file" {
            if uploads.len() >= MAX_BATCH_FILES {
                return Err(ImageServerError::from(CompressionError::BatchCapExceeded {
                    submitted: uploads.len() + 1,
                    limit: MAX_BATCH_FILES,
                })
                .into());
            }
            uploads.push(process_file_field(field, config.max_file_size_bytes()).await?);
        } else {
            let value = process_text_field(field).await?;
            form_params.insert(field_name, value);
        }
    }

    if uploads.is_empty() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "missing_file",
            "message": "No files provided in 'files' fields"
        })));
    }

    let options = build_options(&query, &form_params)?;
    info!("Processing batch of {} file(s) with {:?}", uploads.len(), options);

    let original_names: Vec<Option<String>> = uploads.iter().map(|u| u.filename.clone()).collect();
    let files: Vec<InputFile> = uploads
        .into_iter()
        .enumerate()
        .map(|(index, upload)| {
            let name = upload.filename.unwrap_or_else(|| format!("file_{}", index + 1));
            InputFile::new(name, upload.data.to_vec())
        })
        .collect();

    let engine = compressor.into_inner();
    let block_options = options.clone();
    let items = web::block(move || engine.compress_multiple(&files, &block_options))
        .await
        .map_err(|e| ImageServerError::Worker(e.to_string()))?
        .map_err(ImageServerError::from)?;

    let mut succeeded = 0;
    let results: Vec<serde_json::Value> = items
        .iter()
        .zip(original_names.iter())
        .map(|(item, original)| match &item.outcome {
            Ok(result) => {
                succeeded += 1;
                if config.logging.log_compression_stats {
                    log_stats(Some(&item.filename), &result.info);
                }
                serde_json::json!({
                    "filename": item.filename,
                    "output_filename": output_filename(
                        original.as_deref(),
                        &result.info.format,
                        options.preserve_original_name,
                    ),
                    "info": result.info,
                })
            }
            Err(err) => serde_json::json!({
                "filename": item.filename,
                "output_filename": null,
                "error": {
                    "error": err.kind(),
                    "message": err.to_string(),
                },
            }),
        })
        .collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "total": results.len(),
        "succeeded": succeeded,
        "failed": results.len() - succeeded,
        "results": results,
    })))
}

fn log_stats(filename: Option<&str>, info: &ImageInfo) {
    info!(
        "Stats for {}: {} -> {} bytes (ratio {:.3}), {}x{} {}, {} frame(s), quality score {}",
        filename.unwrap_or("unknown"),
        info.original_size,
        info.compressed_size,
        info.ratio,
        info.width,
        info.height,
        info.format,
        info.frame_count,
        info.quality_score
    );
}

async fn process_file_field(mut field: Field, max_size_bytes: usize) -> Result<FileUpload> {
    let mut upload = FileUpload::new();

    upload.filename = field
        .content_disposition()
        .get_filename()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    upload.content_type = field.content_type().map(|ct| ct.to_string());

    let mut data = BytesMut::new();

    while let Some(chunk) = field.try_next().await? {
        if data.len() + chunk.len() > max_size_bytes {
            return Err(ImageServerError::FileTooLarge { max_size: max_size_bytes }.into());
        }

        data.extend_from_slice(&chunk);
    }

    upload.data = data.freeze();
    Ok(upload)
}

async fn process_text_field(mut field: Field) -> Result<String> {
    let mut data = Vec::new();

    while let Some(chunk) = field.try_next().await? {
        data.extend_from_slice(&chunk);

        if data.len() > MAX_TEXT_FIELD_BYTES {
            return Err(ImageServerError::InvalidParameters("Text field too long".to_string()).into());
        }
    }

    String::from_utf8(data)
        .map_err(|_| ImageServerError::InvalidParameters("Invalid UTF-8 in text field".to_string()).into())
}

pub fn content_type_for(format: &str) -> mime::Mime {
    match format {
        "jpeg" => mime::IMAGE_JPEG,
        "png" => mime::IMAGE_PNG,
        "gif" => mime::IMAGE_GIF,
        "bmp" => mime::IMAGE_BMP,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

fn extension_for(format: &str) -> &str {
    match format {
        "jpeg" => "jpg",
        "" => "bin",
        other => other,
    }
}

/// Name for a compressed file. `format` is the tag of the format actually
/// returned, which may differ from the uploaded one.
pub fn output_filename(original: Option<&str>, format: &str, preserve_original_name: bool) -> String {
    let original = original.filter(|name| !name.is_empty());

    if preserve_original_name {
        if let Some(name) = original {
            return name.to_string();
        }
    }

    let extension = extension_for(format);
    match original.and_then(|name| std::path::Path::new(name).file_stem().and_then(|s| s.to_str())) {
        Some(stem) => format!("{}_compressed.{}", stem, extension),
        None => format!("compressed_{}.{}", uuid::Uuid::new_v4(), extension),
    }
}

pub async fn health_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "image-compression-engine",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

pub async fn info_endpoint(config: web::Data<Config>, compressor: web::Data<Compressor>) -> Result<HttpResponse> {
    let settings = compressor.settings();
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "service": "Image Compression Engine",
        "version": env!("CARGO_PKG_VERSION"),
        "config": {
            "max_file_size_mb": config.server.max_file_size_mb,
            "jpeg_encoder": settings.jpeg_backend.name(),
            "png_mode": settings.png_mode.name(),
            "size_policy": settings.size_policy.name(),
            "parallel_batch": settings.parallel_batch,
            "max_batch_files": MAX_BATCH_FILES,
        },
        "supported_formats": {
            "input": ["jpeg", "png", "gif", "bmp", "webp", "tiff"],
            "output": ["auto", "jpeg", "png", "gif", "bmp"]
        },
        "usage": {
            "endpoints": {
                "/compress": "POST multipart/form-data with a 'file' field",
                "/compress/batch": "POST multipart/form-data with one or more 'files' fields"
            },
            "parameters": {
                "quality": "1-100, lossy formats only (optional, size-tiered default)",
                "max_width": "Maximum output width in pixels, 0 for unconstrained",
                "max_height": "Maximum output height in pixels, 0 for unconstrained",
                "format": "auto, jpeg, png, gif or bmp (default: auto)",
                "preserve_name": "Keep the uploaded file name (default: false)"
            }
        }
    })))
}
