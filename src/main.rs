use actix_web::middleware::{Condition, DefaultHeaders, Logger};
use actix_web::{web, App, HttpServer};
use img_compress_rs::{handlers, Compressor, Config};
use log::{error, info};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load configuration first
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize logger with configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level)).init();

    let settings = match config.compression.to_engine_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid compression settings: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
        }
    };

    info!("Starting Image Compression Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Server will listen on http://{}", config.bind_address());
    info!("Maximum payload size: {}MB", config.server.max_file_size_mb);
    info!("Engine settings: {}", settings);

    let bind_address = config.bind_address();
    let max_payload_size = config.max_file_size_bytes();
    let worker_threads = config.server.worker_threads;
    let enable_cors = config.server.enable_cors;
    let request_logging = config.logging.enable_request_logging;

    let config = web::Data::new(config);
    let compressor = web::Data::new(Compressor::new(settings));

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(web::PayloadConfig::new(max_payload_size))
            .app_data(config.clone())
            .app_data(compressor.clone())
            .wrap(Condition::new(request_logging, Logger::default()))
            .wrap(Condition::new(
                enable_cors,
                DefaultHeaders::new()
                    .add(("Access-Control-Allow-Origin", "*"))
                    .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
                    .add(("Access-Control-Allow-Headers", "Content-Type, Authorization"))
                    .add(("Access-Control-Expose-Headers", "Content-Disposition, X-Image-Info")),
            ))
            .route("/health", web::get().to(handlers::health_check))
            .route("/info", web::get().to(handlers::info_endpoint))
            .route("/compress", web::post().to(handlers::compress_endpoint))
            .route("/compress/batch", web::post().to(handlers::batch_endpoint))
    });

    if let Some(workers) = worker_threads {
        server = server.workers(workers);
    }

    server.bind(&bind_address)?.run().await
}
