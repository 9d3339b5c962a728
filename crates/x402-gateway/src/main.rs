use std::path::PathBuf;

use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402_gateway::config::GlobalConfig;
use x402_gateway::metrics::register_metrics;
use x402_gateway::state::AppState;
use x402_gateway::{cors, discovery, pipeline, validation};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("TOLLBOOTH_CONFIG").unwrap_or_else(|_| "./tollbooth.yaml".to_string());
    let config = match GlobalConfig::load(&PathBuf::from(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config from {config_path}: {e}");
            std::process::exit(1);
        }
    };

    for (name, upstream) in &config.upstreams {
        if let Err(e) = validation::validate_target_url(&upstream.url) {
            tracing::error!("upstream {name:?} failed validation: {e}");
            std::process::exit(1);
        }
    }

    let port = config.gateway.port;
    let hostname = config.gateway.hostname.clone();
    let allowed_origins = config.gateway.cors.allowed_origins.clone();

    tracing::info!("starting tollbooth on {hostname}:{port}");
    tracing::info!("store backend: {:?}", config.stores.backend);
    tracing::info!("{} route(s) configured", config.routes.len());

    register_metrics();

    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("failed to initialize gateway state: {e}");
            std::process::exit(1);
        }
    };
    let state_data = web::Data::new(state);

    HttpServer::new(move || {
        let cors = cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(web::PayloadConfig::new(10 * 1024 * 1024))
            .wrap(Logger::default())
            .wrap(cors)
            .route("/.well-known/x402", web::get().to(discovery::discovery))
            .route("/.well-known/openapi.json", web::get().to(discovery::openapi))
            .route("/health", web::get().to(discovery::health))
            .route("/metrics", web::get().to(discovery::metrics))
            .default_service(web::route().to(pipeline::handle_request))
    })
    .bind((hostname.as_str(), port))?
    .run()
    .await
}
