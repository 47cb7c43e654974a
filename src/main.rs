pub mod api;
mod classify;
mod config;
mod fanout;
mod feed;
mod service;
mod storage;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use fanout::FanoutHub;
use feed::state::FeedStateStore;
use feed::FeedCollector;
use service::DepartureQueryService;

#[derive(OpenApi)]
#[openapi(
    info(title = "Transit Hub API", version = "0.1.0"),
    paths(
        api::departures::get_departures,
        api::health::health_check,
    ),
    components(schemas(
        api::ErrorResponse,
        api::health::HealthResponse,
        service::DepartureBoard,
        storage::DepartureRecord,
        feed::state::SourceStatus,
        feed::state::SourceHealth,
        feed::types::FeedKind,
    )),
    tags(
        (name = "departures", description = "Scheduled departures with live delays"),
        (name = "health", description = "Service and feed source health")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    config.validate();
    tracing::info!(
        feeds = config.feeds.len(),
        screens = config.screens.len(),
        "Loaded configuration"
    );

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Schedule repository stack selected by config (cache wrap included)
    let repository = storage::build_repository(&config.schedule, &config.cache)
        .await
        .expect("Failed to initialize schedule repository");

    // Realtime state, fanout hub, and the query service on top of both
    let feed_state = Arc::new(FeedStateStore::new());
    let hub = Arc::new(FanoutHub::new(feed_state.clone(), config.fanout.clone()));
    let query_service = Arc::new(DepartureQueryService::new(
        repository,
        feed_state.clone(),
        &config.query,
        &config.schedule,
    ));

    // Start the feed polling loops in the background
    let collector = Arc::new(
        FeedCollector::new(
            config.feeds.clone(),
            config.collector.clone(),
            feed_state.clone(),
            hub.clone(),
        )
        .expect("Failed to initialize feed collector"),
    );
    tokio::spawn(async move {
        collector.start().await;
    });

    // Build the app
    let app = Router::new()
        .route("/", get(root))
        .nest(
            "/api",
            api::router(&config, query_service, feed_state, hub),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000")
        .await
        .expect("Failed to bind to port 3000");

    tracing::info!("Server running on http://localhost:3000");
    tracing::info!("Swagger UI: http://localhost:3000/swagger-ui");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "Transit Hub API"
}
