// Against the Wind API v0.1
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::{AppConfig, PipelineConfig};
use db::store::PgResultStore;
use routes::analyze::AppState;
use services::analysis::AnalysisService;
use services::open_meteo::OpenMeteoProvider;
use services::provider::ProviderRegistry;
use services::yr::YrProvider;

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 10;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

/// Against the Wind API OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Against the Wind API",
        version = "0.1.0",
        description = "Head/cross/tail wind analysis for cycling routes. \
            Upload a GPX route, pick a departure time and forecast provider, and \
            stream a per-kilometre wind classification with a ride summary.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Routes", description = "GPX route upload and metadata"),
        (name = "Analysis", description = "Wind analysis jobs and stored results"),
    ),
    paths(
        routes::health::health_check,
        routes::route_files::upload_route,
        routes::route_files::get_route,
        routes::route_files::get_route_coordinates,
        routes::route_files::list_route_results,
        routes::analyze::analyze,
        routes::results::get_result,
        routes::providers::list_providers,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::route_files::RouteResponse,
            routes::route_files::RouteCoordinate,
            routes::providers::ProvidersResponse,
            services::analysis::SegmentWind,
            services::analysis::AnalysisEvent,
            services::summary::Summary,
            services::classify::WindClass,
            services::timing::TimingMode,
            services::timing::GpxSubMode,
            db::store::ResultRecord,
            db::store::ResultStatus,
            db::store::StoredAnalysis,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "against_wind_api=debug,tower_http=debug".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Database migrations completed");

    let pipeline = config.pipeline();
    seed_routes(&pool, &pipeline, &config.data_dir).await;

    // Forecast providers
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(OpenMeteoProvider::new(
        &config.open_meteo_base_url,
        &config.open_meteo_archive_url,
        config.forecast_timeout(),
        config.rider_height_m,
    )));
    registry.register(Arc::new(YrProvider::new(
        &config.yr_base_url,
        &config.yr_user_agent,
        config.forecast_timeout(),
        config.rider_height_m,
    )));
    tracing::info!("Forecast providers: {}", registry.names().join(", "));

    let store = Arc::new(PgResultStore::new(pool.clone()));
    let app_state = AppState {
        pool,
        analysis: AnalysisService::new(registry, store, pipeline),
    };

    // CORS: GET for reads and SSE, POST for GPX upload
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/routes", post(routes::route_files::upload_route))
        .route("/api/v1/routes/:id", get(routes::route_files::get_route))
        .route(
            "/api/v1/routes/:id/coordinates",
            get(routes::route_files::get_route_coordinates),
        )
        .route(
            "/api/v1/routes/:id/results",
            get(routes::route_files::list_route_results),
        )
        .route("/api/v1/analyze", get(routes::analyze::analyze))
        .route("/api/v1/results/:id", get(routes::results::get_result))
        .route("/api/v1/providers", get(routes::providers::list_providers))
        .with_state(app_state);

    let app = Router::new()
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}

/// Store every GPX file in `data_dir` whose name is not yet a route.
async fn seed_routes(pool: &PgPool, pipeline: &PipelineConfig, data_dir: &str) {
    let dir = std::path::Path::new(data_dir);
    let files = match services::gpx::load_gpx_from_dir(dir) {
        Ok(files) => files,
        Err(e) => {
            tracing::error!("Failed to load GPX files from {}: {}", dir.display(), e);
            return;
        }
    };
    if files.is_empty() {
        tracing::warn!("No GPX files found in {}", dir.display());
    }

    for (name, xml) in &files {
        match db::queries::find_route_by_name(pool, name).await {
            Ok(Some(id)) => tracing::debug!("Route '{}' already seeded (id={})", name, id),
            Ok(None) => {
                match routes::route_files::import_route(pool, pipeline, Some(name), xml).await {
                    Ok(imported) if imported.created => {
                        tracing::info!("Seeded route '{}' → id={}", name, imported.id)
                    }
                    Ok(imported) => tracing::info!(
                        "Seed file '{}' matches stored route {}",
                        name,
                        imported.id
                    ),
                    Err(e) => tracing::error!("Failed to seed route '{}': {}", name, e),
                }
            }
            Err(e) => tracing::error!("Failed to look up route '{}': {}", name, e),
        }
    }
}
