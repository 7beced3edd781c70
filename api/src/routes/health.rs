use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::analyze::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok" when healthy, "degraded" when the database is unreachable
    pub status: String,
    /// API version
    pub version: String,
    /// Whether the database is reachable
    pub database: bool,
    /// Number of registered forecast providers
    pub providers: usize,
}

impl HealthResponse {
    fn new(db_ok: bool, providers: usize) -> Self {
        Self {
            status: if db_ok { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_ok,
            providers,
        }
    }
}

/// Health check endpoint.
///
/// Always 200; reports "degraded" when `SELECT 1` fails so load balancers
/// can tell a partial failure from a dead process.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service status", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();
    if !db_ok {
        tracing::warn!("Health check: database unreachable");
    }
    Json(HealthResponse::new(db_ok, state.analysis.registry().names().len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_database() {
        let ok = HealthResponse::new(true, 2);
        assert_eq!(ok.status, "ok");
        assert_eq!(ok.providers, 2);
        assert_eq!(ok.version, env!("CARGO_PKG_VERSION"));

        let degraded = HealthResponse::new(false, 2);
        assert_eq!(degraded.status, "degraded");
        assert!(!degraded.database);
    }
}
