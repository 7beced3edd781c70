use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::analyze::AppState;
use crate::services::open_meteo;
use crate::services::provider::ProviderRegistry;

/// Forecast providers an analysis can be run against.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProvidersResponse {
    /// Registered provider names, sorted
    pub providers: Vec<String>,
    /// Provider used when the request names none
    pub default: String,
}

impl From<&ProviderRegistry> for ProvidersResponse {
    fn from(registry: &ProviderRegistry) -> Self {
        Self {
            providers: registry.names(),
            default: open_meteo::PROVIDER_NAME.to_string(),
        }
    }
}

/// List available forecast providers.
#[utoipa::path(
    get,
    path = "/api/v1/providers",
    tag = "Analysis",
    responses(
        (status = 200, description = "Available forecast providers", body = ProvidersResponse),
    )
)]
pub async fn list_providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse::from(state.analysis.registry()))
}
