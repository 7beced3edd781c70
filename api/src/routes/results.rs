use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use super::analyze::AppState;
use crate::db::store::StoredAnalysis;
use crate::errors::{AppError, ErrorResponse};

/// Get a stored analysis result with its summary and per-sample segments.
///
/// Results still `processing` or `failed` are returned without summary and
/// with an empty segment list.
#[utoipa::path(
    get,
    path = "/api/v1/results/{id}",
    tag = "Analysis",
    params(
        ("id" = Uuid, Path, description = "Forecast result UUID"),
    ),
    responses(
        (status = 200, description = "Stored analysis", body = StoredAnalysis),
        (status = 404, description = "Result not found", body = ErrorResponse),
    )
)]
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoredAnalysis>, AppError> {
    let analysis = state
        .analysis
        .store()
        .load_analysis(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Result {} not found", id)))?;
    Ok(Json(analysis))
}
