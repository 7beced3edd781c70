//! Result persistence used by the analysis orchestrator.
//!
//! The orchestrator only writes at two checkpoints: when a job starts
//! (`create_result`) and when it reaches a terminal state (`complete_result`
//! or `fail_result`). `ResultStore` abstracts those writes so jobs can run
//! against Postgres in production and an in-memory store in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::models::{ForecastResultRow, SegmentWindRow, SummaryRow};
use super::queries;
use crate::helpers::{dec_to_f64, opt_dec_to_f64};
use crate::services::analysis::SegmentWind;
use crate::services::classify::WindClass;
use crate::services::summary::Summary;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Result {0} already reached a terminal state")]
    AlreadyFinished(Uuid),
    #[error("Stored data is inconsistent: {0}")]
    Corrupt(String),
}

/// Lifecycle of a forecast result. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Processing,
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Identity of an analysis request; equal keys are candidates for reuse.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub route_id: Uuid,
    pub depart_time: DateTime<Utc>,
    /// Comma-separated provider names, primary first.
    pub provider: String,
    pub timing_key: String,
}

/// Stored header of one analysis run.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ResultRecord {
    pub id: Uuid,
    pub route_id: Uuid,
    pub depart_time: DateTime<Utc>,
    pub provider: String,
    pub timing_key: String,
    pub model_run_id: Option<String>,
    pub status: ResultStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A result with its segments and summary, as consumers read it back.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StoredAnalysis {
    pub result: ResultRecord,
    pub summary: Option<Summary>,
    pub segments: Vec<SegmentWind>,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create a result in `processing`.
    async fn create_result(&self, new: &NewResult) -> Result<Uuid, StoreError>;

    /// Persist segments and summary and move the result to `completed`.
    async fn complete_result(
        &self,
        id: Uuid,
        model_run_id: Option<&str>,
        segments: &[SegmentWind],
        summary: &Summary,
    ) -> Result<(), StoreError>;

    /// Move the result to `failed`.
    async fn fail_result(&self, id: Uuid, message: &str) -> Result<(), StoreError>;

    /// Latest completed result for an identical request.
    async fn find_completed(&self, new: &NewResult) -> Result<Option<Uuid>, StoreError>;

    async fn load_analysis(&self, id: Uuid) -> Result<Option<StoredAnalysis>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn create_result(&self, new: &NewResult) -> Result<Uuid, StoreError> {
        Ok(queries::insert_forecast_result(
            &self.pool,
            new.route_id,
            new.depart_time,
            &new.provider,
            &new.timing_key,
        )
        .await?)
    }

    async fn complete_result(
        &self,
        id: Uuid,
        model_run_id: Option<&str>,
        segments: &[SegmentWind],
        summary: &Summary,
    ) -> Result<(), StoreError> {
        if queries::complete_forecast_result(&self.pool, id, model_run_id, segments, summary).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyFinished(id))
        }
    }

    async fn fail_result(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        if queries::fail_forecast_result(&self.pool, id, message).await? {
            Ok(())
        } else {
            Err(StoreError::AlreadyFinished(id))
        }
    }

    async fn find_completed(&self, new: &NewResult) -> Result<Option<Uuid>, StoreError> {
        Ok(queries::find_completed_result(
            &self.pool,
            new.route_id,
            new.depart_time,
            &new.provider,
            &new.timing_key,
        )
        .await?)
    }

    async fn load_analysis(&self, id: Uuid) -> Result<Option<StoredAnalysis>, StoreError> {
        let Some(row) = queries::get_forecast_result(&self.pool, id).await? else {
            return Ok(None);
        };
        let segments = queries::get_segments(&self.pool, id)
            .await?
            .into_iter()
            .map(SegmentWind::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let summary = queries::get_summary(&self.pool, id).await?.map(Summary::from);

        Ok(Some(StoredAnalysis {
            result: ResultRecord::try_from(row)?,
            summary,
            segments,
        }))
    }
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

impl TryFrom<ForecastResultRow> for ResultRecord {
    type Error = StoreError;

    fn try_from(r: ForecastResultRow) -> Result<Self, Self::Error> {
        let status = ResultStatus::parse(&r.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", r.status)))?;
        Ok(Self {
            id: r.id,
            route_id: r.route_id,
            depart_time: r.depart_time,
            provider: r.provider,
            timing_key: r.timing_key,
            model_run_id: r.model_run_id,
            status,
            error_message: r.error_message,
            created_at: r.created_at,
            finished_at: r.finished_at,
        })
    }
}

impl TryFrom<SegmentWindRow> for SegmentWind {
    type Error = StoreError;

    fn try_from(r: SegmentWindRow) -> Result<Self, Self::Error> {
        let wind_class = WindClass::parse(&r.wind_class)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown wind class '{}'", r.wind_class)))?;
        Ok(Self {
            seq: r.seq.max(0) as usize,
            time_utc: r.time_utc,
            lat: dec_to_f64(r.lat),
            lon: dec_to_f64(r.lon),
            distance_km: dec_to_f64(r.distance_m) / 1000.0,
            bearing_deg: dec_to_f64(r.bearing_deg),
            wind_dir_deg10m: dec_to_f64(r.wind_dir_deg10m),
            wind_ms10m: dec_to_f64(r.wind_ms10m),
            wind_ms_rider: dec_to_f64(r.wind_ms_rider),
            yaw_deg: dec_to_f64(r.yaw_deg),
            wind_class,
            gust_ms: opt_dec_to_f64(r.gust_ms),
            confidence: dec_to_f64(r.confidence),
            model_run_id: r.model_run_id,
        })
    }
}

impl From<SummaryRow> for Summary {
    fn from(r: SummaryRow) -> Self {
        Self {
            head_pct: dec_to_f64(r.head_pct),
            cross_pct: dec_to_f64(r.cross_pct),
            tail_pct: dec_to_f64(r.tail_pct),
            longest_head_km: dec_to_f64(r.longest_head_km),
            best_departure: r.best_departure,
            provider_spread_ms: opt_dec_to_f64(r.provider_spread_ms),
            resolved_samples: r.resolved_samples.max(0) as usize,
            unresolved_samples: r.unresolved_samples.max(0) as usize,
            notes: r.notes,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation for orchestrator tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryResultStore {
        entries: Mutex<HashMap<Uuid, (NewResult, StoredAnalysis)>>,
    }

    impl MemoryResultStore {
        pub async fn status_of(&self, id: Uuid) -> Option<ResultStatus> {
            self.entries.lock().await.get(&id).map(|(_, a)| a.result.status)
        }

        pub async fn statuses(&self) -> Vec<ResultStatus> {
            self.entries
                .lock()
                .await
                .values()
                .map(|(_, a)| a.result.status)
                .collect()
        }

        async fn finish(
            &self,
            id: Uuid,
            apply: impl FnOnce(&mut StoredAnalysis),
        ) -> Result<(), StoreError> {
            let mut entries = self.entries.lock().await;
            let (_, analysis) = entries
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("result {}", id)))?;
            if analysis.result.status != ResultStatus::Processing {
                return Err(StoreError::AlreadyFinished(id));
            }
            apply(analysis);
            analysis.result.finished_at = Some(Utc::now());
            Ok(())
        }
    }

    #[async_trait]
    impl ResultStore for MemoryResultStore {
        async fn create_result(&self, new: &NewResult) -> Result<Uuid, StoreError> {
            let id = Uuid::new_v4();
            let record = ResultRecord {
                id,
                route_id: new.route_id,
                depart_time: new.depart_time,
                provider: new.provider.clone(),
                timing_key: new.timing_key.clone(),
                model_run_id: None,
                status: ResultStatus::Processing,
                error_message: None,
                created_at: Utc::now(),
                finished_at: None,
            };
            self.entries.lock().await.insert(
                id,
                (
                    new.clone(),
                    StoredAnalysis {
                        result: record,
                        summary: None,
                        segments: Vec::new(),
                    },
                ),
            );
            Ok(id)
        }

        async fn complete_result(
            &self,
            id: Uuid,
            model_run_id: Option<&str>,
            segments: &[SegmentWind],
            summary: &Summary,
        ) -> Result<(), StoreError> {
            self.finish(id, |a| {
                a.result.status = ResultStatus::Completed;
                a.result.model_run_id = model_run_id.map(str::to_string);
                a.segments = segments.to_vec();
                a.summary = Some(summary.clone());
            })
            .await
        }

        async fn fail_result(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
            self.finish(id, |a| {
                a.result.status = ResultStatus::Failed;
                a.result.error_message = Some(message.to_string());
            })
            .await
        }

        async fn find_completed(&self, new: &NewResult) -> Result<Option<Uuid>, StoreError> {
            Ok(self
                .entries
                .lock()
                .await
                .iter()
                .find(|(_, (key, a))| key == new && a.result.status == ResultStatus::Completed)
                .map(|(id, _)| *id))
        }

        async fn load_analysis(&self, id: Uuid) -> Result<Option<StoredAnalysis>, StoreError> {
            Ok(self.entries.lock().await.get(&id).map(|(_, a)| a.clone()))
        }
    }
}
