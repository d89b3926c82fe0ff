//! Kiosk scanning and attendance.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::NaiveDate;
use rollcall_engine::DailySummary;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::kiosk::AttendanceResult;
use crate::routes::{AppError, Result};

/// Scan request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub student_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadResponse {
    pub students: usize,
}

/// Create kiosk routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/kiosk/preload", post(preload_handler))
        .route("/kiosk/scan", post(scan_handler))
        .route("/attendance/mark", post(mark_handler))
        .route("/attendance/close/{date}", post(close_day_handler))
}

/// POST /kiosk/preload
async fn preload_handler(State(state): State<AppState>) -> Result<Json<PreloadResponse>> {
    let students = state.service.preload_for_kiosk().await?;
    Ok(Json(PreloadResponse { students }))
}

/// POST /kiosk/scan - Fast path; failures are reported in the body.
async fn scan_handler(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<AttendanceResult>> {
    let student_id = non_empty(&request.student_id)?;
    Ok(Json(state.service.mark_attendance_fast(student_id).await))
}

/// POST /attendance/mark - Remote-confirmed path.
async fn mark_handler(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<AttendanceResult>> {
    let student_id = non_empty(&request.student_id)?;
    Ok(Json(state.service.mark_attendance(student_id).await))
}

/// POST /attendance/close/{date} - Mark absentees and save the summary.
async fn close_day_handler(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<DailySummary>> {
    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("invalid date '{}'", date)))?;
    Ok(Json(state.service.close_day(date).await?))
}

fn non_empty(student_id: &str) -> Result<&str> {
    let trimmed = student_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest("studentId is required".to_string()));
    }
    Ok(trimmed)
}
