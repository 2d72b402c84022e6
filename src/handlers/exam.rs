// src/handlers/exam.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::{error::AppError, services::attempt::ExamService, utils::jwt::Claims};

/// Exam policies plus the caller's attempt summary.
pub async fn get_exam_overview(
    State(exams): State<Arc<ExamService>>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let overview = exams.overview(exam_id, claims.user_id()?, Utc::now()).await?;
    Ok(Json(overview))
}

/// Starts an attempt, or returns the one already in progress.
/// 201 when created, 200 when resumed.
pub async fn start_attempt(
    State(exams): State<Arc<ExamService>>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let started = exams.start(exam_id, claims.user_id()?, Utc::now()).await?;

    let status = if started.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(started.attempt)))
}
