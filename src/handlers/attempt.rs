// src/handlers/attempt.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
    response::IntoResponse,
};
use chrono::Utc;

use crate::{
    error::AppError,
    models::attempt::SubmitAttemptRequest,
    services::{Viewer, attempt::ExamService},
    utils::jwt::Claims,
};

/// Grades and records a submission.
///
/// Progress is updated asynchronously; the response never waits for it.
pub async fn submit_attempt(
    State(exams): State<Arc<ExamService>>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
    Json(req): Json<SubmitAttemptRequest>,
) -> Result<impl IntoResponse, AppError> {
    let summary = exams
        .submit(attempt_id, claims.user_id()?, req, Utc::now())
        .await?;
    Ok(Json(summary))
}

pub async fn get_attempt(
    State(exams): State<Arc<ExamService>>,
    Extension(claims): Extension<Claims>,
    Path(attempt_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let viewer = Viewer::from_claims(&claims)?;
    let view = exams.get_attempt(attempt_id, viewer, Utc::now()).await?;
    Ok(Json(view))
}
