// src/handlers/admin.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::{
    error::AppError,
    models::{
        enrollment::CreateEnrollmentRequest, exam::CreateExamRequest,
        question::CreateQuestionRequest,
    },
    services::{
        catalog::CatalogService, certificate::CertificateService, enrollment::EnrollmentService,
        progress::ProgressAggregator,
    },
    utils::jwt::Claims,
};

/// Creates version 1 of a question.
/// Admin only.
pub async fn create_question(
    State(catalog): State<Arc<CatalogService>>,
    Json(payload): Json<CreateQuestionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let question = catalog.create_question(payload).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

/// Full question record including the answer key.
/// Admin only.
pub async fn get_question(
    State(catalog): State<Arc<CatalogService>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(catalog.get_question(id).await?))
}

/// Stores a new version and archives the revised one.
/// Admin only.
pub async fn revise_question(
    State(catalog): State<Arc<CatalogService>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(payload): Json<CreateQuestionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let revision = catalog.revise_question(id, payload).await?;
    tracing::info!(question_id = id, revised_by = %claims.sub, "Question revision stored");
    Ok((StatusCode::CREATED, Json(revision)))
}

/// Creates a draft exam.
/// Admin only.
pub async fn create_exam(
    State(catalog): State<Arc<CatalogService>>,
    Json(payload): Json<CreateExamRequest>,
) -> Result<impl IntoResponse, AppError> {
    let exam = catalog.create_exam(payload).await?;
    Ok((StatusCode::CREATED, Json(exam)))
}

pub async fn publish_exam(
    State(catalog): State<Arc<CatalogService>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(catalog.publish_exam(id).await?))
}

pub async fn archive_exam(
    State(catalog): State<Arc<CatalogService>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(catalog.archive_exam(id).await?))
}

/// Creates an enrollment (payment confirmed upstream).
/// Admin only.
pub async fn create_enrollment(
    State(enrollments): State<Arc<EnrollmentService>>,
    Json(payload): Json<CreateEnrollmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let enrollment = enrollments.create(payload, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// Recomputes an enrollment synchronously.
pub async fn recompute_enrollment(
    State(progress): State<Arc<ProgressAggregator>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(progress.recompute(id, Utc::now()).await?))
}

/// Issues a missing certificate or re-renders a failed one.
pub async fn retry_certificate(
    State(certificates): State<CertificateService>,
    Path(enrollment_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(certificates.retry(enrollment_id, Utc::now()).await?))
}

pub async fn regenerate_certificate(
    State(certificates): State<CertificateService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(certificates.regenerate(id, Utc::now()).await?))
}
