// src/handlers/course.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;

use crate::{
    error::AppError,
    services::{
        enrollment::EnrollmentService,
        unlock::{UnlockGate, UnlockTarget},
    },
    utils::jwt::Claims,
};

/// `?section_id=` or `?lesson_id=`; neither checks the whole course.
pub async fn check_unlock(
    State(gate): State<Arc<UnlockGate>>,
    Extension(claims): Extension<Claims>,
    Path(course_id): Path<i64>,
    Query(target): Query<UnlockTarget>,
) -> Result<impl IntoResponse, AppError> {
    let decision = gate.check(course_id, claims.user_id()?, target).await?;
    Ok(Json(decision))
}

pub async fn complete_lesson(
    State(enrollments): State<Arc<EnrollmentService>>,
    Extension(claims): Extension<Claims>,
    Path((course_id, lesson_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, AppError> {
    let record = enrollments
        .complete_lesson(course_id, lesson_id, claims.user_id()?, Utc::now())
        .await?;
    Ok(Json(record))
}

pub async fn get_my_enrollment(
    State(enrollments): State<Arc<EnrollmentService>>,
    Extension(claims): Extension<Claims>,
    Path(course_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let response = enrollments.get_mine(course_id, claims.user_id()?).await?;
    Ok(Json(response))
}
