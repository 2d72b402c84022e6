// src/services/mod.rs
//
// Core engines. Handlers stay thin and call into these with an explicit `now`.

pub mod attempt;
pub mod catalog;
pub mod certificate;
pub mod enrollment;
pub mod grading;
pub mod progress;
pub mod unlock;

use crate::{
    error::AppError,
    models::enrollment::Enrollment,
    repository::EnrollmentRepository,
    utils::jwt::Claims,
};

/// Who is asking, resolved from the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Viewer {
    pub fn student(user_id: i64) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn from_claims(claims: &Claims) -> Result<Self, AppError> {
        Ok(Self {
            user_id: claims.user_id()?,
            is_admin: claims.is_admin(),
        })
    }
}

/// Loads the enrollment of `student_id` in `course_id` and checks that it
/// still grants access to course content.
pub async fn require_access(
    enrollments: &dyn EnrollmentRepository,
    course_id: i64,
    student_id: i64,
) -> Result<Enrollment, AppError> {
    let enrollment = enrollments
        .find_by_student_course(student_id, course_id)
        .await?
        .ok_or(AppError::Forbidden("Not enrolled in this course".to_string()))?;

    if !enrollment.grants_access() {
        return Err(AppError::Forbidden(
            "Enrollment does not grant access to this course".to_string(),
        ));
    }

    Ok(enrollment)
}
