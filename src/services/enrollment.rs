// src/services/enrollment.rs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use validator::Validate;

use crate::{
    error::AppError,
    models::{
        enrollment::{CreateEnrollmentRequest, Enrollment, EnrollmentResponse},
        progress::Progress,
    },
    repository::{CertificateRepository, CourseRepository, EnrollmentRepository, ProgressRepository, Repositories},
    services::{
        progress::{ProgressEvent, ProgressPipeline},
        require_access,
        unlock::UnlockGate,
    },
};

pub struct EnrollmentService {
    enrollments: Arc<dyn EnrollmentRepository>,
    courses: Arc<dyn CourseRepository>,
    progress: Arc<dyn ProgressRepository>,
    certificates: Arc<dyn CertificateRepository>,
    unlock: Arc<UnlockGate>,
    pipeline: ProgressPipeline,
}

impl EnrollmentService {
    pub fn new(repos: &Repositories, unlock: Arc<UnlockGate>, pipeline: ProgressPipeline) -> Self {
        Self {
            enrollments: repos.enrollments.clone(),
            courses: repos.courses.clone(),
            progress: repos.progress.clone(),
            certificates: repos.certificates.clone(),
            unlock,
            pipeline,
        }
    }

    /// Stand-in for the payment-confirmed upstream.
    pub async fn create(
        &self,
        req: CreateEnrollmentRequest,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, AppError> {
        req.validate()?;

        self.courses
            .find_course(req.course_id)
            .await?
            .ok_or(AppError::NotFound("Course not found".to_string()))?;

        let enrollment = self.enrollments.insert(req.student_id, req.course_id, now).await?;
        tracing::info!(
            enrollment_id = enrollment.id,
            student_id = enrollment.student_id,
            course_id = enrollment.course_id,
            "Enrollment created"
        );
        Ok(enrollment)
    }

    /// GetMyEnrollment
    pub async fn get_mine(&self, course_id: i64, student_id: i64) -> Result<EnrollmentResponse, AppError> {
        let enrollment = self
            .enrollments
            .find_by_student_course(student_id, course_id)
            .await?
            .ok_or(AppError::NotFound("Enrollment not found".to_string()))?;

        let certificate = self.certificates.find_by_enrollment(enrollment.id).await?;

        Ok(EnrollmentResponse {
            enrollment,
            certificate,
        })
    }

    /// CompleteLesson. Idempotent; the progress event is published every time
    /// so a recompute that was lost can be retriggered by the student.
    pub async fn complete_lesson(
        &self,
        course_id: i64,
        lesson_id: i64,
        student_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Progress, AppError> {
        require_access(self.enrollments.as_ref(), course_id, student_id).await?;

        let lesson = self
            .courses
            .find_lesson(lesson_id)
            .await?
            .filter(|l| l.course_id == course_id)
            .ok_or(AppError::NotFound("Lesson not found".to_string()))?;

        if !lesson.is_published() {
            return Err(AppError::PolicyViolation("Lesson is not published".to_string()));
        }

        let section = self
            .courses
            .find_section(lesson.section_id)
            .await?
            .ok_or(AppError::NotFound("Section not found".to_string()))?;

        let decision = self
            .unlock
            .decide(course_id, student_id, Some(section.order))
            .await?;
        if !decision.unlocked {
            return Err(AppError::PolicyViolation(
                decision
                    .reason
                    .unwrap_or_else(|| "Lesson is locked".to_string()),
            ));
        }

        let record = self
            .progress
            .complete_lesson(student_id, course_id, lesson.id, now)
            .await?;

        tracing::info!(lesson_id, course_id, student_id, "Lesson completed");
        self.pipeline.publish(ProgressEvent::LessonCompleted {
            student_id,
            course_id,
            lesson_id: lesson.id,
        });

        Ok(record)
    }
}
