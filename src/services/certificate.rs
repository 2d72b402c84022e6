// src/services/certificate.rs
//
// Certificate outbox. The issuance claim is transactional and authoritative;
// the HTML asset is rendered afterwards and may fail and be retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        certificate::{Certificate, CertificateStatus, NewCertificate},
        course::Course,
        enrollment::{Enrollment, EnrollmentStatus},
    },
    repository::{CertificateRepository, CourseRepository, EnrollmentRepository, Repositories},
    utils::html::{clean_html, escape_text},
};

/// Produces the certificate asset.
pub trait CertificateRenderer: Send + Sync {
    fn render(&self, certificate: &Certificate, course: &Course) -> Result<String, AppError>;
}

/// Renders a self-contained HTML fragment.
pub struct HtmlCertificateRenderer;

impl CertificateRenderer for HtmlCertificateRenderer {
    fn render(&self, certificate: &Certificate, course: &Course) -> Result<String, AppError> {
        let snapshot = &certificate.snapshot;
        let body = format!(
            concat!(
                "<div class=\"certificate\">",
                "<h1>Certificate of Completion</h1>",
                "<p>Student <strong>#{student}</strong> has completed</p>",
                "<h2>{course}</h2>",
                "<p>{lessons} lessons and {exams} exams completed</p>",
                "<p>Issued {issued}</p>",
                "<p>Verification code: <code>{code}</code></p>",
                "</div>"
            ),
            student = certificate.student_id,
            course = escape_text(&course.title),
            lessons = snapshot.completed_lesson_ids.len(),
            exams = snapshot.completed_exam_ids.len(),
            issued = certificate.issued_at.format("%Y-%m-%d"),
            code = escape_text(&certificate.code),
        );

        Ok(clean_html(&body))
    }
}

#[derive(Clone)]
pub struct CertificateService {
    certificates: Arc<dyn CertificateRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    courses: Arc<dyn CourseRepository>,
    renderer: Arc<dyn CertificateRenderer>,
}

impl CertificateService {
    pub fn new(repos: &Repositories, renderer: Arc<dyn CertificateRenderer>) -> Self {
        Self {
            certificates: repos.certificates.clone(),
            enrollments: repos.enrollments.clone(),
            courses: repos.courses.clone(),
            renderer,
        }
    }

    /// Claims issuance for a completed enrollment and queues asset generation.
    /// `None` when a certificate already exists.
    pub async fn issue(
        &self,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Option<Certificate>, AppError> {
        let issued = self.claim(enrollment, now).await?;
        if let Some(certificate) = &issued {
            self.spawn_generation(certificate.clone());
        }
        Ok(issued)
    }

    async fn claim(
        &self,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Option<Certificate>, AppError> {
        if enrollment.status != EnrollmentStatus::Completed {
            return Err(AppError::PolicyViolation(
                "Enrollment is not completed".to_string(),
            ));
        }
        let snapshot = enrollment
            .completion_snapshot
            .as_ref()
            .map(|s| s.0.clone())
            .ok_or(AppError::InternalServerError(
                "Completed enrollment has no completion snapshot".to_string(),
            ))?;

        let issued = self
            .certificates
            .issue_once(NewCertificate {
                enrollment_id: enrollment.id,
                student_id: enrollment.student_id,
                course_id: enrollment.course_id,
                code: Uuid::new_v4().to_string(),
                snapshot,
                issued_at: now,
            })
            .await?;

        match &issued {
            Some(certificate) => tracing::info!(
                certificate_id = certificate.id,
                enrollment_id = enrollment.id,
                "Certificate issued"
            ),
            None => tracing::debug!(
                enrollment_id = enrollment.id,
                "Certificate already issued, skipping"
            ),
        }

        Ok(issued)
    }

    /// Fire-and-forget asset rendering.
    pub fn spawn_generation(&self, certificate: Certificate) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.generate_asset(&certificate, Utc::now()).await {
                tracing::error!(
                    certificate_id = certificate.id,
                    "Certificate generation could not be recorded: {}",
                    e
                );
            }
        });
    }

    /// Renders and stores the asset. A render failure is recorded on the
    /// certificate (status `failed`) rather than returned.
    pub async fn generate_asset(
        &self,
        certificate: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<Certificate, AppError> {
        let rendered = match self.courses.find_course(certificate.course_id).await? {
            Some(course) => self.renderer.render(certificate, &course),
            None => Err(AppError::NotFound("Course not found".to_string())),
        };

        match rendered {
            Ok(html) => {
                let stored = self
                    .certificates
                    .mark_generated(certificate.id, html, now)
                    .await?;
                tracing::info!(certificate_id = stored.id, "Certificate asset generated");
                Ok(stored)
            }
            Err(e) => {
                tracing::error!(certificate_id = certificate.id, "Certificate render failed: {}", e);
                self.certificates.mark_failed(certificate.id, e.to_string()).await
            }
        }
    }

    /// RetryCertificate: issues the certificate of a completed enrollment if
    /// it is missing, or re-renders one that is not generated yet.
    pub async fn retry(&self, enrollment_id: i64, now: DateTime<Utc>) -> Result<Certificate, AppError> {
        let enrollment = self
            .enrollments
            .find(enrollment_id)
            .await?
            .ok_or(AppError::NotFound("Enrollment not found".to_string()))?;

        let certificate = match self.certificates.find_by_enrollment(enrollment.id).await? {
            Some(existing) => existing,
            None => match self.claim(&enrollment, now).await? {
                Some(issued) => issued,
                // Lost a race with another issuer.
                None => self
                    .certificates
                    .find_by_enrollment(enrollment.id)
                    .await?
                    .ok_or(AppError::Conflict(
                        "Certificate is flagged as issued but has no record".to_string(),
                    ))?,
            },
        };

        if certificate.status == CertificateStatus::Generated {
            return Ok(certificate);
        }
        self.generate_asset(&certificate, now).await
    }

    /// RegenerateCertificate: re-renders the asset of an existing certificate.
    pub async fn regenerate(&self, certificate_id: i64, now: DateTime<Utc>) -> Result<Certificate, AppError> {
        let certificate = self
            .certificates
            .find(certificate_id)
            .await?
            .ok_or(AppError::NotFound("Certificate not found".to_string()))?;

        self.generate_asset(&certificate, now).await
    }

    pub async fn find_for_enrollment(&self, enrollment_id: i64) -> Result<Option<Certificate>, AppError> {
        self.certificates.find_by_enrollment(enrollment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enrollment::CompletionSnapshot;
    use sqlx::types::Json;

    fn certificate() -> Certificate {
        Certificate {
            id: 1,
            enrollment_id: 2,
            student_id: 3,
            course_id: 4,
            code: "abc-123".to_string(),
            snapshot: Json(CompletionSnapshot {
                total_lessons: 2,
                total_exams: 1,
                completed_lesson_ids: vec![1, 2],
                completed_exam_ids: vec![9],
                progress: 100,
                captured_at: Utc::now(),
            }),
            status: CertificateStatus::Pending,
            asset_html: None,
            generation_attempts: 0,
            last_error: None,
            issued_at: Utc::now(),
            generated_at: None,
        }
    }

    #[test]
    fn render_escapes_course_title() {
        let course = Course {
            id: 4,
            title: "<script>alert('x')</script>Rust".to_string(),
        };
        let html = HtmlCertificateRenderer.render(&certificate(), &course).unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("abc-123"));
        assert!(html.contains("2 lessons and 1 exams"));
    }
}
