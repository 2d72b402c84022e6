// src/repository/mod.rs
//
// Storage seams, one trait per entity. Services receive the trait objects they
// need at assembly time; nothing looks storage up at runtime.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::AppError,
    models::{
        attempt::{ExamAttempt, GradedSubmission, NewAttempt},
        certificate::{Certificate, NewCertificate},
        course::{Course, Lesson, Section},
        enrollment::Enrollment,
        exam::{ExamDefinition, ExamStatus, NewExam},
        progress::{ExamStanding, Progress},
        question::{NewQuestion, Question},
    },
};

#[async_trait]
pub trait QuestionRepository: Send + Sync {
    async fn insert(&self, question: NewQuestion) -> Result<Question, AppError>;

    async fn find(&self, id: i64) -> Result<Option<Question>, AppError>;

    async fn find_many(&self, ids: &[i64]) -> Result<Vec<Question>, AppError>;

    /// Marks a version as superseded. Returns false if it was already archived.
    async fn archive(&self, id: i64) -> Result<bool, AppError>;
}

#[async_trait]
pub trait ExamRepository: Send + Sync {
    async fn insert(&self, exam: NewExam) -> Result<ExamDefinition, AppError>;

    async fn find(&self, id: i64) -> Result<Option<ExamDefinition>, AppError>;

    /// Every exam of the course regardless of status, ordered by id.
    async fn list_by_course(&self, course_id: i64) -> Result<Vec<ExamDefinition>, AppError>;

    /// Conditional status change; `None` when the exam was not in `from`.
    async fn transition_status(
        &self,
        id: i64,
        from: ExamStatus,
        to: ExamStatus,
    ) -> Result<Option<ExamDefinition>, AppError>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    async fn find(&self, id: i64) -> Result<Option<ExamAttempt>, AppError>;

    async fn find_in_progress(
        &self,
        exam_id: i64,
        student_id: i64,
    ) -> Result<Option<ExamAttempt>, AppError>;

    /// Atomic find-or-create of the single in-progress attempt for
    /// (exam, student). The flag is true when a new row was inserted.
    async fn create_or_resume(&self, attempt: NewAttempt) -> Result<(ExamAttempt, bool), AppError>;

    /// All attempts of the pair, oldest first.
    async fn list_for_student(
        &self,
        exam_id: i64,
        student_id: i64,
    ) -> Result<Vec<ExamAttempt>, AppError>;

    /// Moves an attempt to `submitted` only if it is still `in_progress`.
    async fn complete(
        &self,
        id: i64,
        submission: GradedSubmission,
    ) -> Result<Option<ExamAttempt>, AppError>;

    /// Moves an attempt to `expired` only if it is still `in_progress`.
    async fn expire(&self, id: i64) -> Result<Option<ExamAttempt>, AppError>;
}

#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn find_exam(&self, student_id: i64, exam_id: i64) -> Result<Option<Progress>, AppError>;

    /// Idempotent: completing a completed lesson keeps the first `completed_at`.
    async fn complete_lesson(
        &self,
        student_id: i64,
        course_id: i64,
        lesson_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Progress, AppError>;

    /// Overwrites the exam record with a standing derived from all attempts.
    async fn upsert_exam(&self, standing: ExamStanding) -> Result<Progress, AppError>;

    async fn list_for_course(&self, student_id: i64, course_id: i64) -> Result<Vec<Progress>, AppError>;
}

#[async_trait]
pub trait EnrollmentRepository: Send + Sync {
    async fn insert(
        &self,
        student_id: i64,
        course_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, AppError>;

    async fn find(&self, id: i64) -> Result<Option<Enrollment>, AppError>;

    async fn find_by_student_course(
        &self,
        student_id: i64,
        course_id: i64,
    ) -> Result<Option<Enrollment>, AppError>;

    /// Writes the row only if the stored version still equals
    /// `enrollment.version`, bumping it. `None` on a lost race.
    async fn save_if_version(&self, enrollment: &Enrollment) -> Result<Option<Enrollment>, AppError>;
}

/// Catalog reads. The catalog itself is maintained by the course CRUD subsystem.
#[async_trait]
pub trait CourseRepository: Send + Sync {
    async fn find_course(&self, id: i64) -> Result<Option<Course>, AppError>;

    /// Sections ordered by ascending `order`.
    async fn sections(&self, course_id: i64) -> Result<Vec<Section>, AppError>;

    async fn find_section(&self, id: i64) -> Result<Option<Section>, AppError>;

    async fn lessons(&self, course_id: i64) -> Result<Vec<Lesson>, AppError>;

    async fn find_lesson(&self, id: i64) -> Result<Option<Lesson>, AppError>;
}

#[async_trait]
pub trait CertificateRepository: Send + Sync {
    /// Atomically flips `enrollments.certificate_issued` from false to true and
    /// inserts the certificate. `None` if the flag was already set.
    async fn issue_once(&self, certificate: NewCertificate) -> Result<Option<Certificate>, AppError>;

    async fn find(&self, id: i64) -> Result<Option<Certificate>, AppError>;

    async fn find_by_enrollment(&self, enrollment_id: i64) -> Result<Option<Certificate>, AppError>;

    async fn mark_generated(
        &self,
        id: i64,
        asset_html: String,
        now: DateTime<Utc>,
    ) -> Result<Certificate, AppError>;

    async fn mark_failed(&self, id: i64, error: String) -> Result<Certificate, AppError>;
}

/// Every repository, resolved once when the service is assembled.
#[derive(Clone)]
pub struct Repositories {
    pub questions: Arc<dyn QuestionRepository>,
    pub exams: Arc<dyn ExamRepository>,
    pub attempts: Arc<dyn AttemptRepository>,
    pub progress: Arc<dyn ProgressRepository>,
    pub enrollments: Arc<dyn EnrollmentRepository>,
    pub courses: Arc<dyn CourseRepository>,
    pub certificates: Arc<dyn CertificateRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool));
        Self {
            questions: store.clone(),
            exams: store.clone(),
            attempts: store.clone(),
            progress: store.clone(),
            enrollments: store.clone(),
            courses: store.clone(),
            certificates: store,
        }
    }

    pub fn in_memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            questions: store.clone(),
            exams: store.clone(),
            attempts: store.clone(),
            progress: store.clone(),
            enrollments: store.clone(),
            courses: store.clone(),
            certificates: store,
        }
    }
}
